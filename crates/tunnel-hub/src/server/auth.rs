//! Authentication handshake.
//!
//! 1. AP/client sends `Hello`.
//! 2. Hub replies `ServerHello` carrying a session id and random nonce.
//! 3. AP/client sends `Auth` (pubkey signature; password is a stub that
//!    always fails, same as the donor protocol).
//! 4. Hub verifies the presented key against [`tunnel_store::PrincipalStore`]
//!    and replies `AuthOk` or `AuthFail`.
//!
//! The `user` field of `Auth` carries the `principal[:ap_name[:proxy_user]]`
//! convention (§4.5): two segments name a client reaching a published
//! service; three segments are an SSH-to-AP proxy session.

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::messages::{Auth, AuthFail, AuthMethod, AuthOk, Hello, ServerHello, PROTOCOL_VERSION};
use tunnel_store::PrincipalStore;

/// Parsed `principal[:ap_name[:proxy_user]]` identity for one authenticated
/// session, built once during auth and threaded explicitly through handlers.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub principal: String,
    pub is_ap: bool,
    pub ap_name: Option<String>,
    pub proxy_user: Option<String>,
}

impl SessionContext {
    /// `true` when this session is an SSH-to-AP proxy session (3 segments).
    pub fn is_proxy(&self) -> bool {
        self.proxy_user.is_some()
    }
}

fn parse_user(user: &str) -> (String, Option<String>, Option<String>) {
    let mut parts = user.splitn(3, ':');
    let principal = parts.next().unwrap_or_default().to_string();
    let ap_name = parts.next().map(str::to_string);
    let proxy_user = parts.next().map(str::to_string);
    (principal, ap_name, proxy_user)
}

/// Outcome of a successful authentication.
#[derive(Debug)]
pub struct AuthResult {
    pub context: SessionContext,
    pub fingerprint: String,
    pub token: Vec<u8>,
    pub session_id: String,
}

pub struct HelloResult {
    pub server_hello: ServerHello,
    pub session_id: String,
    pub nonce: Vec<u8>,
}

pub fn handle_hello(hello: &Hello) -> TunnelResult<HelloResult> {
    if hello.protocol_version != PROTOCOL_VERSION {
        return Err(TunnelError::InvalidMessage(format!(
            "unsupported protocol version: {} (expected {})",
            hello.protocol_version, PROTOCOL_VERSION
        )));
    }

    let session_id = generate_session_id();
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill(&mut nonce[..]);

    debug!(%session_id, "received Hello");

    Ok(HelloResult {
        server_hello: ServerHello {
            session_id: session_id.clone(),
            nonce: nonce.clone(),
        },
        session_id,
        nonce,
    })
}

/// Transcript signed by the client: `SHA-256(PROTOCOL_VERSION || "\0" || session_id || nonce)`.
fn build_transcript(session_id: &str, nonce: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(PROTOCOL_VERSION.as_bytes());
    hasher.update(b"\0");
    hasher.update(session_id.as_bytes());
    hasher.update(nonce);
    hasher.finalize().to_vec()
}

#[allow(clippy::too_many_arguments)]
pub async fn verify_auth(
    auth: &Auth,
    nonce: &[u8],
    session_id: &str,
    principals: &PrincipalStore,
    server_secret: &[u8],
    session_ttl: u64,
) -> TunnelResult<AuthResult> {
    let (principal, ap_name, proxy_user) = parse_user(&auth.user);

    match auth.method {
        AuthMethod::PublicKey => {
            verify_pubkey_auth(
                auth,
                nonce,
                session_id,
                principals,
                server_secret,
                session_ttl,
                principal,
                ap_name,
                proxy_user,
            )
            .await
        }
        AuthMethod::Password => {
            warn!(user = %auth.user, "password auth attempted but not supported");
            Err(TunnelError::Auth("password auth not supported".into()))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn verify_pubkey_auth(
    auth: &Auth,
    nonce: &[u8],
    session_id: &str,
    principals: &PrincipalStore,
    server_secret: &[u8],
    session_ttl: u64,
    principal: String,
    ap_name: Option<String>,
    proxy_user: Option<String>,
) -> TunnelResult<AuthResult> {
    let public_key = auth
        .public_key
        .as_ref()
        .ok_or_else(|| TunnelError::Auth("missing public_key in pubkey auth".into()))?;
    let signature = auth
        .signature
        .as_ref()
        .ok_or_else(|| TunnelError::Auth("missing signature in pubkey auth".into()))?;

    let outcome = principals
        .authenticate(&principal, public_key)
        .await
        .map_err(|e| TunnelError::Auth(e.to_string()))?;
    if !outcome.ok {
        warn!(%principal, "key not authorized");
        return Err(TunnelError::UnknownPrincipal(principal));
    }

    let transcript = build_transcript(session_id, nonce);
    let vk_bytes: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| TunnelError::Auth("invalid public key length".into()))?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&vk_bytes)
        .map_err(|e| TunnelError::Auth(format!("invalid public key: {e}")))?;
    let sig = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|e| TunnelError::Auth(format!("invalid signature: {e}")))?;

    use ed25519_dalek::Verifier;
    verifying_key
        .verify(&transcript, &sig)
        .map_err(|_| TunnelError::Auth("signature verification failed".into()))?;

    let fp = tunnel_core::fingerprint(public_key);
    let token = tunnel_core::create_token(server_secret, session_id, session_ttl);

    debug!(fingerprint = %tunnel_core::short_fingerprint(&fp, &[], 8), %principal, is_ap = outcome.is_ap, "pubkey auth OK");

    Ok(AuthResult {
        context: SessionContext {
            principal,
            is_ap: outcome.is_ap,
            ap_name,
            proxy_user,
        },
        fingerprint: fp,
        token,
        session_id: session_id.to_string(),
    })
}

pub fn build_auth_ok(is_ap: bool) -> AuthOk {
    AuthOk { is_ap }
}

pub fn build_auth_fail(reason: &str) -> AuthFail {
    AuthFail {
        reason: reason.to_string(),
    }
}

fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("../tunnel-store/migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn parse_user_splits_three_segments() {
        let (p, ap, proxy) = parse_user("alice:ap1:root");
        assert_eq!(p, "alice");
        assert_eq!(ap.as_deref(), Some("ap1"));
        assert_eq!(proxy.as_deref(), Some("root"));
    }

    #[test]
    fn parse_user_allows_bare_principal() {
        let (p, ap, proxy) = parse_user("alice");
        assert_eq!(p, "alice");
        assert!(ap.is_none());
        assert!(proxy.is_none());
    }

    #[test]
    fn hello_rejects_wrong_protocol_version() {
        let hello = Hello {
            protocol_version: "other-1".into(),
        };
        assert!(handle_hello(&hello).is_err());
    }

    #[tokio::test]
    async fn verify_auth_rejects_unknown_principal() {
        let pool = test_pool().await;
        let principals = PrincipalStore::new(pool);
        let auth = Auth {
            method: AuthMethod::PublicKey,
            user: "ghost".into(),
            public_key: Some(vec![0u8; 32]),
            signature: Some(vec![0u8; 64]),
            password: None,
        };
        let err = verify_auth(&auth, b"nonce", "sess", &principals, b"secret", 3600)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::UnknownPrincipal(_)));
    }

    #[tokio::test]
    async fn verify_auth_signs_and_checks_transcript() {
        let pool = test_pool().await;
        let principals = PrincipalStore::new(pool);

        let signing_key = ed25519_dalek::SigningKey::from_bytes(&[7u8; 32]);
        let verifying = signing_key.verifying_key();
        principals.add_user("ap1", true, true).await.unwrap();
        // auto-key-update path: first successful auth persists the key.
        principals
            .authenticate("ap1", verifying.as_bytes())
            .await
            .unwrap();

        let session_id = "sess-1";
        let nonce = b"0123456789abcdef0123456789abcdef".to_vec();
        let transcript = build_transcript(session_id, &nonce);
        use ed25519_dalek::Signer;
        let sig = signing_key.sign(&transcript);

        let auth = Auth {
            method: AuthMethod::PublicKey,
            user: "ap1:myap".into(),
            public_key: Some(verifying.as_bytes().to_vec()),
            signature: Some(sig.to_bytes().to_vec()),
            password: None,
        };
        let result = verify_auth(&auth, &nonce, session_id, &principals, b"secret", 3600)
            .await
            .unwrap();
        assert!(result.context.is_ap);
        assert_eq!(result.context.ap_name.as_deref(), Some("myap"));
        assert_eq!(result.token.len(), 40);
    }
}
