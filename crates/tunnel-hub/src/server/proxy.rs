//! SSH-to-AP proxy sessions (§4.5, three-segment `user`).
//!
//! A client authenticating as `principal:ap_name:proxy_user` is not talking
//! to the hub's own control plane at all — the hub transparently splices the
//! client's raw stream to the AP's `ssh` service listener and gets out of
//! the way, exactly as `original_source/server/proxy.go`'s `proxy` func
//! does by dialling a second `ssh.Client` against the registered listener
//! and forwarding channels/requests verbatim. Since the hub's transport
//! already carries byte streams rather than SSH channels, the splice here
//! is a plain bidirectional copy instead of a channel-by-channel relay.

use tokio::io::{AsyncRead, AsyncWrite};

use tunnel_core::error::{TunnelError, TunnelResult};

use crate::fabric::registry::{Resolution, ServiceRegistry};

/// Well-known service name an AP registers its SSH daemon under.
pub const SSH_SERVICE_NAME: &str = "ssh";

/// Splice a client's stream to the named AP's `ssh` service listener.
///
/// `proxy_user` is accepted for parity with the donor protocol (it becomes
/// the username the AP's own sshd sees) but is opaque to the hub — it is
/// carried, not interpreted, since the hub does not terminate SSH itself.
pub async fn run_proxy_session<S>(
    registry: &ServiceRegistry,
    ap_name: &str,
    proxy_user: &str,
    mut client: S,
) -> TunnelResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(ap = %ap_name, user = %proxy_user, "opening ssh-proxy session");

    let resolution = registry
        .get_listener(ap_name, SSH_SERVICE_NAME, None, || false)
        .await?;
    let Resolution::Direct { listener, _release } = resolution else {
        return Err(TunnelError::ResolveNoSuchService(format!(
            "{ap_name}/{SSH_SERVICE_NAME}"
        )));
    };

    let mut endpoint = listener.dial().await?;
    tokio::io::copy_bidirectional(&mut client, &mut endpoint)
        .await
        .map_err(TunnelError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::listener::VirtualListener;

    #[tokio::test]
    async fn proxy_session_splices_to_registered_ssh_listener() {
        use std::sync::Arc;
        let registry = Arc::new(ServiceRegistry::new());
        let listener = VirtualListener::new("ssh");
        registry
            .register("ap1", "10.0.0.1:1", "unix:ssh", listener.clone())
            .await
            .unwrap();

        let accept_task = tokio::spawn(async move {
            let mut endpoint = listener.accept().await.unwrap();
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = [0u8; 2];
            endpoint.read_exact(&mut buf).await.unwrap();
            endpoint.write_all(&buf).await.unwrap();
        });

        let (mut client_side, far_side) = tokio::io::duplex(4096);
        let registry2 = registry.clone();
        let run_task =
            tokio::spawn(async move { run_proxy_session(registry2.as_ref(), "ap1", "root", far_side).await });

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_side.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        client_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");

        drop(client_side);
        accept_task.await.unwrap();
        let _ = run_task.await;
    }
}
