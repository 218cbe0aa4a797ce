//! Main reconnect loop: dial the hub, authenticate, register every
//! configured service over a reverse forward, and splice accepted channels
//! to local backends. Reconnects with a backoff delayer on transport close,
//! interruptible by a shutdown signal (mirrors the hub's `CancellationToken`
//! cascade).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tunnel_core::error::{TunnelError, TunnelResult};
use tunnel_core::messages::{
    Auth, AuthMethod, ControlMessage, Hello, ReverseForwardRequest, PROTOCOL_VERSION,
};

use crate::auth;
use crate::config::{AgentConfig, ServiceSpec};
use crate::mux::{read_frame, write_frame, Mux};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Run `connections_count` independent tunnel sessions, each registering
/// every configured service, until `shutdown` fires.
pub async fn run(config: AgentConfig, signing_key: SigningKey, shutdown: CancellationToken) {
    let config = Arc::new(config);
    let signing_key = Arc::new(signing_key);

    let mut tasks = Vec::new();
    for idx in 0..config.connections_count {
        let config = config.clone();
        let signing_key = signing_key.clone();
        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            reconnect_loop(idx, config, signing_key, shutdown).await;
        }));
    }

    for task in tasks {
        let _ = task.await;
    }
}

async fn reconnect_loop(session_idx: u32, config: Arc<AgentConfig>, signing_key: Arc<SigningKey>, shutdown: CancellationToken) {
    let mut backoff = config.reconnect_min_secs.max(1);

    loop {
        if shutdown.is_cancelled() {
            return;
        }

        info!(session = session_idx, hub = %config.hub_addr, "connecting to hub");
        match connect_once(&config, &signing_key, &shutdown).await {
            Ok(()) => {
                info!(session = session_idx, "tunnel session ended cleanly");
                backoff = config.reconnect_min_secs.max(1);
            }
            Err(e) => {
                warn!(session = session_idx, error = %e, "tunnel session failed");
            }
        }

        if shutdown.is_cancelled() {
            return;
        }

        let delay = Duration::from_secs(backoff);
        debug!(session = session_idx, delay_secs = backoff, "reconnecting after backoff");
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        backoff = (backoff * 2).min(config.reconnect_max_secs.max(config.reconnect_min_secs.max(1)));
    }
}

/// One full tunnel session: connect, authenticate, register services, pump
/// channels until the transport closes or shutdown fires.
async fn connect_once(config: &AgentConfig, signing_key: &SigningKey, shutdown: &CancellationToken) -> TunnelResult<()> {
    let stream = TcpStream::connect(&config.hub_addr).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    write_frame(
        &mut write_half,
        &Hello {
            protocol_version: PROTOCOL_VERSION.to_string(),
        },
    )
    .await?;
    let server_hello: tunnel_core::messages::ServerHello = read_frame(&mut read_half).await?;

    let signature = auth::sign_challenge(signing_key, &server_hello.session_id, &server_hello.nonce);
    write_frame(
        &mut write_half,
        &Auth {
            method: AuthMethod::PublicKey,
            user: config.principal.clone(),
            public_key: Some(signing_key.verifying_key().to_bytes().to_vec()),
            signature: Some(signature),
            password: None,
        },
    )
    .await?;

    let control: ControlMessage = read_frame(&mut read_half).await?;
    match control {
        ControlMessage::AuthOk(ok) => {
            info!(is_ap = ok.is_ap, "authenticated with hub");
        }
        ControlMessage::AuthFail(fail) => {
            return Err(TunnelError::Auth(fail.reason));
        }
        other => {
            return Err(TunnelError::InvalidMessage(format!("unexpected reply to Auth: {other:?}")));
        }
    }

    let (mux, mut top_rx) = Mux::spawn(read_half, write_half);

    let mut next_request_id: u64 = 1;
    let mut pending: HashMap<u64, ServiceSpec> = HashMap::new();
    let mut registered: HashMap<String, ServiceSpec> = HashMap::new();

    for service in &config.services {
        let request_id = next_request_id;
        next_request_id += 1;
        pending.insert(request_id, service.clone());
        mux.send(ControlMessage::ReverseForwardRequest(ReverseForwardRequest {
            request_id,
            addr: service.forward_addr(),
        }))?;
    }

    let mut keepalive = tokio::time::interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                return Ok(());
            }
            _ = keepalive.tick() => {
                if mux.send(ControlMessage::Ping).is_err() {
                    return Ok(());
                }
            }
            msg = top_rx.recv() => {
                let Some(msg) = msg else { return Ok(()) };
                match msg {
                    ControlMessage::ReverseForwardOk(ok) => {
                        if let Some(service) = pending.remove(&ok.request_id) {
                            info!(service = %service.name, bound = %ok.bound_addr, "service registered");
                            registered.insert(ok.bound_addr, service);
                        }
                    }
                    ControlMessage::ReverseForwardFail(fail) => {
                        if let Some(service) = pending.remove(&fail.request_id) {
                            error!(service = %service.name, reason = %fail.reason, "service registration failed");
                        }
                    }
                    ControlMessage::ReverseForwardChannelOpen(open) => {
                        let Some(service) = registered.get(&open.addr) else {
                            warn!(addr = %open.addr, "channel open for unknown registration");
                            continue;
                        };
                        let local_addr = service.local_addr.clone();
                        let channel_id = open.channel_id;
                        let mux = mux.clone();
                        tokio::spawn(async move {
                            splice_to_local(mux, channel_id, &local_addr).await;
                        });
                    }
                    ControlMessage::Pong => {}
                    other => {
                        debug!(?other, "unhandled control message");
                    }
                }
            }
        }
    }
}

async fn splice_to_local(mux: Mux, channel_id: u32, local_addr: &str) {
    match TcpStream::connect(local_addr).await {
        Ok(stream) => {
            mux.pump(channel_id, stream).await;
        }
        Err(e) => {
            warn!(local_addr, error = %e, "failed to dial local backend");
            let _ = mux.send(ControlMessage::ChannelClose(tunnel_core::messages::ChannelClose { channel_id }));
        }
    }
}
