//! WebSocket tunnel ingress (§4.6 step 2).
//!
//! An external client upgrades to a WebSocket carrying `Authorization:
//! Token <t>`, `X-Ap`, `X-Service` (optionally `<service>/<selector>`).
//! Once authorised and resolved, WebSocket frames are spliced to the
//! dialled TCP byte stream in both directions until either side closes —
//! grounded on `zhubby-moltis/crates/gateway/src/ws.rs`'s split-socket
//! read/write task pattern, adapted from a JSON-framed protocol to a raw
//! binary splice.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use http::HeaderMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

use crate::fabric::registry::Resolution;
use crate::server::token::TokenManager;

use super::front::AppState;

pub struct WsAuthError(pub &'static str);

/// Validate the inbound headers before ever upgrading the connection.
pub async fn authorize(headers: &HeaderMap, token_manager: &TokenManager) -> Result<(String, String, Option<String>), WsAuthError> {
    let presented = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Token "))
        .map(str::trim)
        .ok_or(WsAuthError("missing Authorization: Token header"))?;

    let valid = token_manager
        .current_tokens()
        .await
        .map_err(|_| WsAuthError("token store unavailable"))?;
    if !valid.iter().any(|t| t == presented) {
        return Err(WsAuthError("token mismatch"));
    }

    let ap = headers
        .get("x-ap")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or(WsAuthError("missing X-Ap header"))?;
    let service_header = headers
        .get("x-service")
        .and_then(|v| v.to_str().ok())
        .ok_or(WsAuthError("missing X-Service header"))?;

    let (service, selector) = match service_header.split_once('/') {
        Some((svc, sel)) => (svc.to_string(), Some(sel.to_string())),
        None => (service_header.to_string(), None),
    };

    Ok((ap, service, selector))
}

pub async fn splice_tunnel(socket: WebSocket, state: AppState, ap: String, service: String, selector: Option<String>) {
    let has_lb = state.server.lb_arena().get(&ap, &service).await.is_some();
    let resolution = state
        .server
        .registry()
        .get_listener(&ap, &service, selector.as_deref(), || has_lb)
        .await;

    let mut endpoint = match resolution {
        Ok(Resolution::Direct { listener, _release }) => match listener.dial().await {
            Ok(stream) => Some((stream, Some(_release))),
            Err(e) => {
                warn!(error = %e, %ap, %service, "ws tunnel dial failed");
                None
            }
        },
        Ok(Resolution::LoadBalanced) => {
            let Some(node) = state.server.lb_arena().get(&ap, &service).await else {
                warn!(%ap, %service, "ws tunnel: lb node vanished");
                return;
            };
            match node.next_dial().await {
                Ok((stream, release)) => Some((stream, Some(release))),
                Err(e) => {
                    warn!(error = %e, %ap, %service, "ws tunnel lb dial failed");
                    None
                }
            }
        }
        Err(e) => {
            warn!(error = %e, %ap, %service, "ws tunnel resolve failed");
            None
        }
    };

    let Some((mut backend, _release)) = endpoint.take() else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (mut backend_read, mut backend_write) = tokio::io::split(&mut backend);

    let to_backend = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                Message::Binary(data) => {
                    if backend_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Message::Text(text) => {
                    if backend_write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = backend_write.shutdown().await;
    };

    let to_client = async {
        let mut buf = [0u8; 16 * 1024];
        loop {
            match backend_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_tx.send(Message::Binary(buf[..n].to_vec().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    };

    tokio::join!(to_backend, to_client);
    debug!(%ap, %service, "ws tunnel closed");
}
