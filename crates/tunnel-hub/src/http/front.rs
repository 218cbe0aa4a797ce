//! HTTP/WebSocket front (C6, §4.6): single axum [`Router`] dispatching
//! between the root/static fallback, the authenticated WS tunnel ingress,
//! the host/path reverse proxy, and a final 404.
//!
//! None of the three live behind ordinary path routes — which one applies
//! depends on headers, not the URI — so a single fallback handler tries
//! them in spec order rather than the `Router` dispatching by path.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::server::TunnelServer;

use super::routing::HttpHosts;
use super::{proxy, ws};

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<TunnelServer>,
    pub http_hosts: Arc<HttpHosts>,
}

pub fn build_router(server: Arc<TunnelServer>, http_hosts: Arc<HttpHosts>) -> Router {
    let state = AppState { server, http_hosts };
    Router::new()
        .fallback(dispatch)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws_upgrade: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    mut req: Request<Body>,
) -> Response {
    req.extensions_mut().insert(addr);

    if let Some(upgrade) = ws_upgrade {
        if headers.get("x-ap").is_some() && headers.get("x-service").is_some() {
            return match ws::authorize(&headers, state.server.token_manager()).await {
                Ok((ap, service, selector)) => {
                    let state = state.clone();
                    upgrade.on_upgrade(move |socket| ws::splice_tunnel(socket, state, ap, service, selector))
                }
                Err(e) => (StatusCode::UNAUTHORIZED, e.0).into_response(),
            };
        }
    }

    if req.uri().path() == "/" {
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(super::routing::host_without_port);
        let has_mount = match host {
            Some(h) => state.http_hosts.get(h).await.is_some(),
            None => false,
        };
        if !has_mount {
            return serve_root().await;
        }
    }

    proxy::proxy_request(State(state), req).await
}

async fn serve_root() -> Response {
    for candidate in ["www/index.html", "www/index", "www/index.tmpl"] {
        if let Ok(contents) = tokio::fs::read_to_string(candidate).await {
            return Html(contents).into_response();
        }
    }
    not_found().await
}

pub async fn not_found() -> Response {
    for candidate in ["www/not_found.html", "www/not_found"] {
        if let Ok(contents) = tokio::fs::read_to_string(candidate).await {
            return (StatusCode::NOT_FOUND, Html(contents)).into_response();
        }
    }
    (StatusCode::NOT_FOUND, "not found").into_response()
}
