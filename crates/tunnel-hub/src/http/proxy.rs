//! Host/path reverse proxy (§4.6 step 3).
//!
//! Every proxied request dials a fresh backend connection through the
//! virtual-listener fabric rather than pooling — mirroring
//! `examples/original_source/server/http.go`'s per-request `DialContext`
//! transport for HTTP/1.1 and its one-entry connection cache for HTTP/2.
//! No redirects are followed; the backend's response is streamed back
//! unmodified aside from the forwarded-for headers this module adds.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use http_body_util::BodyExt;
use hyper::client::conn::{http1, http2};
use tracing::warn;
use tunnel_store::LoadBalancerDecl;

use crate::fabric::registry::Resolution;

use super::front::AppState;
use super::routing::host_without_port;

struct TokioExec;

impl<F> hyper::rt::Executor<F> for TokioExec
where
    F: std::future::Future + Send + 'static,
    F::Output: Send,
{
    fn execute(&self, fut: F) {
        tokio::spawn(fut);
    }
}

/// Resolve and dial a backend for `(ap, service)`, either direct or via
/// the LB node's least-active endpoint.
async fn dial_backend(state: &AppState, ap: &str, service: &str) -> Option<tokio::io::DuplexStream> {
    let has_lb = state.server.lb_arena().get(ap, service).await.is_some();
    let resolution = state.server.registry().get_listener(ap, service, None, || has_lb).await;
    match resolution {
        Ok(Resolution::Direct { listener, _release }) => match listener.dial().await {
            Ok(stream) => Some(stream),
            Err(e) => {
                warn!(error = %e, %ap, %service, "http proxy dial failed");
                None
            }
        },
        Ok(Resolution::LoadBalanced) => {
            let node = state.server.lb_arena().get(ap, service).await?;
            match node.next_dial().await {
                Ok((stream, _release)) => Some(stream),
                Err(e) => {
                    warn!(error = %e, %ap, %service, "http proxy lb dial failed");
                    None
                }
            }
        }
        Err(e) => {
            warn!(error = %e, %ap, %service, "http proxy resolve failed");
            None
        }
    }
}

fn check_basic_auth(decl: &LoadBalancerDecl, req: &Request<Body>) -> bool {
    if !decl.http_auth_enabled {
        return true;
    }
    let Some(header) = req.headers().get(header::AUTHORIZATION) else {
        return false;
    };
    let Ok(value) = header.to_str() else { return false };
    let Some(encoded) = value.strip_prefix("Basic ") else { return false };
    let Ok(decoded) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else { return false };
    let Some((user, pass)) = decoded.split_once(':') else { return false };
    decl.http_users.get(user).map(|p| p == pass).unwrap_or(false)
}

fn apply_forwarded_headers(req: &mut Request<Body>, client_addr: &str, host: &str, mount_path: &str) {
    let headers = req.headers_mut();

    let forwarded_for = match headers.get("x-forwarded-for") {
        Some(existing) => format!("{}, {client_addr}", existing.to_str().unwrap_or_default()),
        None => client_addr.to_string(),
    };
    if let Ok(v) = HeaderValue::from_str(&forwarded_for) {
        headers.insert("x-forwarded-for", v);
    }
    if let Ok(v) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", v);
    }
    headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
    if mount_path != "/" {
        if let Ok(v) = HeaderValue::from_str(mount_path) {
            headers.insert("x-forwarded-prefix", v);
        }
    }
}

/// Reverse-proxy one request to the resolved LB declaration's backend.
/// Returns `None` (caller falls through to 404) when no host/path mount
/// matched; returns `Some(response)` for both success and upstream-error
/// cases once a mount was found.
pub async fn proxy_request(
    State(state): State<AppState>,
    mut req: Request<Body>,
) -> Response {
    let host_header = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let host = host_without_port(&host_header).to_string();

    let Some(host_paths) = state.http_hosts.get(&host).await else {
        return super::front::not_found().await;
    };

    let path = req.uri().path().to_string();
    let Some(decl) = host_paths.match_longest_prefix(&path).await else {
        return super::front::not_found().await;
    };

    if !check_basic_auth(&decl, &req) {
        let mut resp = StatusCode::UNAUTHORIZED.into_response();
        resp.headers_mut().insert(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"User Visible Realm\""),
        );
        return resp;
    }
    req.headers_mut().remove(header::AUTHORIZATION);

    let client_addr = req
        .extensions()
        .get::<std::net::SocketAddr>()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let mount_path = decl.http_path.clone().unwrap_or_else(|| "/".to_string());
    apply_forwarded_headers(&mut req, &client_addr, &host_header, &mount_path);

    let Some(backend) = dial_backend(&state, &decl.ap, &decl.service).await else {
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let uses_h2 = req.version() == axum::http::Version::HTTP_2;
    let result = if uses_h2 {
        proxy_over_h2(backend, req).await
    } else {
        proxy_over_h1(backend, req).await
    };

    match result {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

async fn proxy_over_h1(backend: tokio::io::DuplexStream, req: Request<Body>) -> anyhow::Result<Response> {
    let io = hyper_util::rt::TokioIo::new(backend);
    let (mut sender, conn) = http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "h1 upstream connection error");
        }
    });

    let (parts, body) = req.into_parts();
    let collected = body.collect().await?.to_bytes();
    let outbound = Request::from_parts(parts, http_body_util::Full::new(collected));

    let upstream_resp = sender.send_request(outbound).await?;
    let (parts, body) = upstream_resp.into_parts();
    let collected = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, Body::from(collected)))
}

async fn proxy_over_h2(backend: tokio::io::DuplexStream, req: Request<Body>) -> anyhow::Result<Response> {
    let io = hyper_util::rt::TokioIo::new(backend);
    let (mut sender, conn) = http2::Builder::new(TokioExec).handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!(error = %e, "h2 upstream connection error");
        }
    });

    let (parts, body) = req.into_parts();
    let collected = body.collect().await?.to_bytes();
    let outbound = Request::from_parts(parts, http_body_util::Full::new(collected));

    let upstream_resp = sender.send_request(outbound).await?;
    let (parts, body) = upstream_resp.into_parts();
    let collected = body.collect().await?.to_bytes();
    Ok(Response::from_parts(parts, Body::from(collected)))
}
