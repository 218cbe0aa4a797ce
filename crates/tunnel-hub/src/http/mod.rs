//! HTTP/WebSocket front (C6, §4.6).
//!
//! Binds the plain-HTTP listener and, when `https_addr` is configured, a
//! TLS listener sharing the same router. Grounded on the donor `main.rs`'s
//! TLS-config loading (kept in the hub's `main.rs`) and on
//! `zhubby-moltis/crates/gateway`'s axum `Router` wiring.

pub mod front;
pub mod proxy;
pub mod routing;
pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, info};

use tunnel_core::error::TunnelResult;

use crate::server::TunnelServer;

pub use front::AppState;
pub use routing::HttpHosts;

/// Serve the HTTP front (and, if configured, a TLS front) until the
/// server's shutdown token fires.
pub async fn serve(server: Arc<TunnelServer>) -> TunnelResult<()> {
    let http_hosts = Arc::new(HttpHosts::new());
    http_hosts.reload_from_store(server.load_balancers()).await.ok();

    let router = front::build_router(server.clone(), http_hosts);

    let http_addr = server.config().http_addr.clone();
    let https_addr = server.config().https_addr.clone();
    let shutdown = server.shutdown_token();

    let http_listener = TcpListener::bind(&http_addr).await?;
    info!(addr = %http_addr, "http front listening");

    let http_shutdown = shutdown.clone();
    let make_service = router.clone().into_make_service_with_connect_info::<SocketAddr>();
    let http_task = tokio::spawn(async move {
        axum::serve(http_listener, make_service)
            .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
            .await
    });

    if let Some(https_addr) = https_addr {
        let tls_acceptor = build_tls_acceptor(&server).await?;
        let https_listener = TcpListener::bind(&https_addr).await?;
        info!(addr = %https_addr, "https front listening");
        let https_shutdown = shutdown.clone();
        tokio::spawn(serve_tls(https_listener, tls_acceptor, router, https_shutdown));
    }

    let _ = http_task.await;
    Ok(())
}

async fn build_tls_acceptor(server: &Arc<TunnelServer>) -> TunnelResult<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(std::fs::File::open(
        &server.config().cert_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(std::fs::File::open(
        &server.config().key_path,
    )?))?
    .ok_or_else(|| tunnel_core::error::TunnelError::Other("no private key found in key file".into()))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| tunnel_core::error::TunnelError::Other(format!("tls config error: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Manual TLS accept loop: axum's `Router` itself implements `tower::Service`
/// once `ConnectInfo` is inserted by hand, so no make-service wrapper is
/// needed here the way the plain-HTTP listener needs one.
async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: axum::Router,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let acceptor = acceptor.clone();
                let router = router.clone();
                tokio::spawn(async move {
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(error = %e, "tls handshake failed");
                            return;
                        }
                    };
                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let service = hyper::service::service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                        let mut req = req.map(axum::body::Body::new);
                        req.extensions_mut().insert(ConnectInfo(peer));
                        let mut router = router.clone();
                        async move { router.call(req).await }
                    });
                    let _ = hyper_util::server::conn::auto::Builder::new(hyper_util::rt::TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
            }
        }
    }
}
