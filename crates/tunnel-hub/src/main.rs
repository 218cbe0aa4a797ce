//! xssh-hub: the reverse-tunnel hub binary.
//!
//! Brings up the sqlite-backed principal/LB store (C1), the tunnel server
//! (C5, reverse-forward/forward-dial dispatch over the fabric C2-C4), and
//! the HTTP/WS front (C6), then runs until SIGINT/SIGTERM.

mod config;
mod fabric;
mod http;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use config::HubConfig;
use server::TunnelServer;
use tunnel_core::version::Version;

/// xssh-hub — reverse-tunnel service hub
#[derive(Parser, Debug)]
#[command(name = "xssh-hub", version, about = "xssh reverse-tunnel hub")]
struct Cli {
    /// Tunnel control-plane listen address
    #[arg(long)]
    tunnel_addr: Option<String>,

    /// HTTP front listen address
    #[arg(long)]
    http_addr: Option<String>,

    /// TLS certificate (PEM), for the HTTPS front
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM), for the HTTPS front
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.xssh/config.toml")]
    config: String,

    /// Generate a self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Session time-to-live in seconds
    #[arg(long)]
    session_ttl: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting xssh-hub");

    if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate"),
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    }

    let config_path = PathBuf::from(&cli.config);
    let hub_config = match HubConfig::load(
        Some(&config_path),
        cli.tunnel_addr.as_deref(),
        cli.http_addr.as_deref(),
        cli.cert.as_deref(),
        cli.key.as_deref(),
        cli.session_ttl,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    if let Some(parent) = hub_config.db_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!(error = %e, "failed to create store directory");
            std::process::exit(1);
        }
    }

    let pool = match sqlx::SqlitePool::connect(&format!(
        "sqlite://{}?mode=rwc",
        hub_config.db_path.display()
    ))
    .await
    {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "failed to open store database");
            std::process::exit(1);
        }
    };
    if let Err(e) = tunnel_store::run_migrations(&pool).await {
        error!(error = %e, "failed to run store migrations");
        std::process::exit(1);
    }

    let principals = tunnel_store::PrincipalStore::new(pool.clone());
    let load_balancers = tunnel_store::LoadBalancerStore::new(pool);

    let version = Version {
        version: env!("CARGO_PKG_VERSION").to_string(),
        ..Version::default()
    };

    let tunnel_server = Arc::new(TunnelServer::new(hub_config, principals, load_balancers, version));

    let run_server = tunnel_server.clone().run();
    let run_http = http::serve(tunnel_server.clone());

    tokio::select! {
        result = run_server => {
            if let Err(e) = result {
                error!(error = %e, "tunnel server error");
                std::process::exit(1);
            }
        }
        result = run_http => {
            if let Err(e) = result {
                error!(error = %e, "http front error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            tunnel_server.shutdown_token().cancel();
        }
    }

    info!("xssh-hub stopped");
}

fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let xssh_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".xssh");
    std::fs::create_dir_all(&xssh_dir)?;

    let cert_path = xssh_dir.join("cert.pem");
    let key_path = xssh_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params.distinguished_name.push(rcgen::DnType::CommonName, "xssh-hub dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
