//! xssh-agent: the AP agent binary.
//!
//! Dials the hub, authenticates with a stored Ed25519 keypair, and keeps
//! every configured local service registered over a reverse tunnel until
//! SIGINT/SIGTERM.

mod agent;
mod auth;
mod config;
mod keystore;
mod mux;

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::AgentConfig;
use keystore::KeyStore;

/// xssh-agent — publishes local services to an xssh hub over a reverse tunnel
#[derive(Parser, Debug)]
#[command(name = "xssh-agent", version, about = "xssh AP agent")]
struct Cli {
    /// Principal name this agent authenticates as
    #[arg(long)]
    principal: Option<String>,

    /// Hub tunnel address (host:port)
    #[arg(long)]
    hub_addr: Option<String>,

    /// Name of the stored key to authenticate with
    #[arg(long)]
    key_name: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.xssh/agent.toml")]
    config: String,

    /// Generate a new keypair under the given name and exit
    #[arg(long)]
    generate_key: Option<String>,

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

    info!(version = env!("CARGO_PKG_VERSION"), "starting xssh-agent");

    let store = match KeyStore::default_location() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open key store");
            std::process::exit(1);
        }
    };

    if let Some(name) = &cli.generate_key {
        match store.generate(name) {
            Ok((fp, ssh_pub)) => {
                info!(name = %name, fingerprint = %fp, "generated keypair");
                println!("{ssh_pub}");
            }
            Err(e) => {
                error!(error = %e, "failed to generate keypair");
                std::process::exit(1);
            }
        }
        return;
    }

    let config_path = PathBuf::from(&cli.config);
    let agent_config = match AgentConfig::load(
        Some(&config_path),
        cli.principal.as_deref(),
        cli.hub_addr.as_deref(),
        cli.key_name.as_deref(),
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let (signing_key, _verifying_key) = match store.load(&agent_config.key_name) {
        Ok(pair) => pair,
        Err(e) => {
            error!(error = %e, key_name = %agent_config.key_name, "failed to load key; generate one with --generate-key");
            std::process::exit(1);
        }
    };

    info!(
        principal = %agent_config.principal,
        hub = %agent_config.hub_addr,
        services = agent_config.services.len(),
        connections = agent_config.connections_count,
        "agent configured"
    );

    let shutdown = CancellationToken::new();
    let shutdown_for_signal = shutdown.clone();
    let run = agent::run(agent_config, signing_key, shutdown.clone());

    tokio::select! {
        _ = run => {}
        _ = shutdown_signal() => {
            info!("received shutdown signal");
            shutdown_for_signal.cancel();
        }
    }

    info!("xssh-agent stopped");
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
