//! xssh-admin — operator CLI for principal and load-balancer administration
//! against the same SQLite store the hub uses.

mod commands;
mod config;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

/// xssh-admin — principal and load-balancer administration for xssh
#[derive(Parser)]
#[command(name = "xssh-admin", version, about = "xssh hub administration CLI")]
struct Cli {
    /// Hub config file (used to find the store's db_path)
    #[arg(long, global = true, default_value = "~/.xssh/config.toml")]
    config: String,

    /// Override the SQLite store path directly
    #[arg(long, global = true)]
    db_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Principal (user/AP) administration
    User {
        #[command(subcommand)]
        action: UserAction,
    },
    /// Load-balancer declaration administration
    Lb {
        #[command(subcommand)]
        action: LbAction,
    },
}

#[derive(Subcommand)]
enum UserAction {
    /// Register a new principal
    Add {
        name: String,
        /// Mark this principal as an AP (may register reverse forwards)
        #[arg(long)]
        ap: bool,
        /// Accept any key on first use and persist it (auto-enrollment)
        #[arg(long)]
        update_key: bool,
    },
    /// List all principals
    List,
    /// Remove a principal and its AP authorizations
    Remove { name: String },
    /// Authorize a client principal to reach an AP
    AuthorizeAp { user: String, ap: String },
}

#[derive(Subcommand)]
enum LbAction {
    /// Declare a load-balanced service for an AP
    Add {
        ap: String,
        service: String,
        #[arg(long, default_value_t = 1)]
        max_count: u32,
        #[arg(long)]
        public_addr: Option<String>,
        #[arg(long)]
        unix_socket: bool,
        #[arg(long)]
        http_host: Option<String>,
        #[arg(long)]
        http_path: Option<String>,
        /// Basic-auth credential, repeatable: `--http-user name:pass`
        #[arg(long = "http-user", value_parser = parse_user_pass)]
        http_users: Vec<(String, String)>,
    },
    /// Remove a load-balancer declaration
    Remove { ap: String, service: String },
    /// List load-balancer declarations, optionally filtered by AP
    List {
        #[arg(long)]
        ap: Option<String>,
    },
    /// Show one load-balancer declaration in full
    Show { ap: String, service: String },
}

fn parse_user_pass(s: &str) -> Result<(String, String), String> {
    s.split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .ok_or_else(|| format!("expected name:pass, got '{s}'"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter("tunnel_admin=info")
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        eprintln!("xssh-admin: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let db_path = config::resolve_db_path(&PathBuf::from(&cli.config), cli.db_path.as_deref());
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}?mode=rwc", db_path.display())).await?;
    tunnel_store::run_migrations(&pool).await?;

    let principals = tunnel_store::PrincipalStore::new(pool.clone());
    let load_balancers = tunnel_store::LoadBalancerStore::new(pool);

    match cli.command {
        Command::User { action } => match action {
            UserAction::Add { name, ap, update_key } => commands::user::add(&principals, &name, ap, update_key).await,
            UserAction::List => commands::user::list(&principals).await,
            UserAction::Remove { name } => commands::user::remove(&principals, &name).await,
            UserAction::AuthorizeAp { user, ap } => commands::user::authorize_ap(&principals, &user, &ap).await,
        },
        Command::Lb { action } => match action {
            LbAction::Add {
                ap,
                service,
                max_count,
                public_addr,
                unix_socket,
                http_host,
                http_path,
                http_users,
            } => {
                commands::lb::add(
                    &load_balancers,
                    &ap,
                    &service,
                    max_count,
                    public_addr,
                    unix_socket,
                    http_host,
                    http_path,
                    http_users,
                )
                .await
            }
            LbAction::Remove { ap, service } => commands::lb::remove(&load_balancers, &ap, &service).await,
            LbAction::List { ap } => commands::lb::list(&load_balancers, ap.as_deref()).await,
            LbAction::Show { ap, service } => commands::lb::show(&load_balancers, &ap, &service).await,
        },
    }
}
