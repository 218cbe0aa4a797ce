//! `xssh-admin lb ...` — load-balancer declaration CRUD against the store
//! (§4.1, §4.4). An LB declaration is a precondition for an AP's `*`-prefixed
//! reverse-forward registration to succeed (see the LB-declaration Open
//! Question decision).

use std::collections::HashMap;

use anyhow::{Context, Result};
use tunnel_store::{LoadBalancerDecl, LoadBalancerStore};

#[allow(clippy::too_many_arguments)]
pub async fn add(
    store: &LoadBalancerStore,
    ap: &str,
    service: &str,
    max_count: u32,
    public_addr: Option<String>,
    unix_socket: bool,
    http_host: Option<String>,
    http_path: Option<String>,
    http_users: Vec<(String, String)>,
) -> Result<()> {
    let http_auth_enabled = !http_users.is_empty();
    let decl = LoadBalancerDecl {
        ap: ap.to_string(),
        service: service.to_string(),
        max_count,
        public_addr,
        unix_socket,
        http_host,
        http_path,
        http_auth_enabled,
        http_users: http_users.into_iter().collect::<HashMap<_, _>>(),
    };

    store
        .add(&decl)
        .await
        .with_context(|| format!("failed to add LB declaration '{ap}/{service}'"))?;

    println!("Added LB declaration '{ap}/{service}' (max_count={max_count})");
    Ok(())
}

pub async fn remove(store: &LoadBalancerStore, ap: &str, service: &str) -> Result<()> {
    let removed = store
        .remove(ap, service)
        .await
        .with_context(|| format!("failed to remove LB declaration '{ap}/{service}'"))?;
    if removed {
        println!("Removed LB declaration '{ap}/{service}'");
        Ok(())
    } else {
        anyhow::bail!("no such LB declaration '{ap}/{service}'")
    }
}

pub async fn list(store: &LoadBalancerStore, ap_filter: Option<&str>) -> Result<()> {
    let decls = store.list(ap_filter).await.context("failed to list LB declarations")?;

    if decls.is_empty() {
        println!("No LB declarations found.");
        return Ok(());
    }

    println!(
        "{:<12} {:<12} {:<5} {:<20} {:<7} {}",
        "AP", "SERVICE", "MAX", "PUBLIC_ADDR", "UNIX", "HTTP_HOST/PATH"
    );
    for d in &decls {
        let http = match (&d.http_host, &d.http_path) {
            (Some(h), Some(p)) => format!("{h}{p}"),
            (Some(h), None) => h.clone(),
            _ => "-".to_string(),
        };
        println!(
            "{:<12} {:<12} {:<5} {:<20} {:<7} {}",
            d.ap,
            d.service,
            d.max_count,
            d.public_addr.as_deref().unwrap_or("-"),
            d.unix_socket,
            http
        );
    }
    println!("\n{} LB declaration(s) found.", decls.len());
    Ok(())
}

pub async fn show(store: &LoadBalancerStore, ap: &str, service: &str) -> Result<()> {
    let decl = store
        .get(ap, service)
        .await
        .context("failed to look up LB declaration")?
        .ok_or_else(|| anyhow::anyhow!("no such LB declaration '{ap}/{service}'"))?;

    println!("ap:                {}", decl.ap);
    println!("service:           {}", decl.service);
    println!("max_count:         {}", decl.max_count);
    println!("public_addr:       {}", decl.public_addr.as_deref().unwrap_or("-"));
    println!("unix_socket:       {}", decl.unix_socket);
    println!("http_host:         {}", decl.http_host.as_deref().unwrap_or("-"));
    println!("http_path:         {}", decl.http_path.as_deref().unwrap_or("-"));
    println!("http_auth_enabled: {}", decl.http_auth_enabled);
    println!("http_users:        {} user(s)", decl.http_users.len());
    Ok(())
}
