//! `xssh-admin user ...` — principal CRUD against the store (§4.1).

use anyhow::{Context, Result};
use tunnel_store::PrincipalStore;

pub async fn add(store: &PrincipalStore, name: &str, is_ap: bool, update_key: bool) -> Result<()> {
    store
        .add_user(name, is_ap, update_key)
        .await
        .with_context(|| format!("failed to add principal '{name}'"))?;

    println!("Added principal '{name}' (is_ap={is_ap}, update_key={update_key})");
    Ok(())
}

pub async fn list(store: &PrincipalStore) -> Result<()> {
    let users = store.list().await.context("failed to list principals")?;

    if users.is_empty() {
        println!("No principals found. Run `xssh-admin user add <name>` to create one.");
        return Ok(());
    }

    println!("{:<20} {:<6} {:<11} {}", "NAME", "AP", "UPDATE_KEY", "HAS_KEY");
    for u in &users {
        println!(
            "{:<20} {:<6} {:<11} {}",
            u.name,
            u.is_ap,
            u.update_key,
            u.pub_key.is_some()
        );
    }
    println!("\n{} principal(s) found.", users.len());
    Ok(())
}

pub async fn remove(store: &PrincipalStore, name: &str) -> Result<()> {
    let removed = store.remove(name).await.with_context(|| format!("failed to remove '{name}'"))?;
    if removed {
        println!("Removed principal '{name}'");
        Ok(())
    } else {
        anyhow::bail!("no such principal '{name}'")
    }
}

pub async fn authorize_ap(store: &PrincipalStore, user: &str, ap: &str) -> Result<()> {
    store
        .authorize_ap(user, ap)
        .await
        .with_context(|| format!("failed to authorize '{user}' for ap '{ap}'"))?;
    println!("Authorized '{user}' to reach AP '{ap}'");
    Ok(())
}
