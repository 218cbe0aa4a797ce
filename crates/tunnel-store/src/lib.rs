//! tunnel-store: SQLite-backed persistence for principals and load-balancer
//! declarations (C1, §4.1). Out of scope per the design notes: schema
//! migration tooling beyond `sqlx::migrate!` — callers run
//! [`run_migrations`] once at startup.

pub mod error;
pub mod load_balancer;
pub mod principal;

pub use error::{StoreError, StoreResult};
pub use load_balancer::{LoadBalancerDecl, LoadBalancerStore};
pub use principal::{AuthOutcome, PrincipalStore, User};

use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
