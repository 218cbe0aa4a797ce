//! `load_balancers` table — LB declarations keyed by `(ap, service)` (§3, §4.1).

use crate::error::StoreResult;
use sqlx::SqlitePool;
use std::collections::HashMap;

#[derive(Debug, Clone, sqlx::FromRow)]
struct LbRow {
    ap: String,
    service: String,
    max_count: i64,
    public_addr: Option<String>,
    unix_socket: i64,
    http_host: Option<String>,
    http_path: Option<String>,
    http_auth_enabled: i64,
    http_users: String,
}

#[derive(Debug, Clone)]
pub struct LoadBalancerDecl {
    pub ap: String,
    pub service: String,
    pub max_count: u32,
    pub public_addr: Option<String>,
    pub unix_socket: bool,
    pub http_host: Option<String>,
    pub http_path: Option<String>,
    pub http_auth_enabled: bool,
    pub http_users: HashMap<String, String>,
}

impl TryFrom<LbRow> for LoadBalancerDecl {
    type Error = serde_json::Error;

    fn try_from(r: LbRow) -> Result<Self, Self::Error> {
        let http_users: HashMap<String, String> = if r.http_users.trim().is_empty() {
            HashMap::new()
        } else {
            serde_json::from_str(&r.http_users)?
        };
        Ok(Self {
            ap: r.ap,
            service: r.service,
            max_count: r.max_count as u32,
            public_addr: r.public_addr,
            unix_socket: r.unix_socket != 0,
            http_host: r.http_host,
            http_path: r.http_path,
            http_auth_enabled: r.http_auth_enabled != 0,
            http_users,
        })
    }
}

pub struct LoadBalancerStore {
    pool: SqlitePool,
}

impl LoadBalancerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn add(&self, decl: &LoadBalancerDecl) -> StoreResult<()> {
        let users_json = serde_json::to_string(&decl.http_users)?;
        sqlx::query(
            r#"INSERT INTO load_balancers
                 (ap, service, max_count, public_addr, unix_socket,
                  http_host, http_path, http_auth_enabled, http_users)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&decl.ap)
        .bind(&decl.service)
        .bind(decl.max_count as i64)
        .bind(&decl.public_addr)
        .bind(decl.unix_socket as i64)
        .bind(&decl.http_host)
        .bind(&decl.http_path)
        .bind(decl.http_auth_enabled as i64)
        .bind(users_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, ap: &str, service: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM load_balancers WHERE ap = ? AND service = ?")
            .bind(ap)
            .bind(service)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, ap: &str, service: &str) -> StoreResult<Option<LoadBalancerDecl>> {
        let row = sqlx::query_as::<_, LbRow>(
            "SELECT ap, service, max_count, public_addr, unix_socket, http_host, http_path, \
             http_auth_enabled, http_users FROM load_balancers WHERE ap = ? AND service = ?",
        )
        .bind(ap)
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(TryInto::try_into).transpose()?)
    }

    pub async fn list(&self, ap_filter: Option<&str>) -> StoreResult<Vec<LoadBalancerDecl>> {
        let rows = match ap_filter {
            Some(ap) => {
                sqlx::query_as::<_, LbRow>(
                    "SELECT ap, service, max_count, public_addr, unix_socket, http_host, \
                     http_path, http_auth_enabled, http_users FROM load_balancers WHERE ap = ?",
                )
                .bind(ap)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, LbRow>(
                    "SELECT ap, service, max_count, public_addr, unix_socket, http_host, \
                     http_path, http_auth_enabled, http_users FROM load_balancers",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.into_iter()
            .map(TryInto::try_into)
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// `(users_map, auth_enabled)` for HTTP basic-auth (§4.1, §4.6 AUTH1).
    pub async fn get_users(
        &self,
        ap: &str,
        service: &str,
    ) -> StoreResult<(HashMap<String, String>, bool)> {
        match self.get(ap, service).await? {
            Some(decl) => Ok((decl.http_users, decl.http_auth_enabled)),
            None => Ok((HashMap::new(), false)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn sample(ap: &str, service: &str) -> LoadBalancerDecl {
        LoadBalancerDecl {
            ap: ap.into(),
            service: service.into(),
            max_count: 2,
            public_addr: None,
            unix_socket: false,
            http_host: Some("demo".into()),
            http_path: Some("/".into()),
            http_auth_enabled: false,
            http_users: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn add_and_get_round_trips() {
        let store = LoadBalancerStore::new(test_pool().await);
        store.add(&sample("shared", "web")).await.unwrap();

        let decl = store.get("shared", "web").await.unwrap().unwrap();
        assert_eq!(decl.max_count, 2);
        assert_eq!(decl.http_host.as_deref(), Some("demo"));
    }

    #[tokio::test]
    async fn get_users_reflects_auth_flag() {
        let store = LoadBalancerStore::new(test_pool().await);
        let mut decl = sample("shared", "web");
        decl.http_auth_enabled = true;
        decl.http_users.insert("u".into(), "p".into());
        store.add(&decl).await.unwrap();

        let (users, enabled) = store.get_users("shared", "web").await.unwrap();
        assert!(enabled);
        assert_eq!(users.get("u"), Some(&"p".to_string()));
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let store = LoadBalancerStore::new(test_pool().await);
        store.add(&sample("a1", "ssh")).await.unwrap();
        assert!(store.remove("a1", "ssh").await.unwrap());
        assert!(store.get("a1", "ssh").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_by_ap() {
        let store = LoadBalancerStore::new(test_pool().await);
        store.add(&sample("a1", "ssh")).await.unwrap();
        store.add(&sample("a2", "web")).await.unwrap();

        assert_eq!(store.list(Some("a1")).await.unwrap().len(), 1);
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }
}
