//! `users` + `user_ap` tables — principal records and per-AP client
//! authorisation (§4.1, §6 on-disk state).

use crate::error::{StoreError, StoreResult};
use sqlx::SqlitePool;

#[derive(Debug, Clone, sqlx::FromRow)]
struct UserRow {
    name: String,
    is_ap: i64,
    update_key: i64,
    pub_key: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub is_ap: bool,
    pub update_key: bool,
    pub pub_key: Option<Vec<u8>>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            name: r.name,
            is_ap: r.is_ap != 0,
            update_key: r.update_key != 0,
            pub_key: r.pub_key,
        }
    }
}

/// Result of `User::authenticate` — whether the presented key was accepted,
/// and whether the principal is an AP (affects which transport operations
/// it is authorised to perform, §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthOutcome {
    pub ok: bool,
    pub is_ap: bool,
}

pub struct PrincipalStore {
    pool: SqlitePool,
}

impl PrincipalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn add_user(&self, name: &str, is_ap: bool, update_key: bool) -> StoreResult<()> {
        let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        if existing > 0 {
            return Err(StoreError::Duplicate(name.to_string()));
        }
        sqlx::query(
            "INSERT INTO users (name, is_ap, update_key, pub_key) VALUES (?, ?, ?, NULL)",
        )
        .bind(name)
        .bind(is_ap as i64)
        .bind(update_key as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, name: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT name, is_ap, update_key, pub_key FROM users WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Into::into))
    }

    /// Matches a presented public key against the stored one. If
    /// `update_key` is set and no key (or a different one) is stored, the
    /// presented key is persisted, the flag cleared, and `ok=true` is
    /// returned — this is the auto-key-update path (§4.1).
    pub async fn authenticate(&self, name: &str, pub_key_blob: &[u8]) -> StoreResult<AuthOutcome> {
        let Some(user) = self.get(name).await? else {
            return Ok(AuthOutcome {
                ok: false,
                is_ap: false,
            });
        };

        if let Some(stored) = &user.pub_key {
            if stored.as_slice() == pub_key_blob {
                return Ok(AuthOutcome {
                    ok: true,
                    is_ap: user.is_ap,
                });
            }
        }

        if user.update_key {
            sqlx::query("UPDATE users SET pub_key = ?, update_key = 0 WHERE name = ?")
                .bind(pub_key_blob)
                .bind(name)
                .execute(&self.pool)
                .await?;
            return Ok(AuthOutcome {
                ok: true,
                is_ap: user.is_ap,
            });
        }

        Ok(AuthOutcome {
            ok: false,
            is_ap: user.is_ap,
        })
    }

    pub async fn authorize_ap(&self, user: &str, ap: &str) -> StoreResult<()> {
        sqlx::query("INSERT OR IGNORE INTO user_ap (user, ap) VALUES (?, ?)")
            .bind(user)
            .bind(ap)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// All principals, ordered by name — for admin listing.
    pub async fn list(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query_as::<_, UserRow>(
            "SELECT name, is_ap, update_key, pub_key FROM users ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Remove a principal and its AP authorisations. Returns `false` if no
    /// such principal existed.
    pub async fn remove(&self, name: &str) -> StoreResult<bool> {
        sqlx::query("DELETE FROM user_ap WHERE user = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let result = sqlx::query("DELETE FROM users WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
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

    #[tokio::test]
    async fn add_user_rejects_duplicate() {
        let store = PrincipalStore::new(test_pool().await);
        store.add_user("alice", false, false).await.unwrap();
        let err = store.add_user("alice", false, false).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn authenticate_unknown_principal_fails() {
        let store = PrincipalStore::new(test_pool().await);
        let outcome = store.authenticate("ghost", b"key").await.unwrap();
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn authenticate_matches_stored_key() {
        let store = PrincipalStore::new(test_pool().await);
        store.add_user("ap1", true, false).await.unwrap();
        sqlx::query("UPDATE users SET pub_key = ? WHERE name = ?")
            .bind(b"keydata".as_slice())
            .bind("ap1")
            .execute(&store.pool)
            .await
            .unwrap();

        let outcome = store.authenticate("ap1", b"keydata").await.unwrap();
        assert!(outcome.ok);
        assert!(outcome.is_ap);

        let outcome = store.authenticate("ap1", b"wrong").await.unwrap();
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn authenticate_auto_updates_key_when_flagged() {
        let store = PrincipalStore::new(test_pool().await);
        store.add_user("ap1", true, true).await.unwrap();

        let outcome = store.authenticate("ap1", b"first-key").await.unwrap();
        assert!(outcome.ok);

        let user = store.get("ap1").await.unwrap().unwrap();
        assert!(!user.update_key);
        assert_eq!(user.pub_key.as_deref(), Some(b"first-key".as_slice()));

        // Second attempt with a different key now fails: the flag is cleared.
        let outcome = store.authenticate("ap1", b"second-key").await.unwrap();
        assert!(!outcome.ok);
    }

    #[tokio::test]
    async fn list_orders_by_name() {
        let store = PrincipalStore::new(test_pool().await);
        store.add_user("bob", false, false).await.unwrap();
        store.add_user("alice", false, false).await.unwrap();

        let names: Vec<_> = store.list().await.unwrap().into_iter().map(|u| u.name).collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn remove_deletes_principal_and_authorizations() {
        let store = PrincipalStore::new(test_pool().await);
        store.add_user("ap1", true, false).await.unwrap();
        store.authorize_ap("client1", "ap1").await.unwrap();

        assert!(store.remove("ap1").await.unwrap());
        assert!(store.get("ap1").await.unwrap().is_none());
        assert!(!store.remove("ap1").await.unwrap());
    }
}
