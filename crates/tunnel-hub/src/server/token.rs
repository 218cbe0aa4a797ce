//! `xssh.token` regeneration: a pair of random tokens written atomically to
//! disk under a cron schedule, plus creation on first startup if absent.
//!
//! Schedule computation follows the donor pack's `cron` crate usage
//! (5-field expressions padded to the 7-field form the crate expects, with
//! seconds and year wildcards filled in).

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tunnel_core::error::{TunnelError, TunnelResult};

/// Compute the next fire time strictly after `now` for a cron expression.
pub fn compute_next_run(expr: &str, now: DateTime<Utc>) -> TunnelResult<DateTime<Utc>> {
    let schedule: CronSchedule = expr.parse().or_else(|_| {
        let padded = format!("0 {expr} *");
        padded.parse::<CronSchedule>()
    }).map_err(|e| TunnelError::Other(format!("invalid cron expression '{expr}': {e}")))?;

    schedule
        .after(&now)
        .next()
        .ok_or_else(|| TunnelError::Other(format!("cron expression '{expr}' has no future runs")))
}

/// Manages the on-disk `xssh.token` file: two newline-separated random
/// tokens (current + previous), so a rotation does not immediately
/// invalidate in-flight clients holding the old value.
pub struct TokenManager {
    path: PathBuf,
    cron_expr: String,
}

impl TokenManager {
    pub fn new(path: PathBuf, cron_expr: String) -> Self {
        Self { path, cron_expr }
    }

    /// Create the token file with a fresh pair if it does not already exist.
    pub async fn ensure_initial(&self) -> TunnelResult<()> {
        if tokio::fs::metadata(&self.path).await.is_ok() {
            return Ok(());
        }
        self.regenerate().await
    }

    /// Write a freshly generated token pair, replacing the current contents.
    /// The new current token becomes the first line; the old current token
    /// (if any) is kept as the second line so it remains valid for one more
    /// rotation window.
    pub async fn regenerate(&self) -> TunnelResult<()> {
        let previous = tokio::fs::read_to_string(&self.path)
            .await
            .ok()
            .and_then(|s| s.lines().next().map(str::to_string));

        let next = Uuid::new_v4().to_string();
        let contents = match previous {
            Some(prev) => format!("{next}\n{prev}\n"),
            None => format!("{next}\n"),
        };

        write_atomic(&self.path, contents.as_bytes()).await?;
        info!(path = %self.path.display(), "rotated xssh.token");
        Ok(())
    }

    pub async fn current_tokens(&self) -> TunnelResult<Vec<String>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(content.lines().map(str::to_string).collect())
    }

    /// Drive the regeneration schedule until `cancel` fires.
    pub async fn run_schedule(&self, cancel: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = match compute_next_run(&self.cron_expr, now) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "bad token_renew_cron, skipping rotation");
                    return;
                }
            };
            let delay = (next - now).to_std().unwrap_or(std::time::Duration::from_secs(1));

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = self.regenerate().await {
                        warn!(error = %e, "token rotation failed");
                    }
                }
            }
        }
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> TunnelResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(data).await?;
        file.flush().await?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_next_run_pads_five_field_expr() {
        let now = DateTime::parse_from_rfc3339("2024-02-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let next = compute_next_run("0 9 * * *", now).unwrap();
        assert_eq!(next.format("%H:%M").to_string(), "09:00");
    }

    #[tokio::test]
    async fn ensure_initial_creates_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xssh.token");
        let mgr = TokenManager::new(path.clone(), "0 0 * * *".into());
        mgr.ensure_initial().await.unwrap();
        let first = mgr.current_tokens().await.unwrap();
        assert_eq!(first.len(), 1);

        mgr.ensure_initial().await.unwrap();
        let second = mgr.current_tokens().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn regenerate_keeps_previous_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xssh.token");
        let mgr = TokenManager::new(path, "0 0 * * *".into());
        mgr.ensure_initial().await.unwrap();
        let first = mgr.current_tokens().await.unwrap();

        mgr.regenerate().await.unwrap();
        let second = mgr.current_tokens().await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[1], first[0]);
        assert_ne!(second[0], first[0]);
    }
}
