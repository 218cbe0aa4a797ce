//! Resolves the SQLite store path the hub is using, so `xssh-admin` edits
//! the same database — `[store] db_path` of `~/.xssh/config.toml`, or
//! `--db-path`/`--config` overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    store: StoreSection,
}

#[derive(Debug, Clone, Deserialize)]
struct StoreSection {
    #[serde(default = "default_db_path")]
    db_path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.xssh/xssh.db".to_string()
}

/// Resolve the store's sqlite path, honoring `--db-path` first, then the
/// hub's config file, then the shared default.
pub fn resolve_db_path(config_path: &Path, cli_db_path: Option<&str>) -> PathBuf {
    if let Some(p) = cli_db_path {
        return expand_tilde_str(p);
    }

    let expanded_config = expand_tilde(config_path);
    let db_path_str = if expanded_config.exists() {
        std::fs::read_to_string(&expanded_config)
            .ok()
            .and_then(|content| toml::from_str::<ConfigFile>(&content).ok())
            .map(|c| c.store.db_path)
            .unwrap_or_else(default_db_path)
    } else {
        default_db_path()
    };

    expand_tilde_str(&db_path_str)
}

fn expand_tilde(path: &Path) -> PathBuf {
    expand_tilde_str(&path.to_string_lossy())
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_override_wins() {
        let resolved = resolve_db_path(Path::new("/nonexistent/config.toml"), Some("/tmp/custom.db"));
        assert_eq!(resolved, PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn missing_config_falls_back_to_default() {
        let resolved = resolve_db_path(Path::new("/nonexistent/config.toml"), None);
        assert!(resolved.ends_with(".xssh/xssh.db"));
    }
}
