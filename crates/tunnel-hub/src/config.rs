//! Hub configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tunnel_core::error::{TunnelError, TunnelResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_tunnel_addr")]
    pub tunnel_addr: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default)]
    pub https_addr: Option<String>,
    #[serde(default = "default_cert_path")]
    pub cert: String,
    #[serde(default = "default_key_path")]
    pub key: String,
    #[serde(default = "default_sockets_dir")]
    pub sockets_dir: String,
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    #[serde(default = "default_token_renew_cron")]
    pub token_renew_cron: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            tunnel_addr: default_tunnel_addr(),
            http_addr: default_http_addr(),
            https_addr: None,
            cert: default_cert_path(),
            key: default_key_path(),
            sockets_dir: default_sockets_dir(),
            socket_mode: default_socket_mode(),
            session_ttl: default_session_ttl(),
            token_renew_cron: default_token_renew_cron(),
        }
    }
}

/// `[auth]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_true")]
    pub allow_pubkey: bool,
    #[serde(default)]
    pub allow_password: bool,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            allow_pubkey: true,
            allow_password: false,
        }
    }
}

/// `[store]` section of the config TOML — where the principal/LB database lives.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_tunnel_addr() -> String {
    "0.0.0.0:4422".to_string()
}
fn default_http_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_cert_path() -> String {
    "~/.xssh/cert.pem".to_string()
}
fn default_key_path() -> String {
    "~/.xssh/key.pem".to_string()
}
fn default_sockets_dir() -> String {
    "~/.xssh/sockets".to_string()
}
fn default_socket_mode() -> u32 {
    0o600
}
fn default_session_ttl() -> u64 {
    86400
}
fn default_token_renew_cron() -> String {
    "0 0 * * *".to_string()
}
fn default_db_path() -> String {
    "~/.xssh/xssh.db".to_string()
}
fn default_true() -> bool {
    true
}

/// Resolved hub configuration (all paths expanded, CLI overrides applied).
///
/// Produced by [`HubConfig::load`], which merges TOML file values with
/// command-line overrides and expands `~` in file paths.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub tunnel_addr: String,
    pub http_addr: String,
    pub https_addr: Option<String>,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub sockets_dir: PathBuf,
    pub socket_mode: u32,
    pub session_ttl: u64,
    pub token_renew_cron: String,
    pub db_path: PathBuf,
    pub allow_pubkey: bool,
    pub allow_password: bool,
}

#[allow(clippy::too_many_arguments)]
impl HubConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    ///
    /// If `config_path` points to a file that does not exist, defaults are
    /// used silently. CLI arguments, when `Some`, take precedence over the
    /// file values.
    pub fn load(
        config_path: Option<&Path>,
        cli_tunnel_addr: Option<&str>,
        cli_http_addr: Option<&str>,
        cli_cert: Option<&str>,
        cli_key: Option<&str>,
        cli_session_ttl: Option<u64>,
    ) -> TunnelResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "config file not found, using defaults");
                ConfigFile {
                    server: ServerSection::default(),
                    auth: AuthSection::default(),
                    store: StoreSection::default(),
                }
            }
        } else {
            ConfigFile {
                server: ServerSection::default(),
                auth: AuthSection::default(),
                store: StoreSection::default(),
            }
        };

        let tunnel_addr = cli_tunnel_addr
            .map(str::to_string)
            .unwrap_or(file_config.server.tunnel_addr);
        let http_addr = cli_http_addr
            .map(str::to_string)
            .unwrap_or(file_config.server.http_addr);
        let cert_str = cli_cert.map(str::to_string).unwrap_or(file_config.server.cert);
        let key_str = cli_key.map(str::to_string).unwrap_or(file_config.server.key);
        let session_ttl = cli_session_ttl.unwrap_or(file_config.server.session_ttl);

        Ok(Self {
            tunnel_addr,
            http_addr,
            https_addr: file_config.server.https_addr,
            cert_path: expand_tilde_str(&cert_str),
            key_path: expand_tilde_str(&key_str),
            sockets_dir: expand_tilde_str(&file_config.server.sockets_dir),
            socket_mode: file_config.server.socket_mode,
            session_ttl,
            token_renew_cron: file_config.server.token_renew_cron,
            db_path: expand_tilde_str(&file_config.store.db_path),
            allow_pubkey: file_config.auth.allow_pubkey,
            allow_password: file_config.auth.allow_password,
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
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
    fn load_with_missing_file_uses_defaults() {
        let cfg = HubConfig::load(Some(Path::new("/nonexistent/xssh.toml")), None, None, None, None, None)
            .unwrap();
        assert_eq!(cfg.tunnel_addr, "0.0.0.0:4422");
        assert!(cfg.allow_pubkey);
        assert!(!cfg.allow_password);
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let cfg = HubConfig::load(None, Some("127.0.0.1:9000"), None, None, None, Some(60)).unwrap();
        assert_eq!(cfg.tunnel_addr, "127.0.0.1:9000");
        assert_eq!(cfg.session_ttl, 60);
    }
}
