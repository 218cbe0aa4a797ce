//! Agent configuration: TOML file + CLI overrides, mirroring the hub's
//! `ConfigFile`/`*Section` + `Default` + `load()` layering.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use tunnel_core::error::{TunnelError, TunnelResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub service: Vec<ServiceSection>,
}

/// `[agent]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    pub principal: String,
    #[serde(default = "default_hub_addr")]
    pub hub_addr: String,
    #[serde(default = "default_key_name")]
    pub key_name: String,
    #[serde(default = "default_reconnect_min_secs")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_connections_count")]
    pub connections_count: u32,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            principal: String::new(),
            hub_addr: default_hub_addr(),
            key_name: default_key_name(),
            reconnect_min_secs: default_reconnect_min_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
            connections_count: default_connections_count(),
        }
    }
}

/// One `[[service]]` table — a locally-hosted backend published over a
/// reverse tunnel. `lb` marks `*`-prefixed LB participation.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSection {
    pub name: String,
    pub local_addr: String,
    #[serde(default)]
    pub lb: bool,
}

fn default_hub_addr() -> String {
    "127.0.0.1:4422".to_string()
}
fn default_key_name() -> String {
    "default".to_string()
}
fn default_reconnect_min_secs() -> u64 {
    1
}
fn default_reconnect_max_secs() -> u64 {
    60
}
fn default_connections_count() -> u32 {
    1
}

/// One published service, resolved from a `[[service]]` table.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub local_addr: String,
    pub lb: bool,
}

impl ServiceSpec {
    /// The `unix:[*]<name>` address token sent in `ReverseForwardRequest`.
    pub fn forward_addr(&self) -> String {
        if self.lb {
            format!("unix:*{}", self.name)
        } else {
            format!("unix:{}", self.name)
        }
    }
}

/// Resolved agent configuration (CLI overrides applied, no path expansion
/// needed beyond the key store which defaults to `~/.xssh/keys`).
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub principal: String,
    pub hub_addr: String,
    pub key_name: String,
    pub reconnect_min_secs: u64,
    pub reconnect_max_secs: u64,
    pub connections_count: u32,
    pub services: Vec<ServiceSpec>,
}

impl AgentConfig {
    /// Load configuration from a TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_principal: Option<&str>,
        cli_hub_addr: Option<&str>,
        cli_key_name: Option<&str>,
    ) -> TunnelResult<Self> {
        let file_config = if let Some(path) = config_path {
            let expanded = expand_tilde(path);
            if expanded.exists() {
                info!(path = %expanded.display(), "loading agent config file");
                let content = std::fs::read_to_string(&expanded)?;
                toml::from_str::<ConfigFile>(&content)
                    .map_err(|e| TunnelError::Other(format!("config parse error: {e}")))?
            } else {
                info!(path = %expanded.display(), "agent config file not found, using defaults");
                ConfigFile {
                    agent: AgentSection::default(),
                    service: Vec::new(),
                }
            }
        } else {
            ConfigFile {
                agent: AgentSection::default(),
                service: Vec::new(),
            }
        };

        let principal = cli_principal
            .map(str::to_string)
            .unwrap_or(file_config.agent.principal);
        if principal.is_empty() {
            return Err(TunnelError::Other("agent principal is required (config or --principal)".into()));
        }

        let hub_addr = cli_hub_addr
            .map(str::to_string)
            .unwrap_or(file_config.agent.hub_addr);
        let key_name = cli_key_name
            .map(str::to_string)
            .unwrap_or(file_config.agent.key_name);

        let services = file_config
            .service
            .into_iter()
            .map(|s| ServiceSpec {
                name: s.name,
                local_addr: s.local_addr,
                lb: s.lb,
            })
            .collect();

        Ok(Self {
            principal,
            hub_addr,
            key_name,
            reconnect_min_secs: file_config.agent.reconnect_min_secs,
            reconnect_max_secs: file_config.agent.reconnect_max_secs,
            connections_count: file_config.agent.connections_count.max(1),
            services,
        })
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_with_cli_principal_succeeds() {
        let cfg = AgentConfig::load(Some(Path::new("/nonexistent/xssh-agent.toml")), Some("alice"), None, None)
            .unwrap();
        assert_eq!(cfg.principal, "alice");
        assert_eq!(cfg.hub_addr, "127.0.0.1:4422");
        assert_eq!(cfg.connections_count, 1);
    }

    #[test]
    fn missing_principal_errors() {
        assert!(AgentConfig::load(None, None, None, None).is_err());
    }

    #[test]
    fn forward_addr_marks_lb_participation() {
        let svc = ServiceSpec {
            name: "web".into(),
            local_addr: "127.0.0.1:8000".into(),
            lb: true,
        };
        assert_eq!(svc.forward_addr(), "unix:*web");
    }
}
