//! Exec-channel operations opened over the control plane (§4.5).
//!
//! `args[0]` selects the operation. Only `update` is implemented; anything
//! else gets `"invalid command"` on stderr and a non-zero close, matching
//! the donor protocol's unknown-command behaviour.

use tunnel_core::messages::ExecData;
use tunnel_core::version::{ApUpgradePayload, UpgradePayload, Version};

/// Result of running an exec operation: stderr/stdout chunks to emit before
/// closing the channel.
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutcome {
    fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
        }
    }

    fn err(stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
        }
    }

    pub fn into_exec_data(self, channel_id: u32) -> Vec<ExecData> {
        let mut frames = Vec::new();
        if !self.stdout.is_empty() {
            frames.push(ExecData {
                channel_id,
                stderr: false,
                data: self.stdout,
            });
        }
        if !self.stderr.is_empty() {
            frames.push(ExecData {
                channel_id,
                stderr: true,
                data: self.stderr,
            });
        }
        frames
    }
}

/// Dispatch an exec-channel request by its `args[0]` command name.
///
/// `ap_version` is the caller's advertised [`Version`], logged alongside the
/// hub's own build info (mirrors `ApUpgradePayload` in the donor protocol,
/// which is logging-only and never marshalled over the wire).
pub async fn dispatch(args: &[String], ap_name: &str, ap_addr: &str, hub_version: &Version) -> ExecOutcome {
    match args.first().map(String::as_str) {
        Some("update") => run_update(args, ap_name, ap_addr, hub_version).await,
        Some(other) => {
            tracing::debug!(command = %other, "unrecognised exec command");
            ExecOutcome::err("invalid command")
        }
        None => ExecOutcome::err("invalid command"),
    }
}

async fn run_update(args: &[String], ap_name: &str, ap_addr: &str, hub_version: &Version) -> ExecOutcome {
    let ap_version_str = args.get(1).cloned().unwrap_or_default();
    let ap_version = Version::from_wire_str(&ap_version_str);

    let payload = ApUpgradePayload {
        ap: ap_name.to_string(),
        ap_addr: ap_addr.to_string(),
        version: ap_version.to_wire_string(),
    };
    tracing::info!(?payload, "ap-version reported");

    let outcome = if ap_version.version == hub_version.version {
        UpgradePayload::Unchanged
    } else {
        UpgradePayload::ChangedUrl {
            url: format!("/downloads/xssh-agent-{}", hub_version.version),
        }
    };

    let mut buf = Vec::new();
    match outcome.write(&mut buf).await {
        Ok(()) => ExecOutcome::ok(buf),
        Err(e) => ExecOutcome::err(format!("failed to encode upgrade payload: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub_version() -> Version {
        Version {
            version: "1.2.3".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unknown_command_reports_invalid_command() {
        let outcome = dispatch(&["frobnicate".into()], "ap1", "10.0.0.1", &hub_version()).await;
        assert_eq!(outcome.stderr, b"invalid command");
    }

    #[tokio::test]
    async fn empty_args_reports_invalid_command() {
        let outcome = dispatch(&[], "ap1", "10.0.0.1", &hub_version()).await;
        assert_eq!(outcome.stderr, b"invalid command");
    }

    #[tokio::test]
    async fn update_with_matching_version_is_unchanged() {
        let outcome = dispatch(
            &["update".into(), "1.2.3:::::: ".trim().to_string()],
            "ap1",
            "10.0.0.1",
            &hub_version(),
        )
        .await;
        assert!(outcome.stderr.is_empty());
        let mut cursor = std::io::Cursor::new(outcome.stdout);
        let decoded = UpgradePayload::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, UpgradePayload::Unchanged);
    }

    #[tokio::test]
    async fn update_with_older_version_returns_url() {
        let outcome = dispatch(&["update".into(), "1.0.0".into()], "ap1", "10.0.0.1", &hub_version()).await;
        let mut cursor = std::io::Cursor::new(outcome.stdout);
        let decoded = UpgradePayload::read(&mut cursor).await.unwrap();
        assert!(matches!(decoded, UpgradePayload::ChangedUrl { url } if url.starts_with("/downloads/")));
    }
}
