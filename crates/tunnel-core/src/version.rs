//! `Version` and `UpgradePayload` wire types used by the AP self-update
//! exec channel (§4.5, §6).
//!
//! Ported field-for-field from the original `common/version.go` and
//! `common/upgrade.go`: `Version` is a single colon-joined string, tolerant
//! of empty middle fields on decode; `UpgradePayload` is a binary
//! big-endian framed message with a branching shape depending on `ok` and
//! `changed`.

use crate::error::{TunnelError, TunnelResult};
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// `version:commit:rfc3339_date:os:arch:arm:digest`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Version {
    pub version: String,
    pub commit: String,
    pub build_date: Option<DateTime<Utc>>,
    pub os: String,
    pub arch: String,
    pub arm: u8,
    pub digest: String,
}

impl Version {
    pub fn to_wire_string(&self) -> String {
        let date = self
            .build_date
            .map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        [
            self.version.as_str(),
            self.commit.as_str(),
            date.as_str(),
            self.os.as_str(),
            self.arch.as_str(),
            &self.arm.to_string(),
            self.digest.as_str(),
        ]
        .join(":")
    }

    /// Tolerant of empty middle fields, matching the original `Unmarshal`.
    pub fn from_wire_str(s: &str) -> Self {
        if s.is_empty() {
            return Self::default();
        }
        let parts: Vec<&str> = s.splitn(7, ':').collect();
        let get = |i: usize| parts.get(i).copied().unwrap_or("");
        let build_date = match get(2) {
            "" => None,
            d => DateTime::parse_from_rfc3339(d).ok().map(|d| d.with_timezone(&Utc)),
        };
        Version {
            version: get(0).to_string(),
            commit: get(1).to_string(),
            build_date,
            os: get(3).to_string(),
            arch: get(4).to_string(),
            arm: get(5).parse().unwrap_or(0),
            digest: get(6).to_string(),
        }
    }

    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> TunnelResult<()> {
        let s = self.to_wire_string();
        let len: u16 = s
            .len()
            .try_into()
            .map_err(|_| TunnelError::InvalidMessage("version string too long".into()))?;
        w.write_u16(len).await?;
        w.write_all(s.as_bytes()).await?;
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> TunnelResult<Self> {
        let len = r.read_u16().await?;
        if len == 0 {
            return Ok(Self::default());
        }
        let mut buf = vec![0u8; len as usize];
        r.read_exact(&mut buf).await?;
        Ok(Self::from_wire_str(&String::from_utf8_lossy(&buf)))
    }
}

/// Binary big-endian framed response for the `update` exec-channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradePayload {
    /// No new version available; `changed = false`.
    Unchanged,
    /// New version is fetched by URL.
    ChangedUrl { url: String },
    /// New version is streamed inline; `stream_size` bytes follow on the
    /// channel immediately after this frame (not carried in the enum).
    ChangedStream { stream_size: i64 },
    /// Updater failed; message carries the error text (or the
    /// `"<empty message>"` sentinel when the original produced a zero-length
    /// error).
    Err { message: String },
}

impl UpgradePayload {
    pub async fn write<W: AsyncWrite + Unpin>(&self, w: &mut W) -> TunnelResult<()> {
        match self {
            UpgradePayload::Unchanged => {
                w.write_u8(1).await?; // ok = true
                w.write_u8(0).await?; // changed = false
            }
            UpgradePayload::ChangedUrl { url } => {
                w.write_u8(1).await?;
                w.write_u8(1).await?; // changed = true
                w.write_u8(0).await?; // stream = false
                let len: u16 = url
                    .len()
                    .try_into()
                    .map_err(|_| TunnelError::InvalidMessage("url too long".into()))?;
                w.write_u16(len).await?;
                w.write_all(url.as_bytes()).await?;
            }
            UpgradePayload::ChangedStream { stream_size } => {
                w.write_u8(1).await?;
                w.write_u8(1).await?;
                w.write_u8(1).await?; // stream = true
                w.write_i64(*stream_size).await?;
            }
            UpgradePayload::Err { message } => {
                w.write_u8(0).await?; // ok = false
                let len: u16 = message
                    .len()
                    .try_into()
                    .map_err(|_| TunnelError::InvalidMessage("error message too long".into()))?;
                w.write_u16(len).await?;
                w.write_all(message.as_bytes()).await?;
            }
        }
        Ok(())
    }

    pub async fn read<R: AsyncRead + Unpin>(r: &mut R) -> TunnelResult<Self> {
        let ok = r.read_u8().await? != 0;
        if !ok {
            let len = r.read_u16().await?;
            if len == 0 {
                return Ok(UpgradePayload::Err {
                    message: "<empty message>".into(),
                });
            }
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).await?;
            return Ok(UpgradePayload::Err {
                message: String::from_utf8_lossy(&buf).into_owned(),
            });
        }

        let changed = r.read_u8().await? != 0;
        if !changed {
            return Ok(UpgradePayload::Unchanged);
        }

        let stream = r.read_u8().await? != 0;
        if stream {
            let stream_size = r.read_i64().await?;
            Ok(UpgradePayload::ChangedStream { stream_size })
        } else {
            let len = r.read_u16().await?;
            let mut buf = vec![0u8; len as usize];
            r.read_exact(&mut buf).await?;
            Ok(UpgradePayload::ChangedUrl {
                url: String::from_utf8_lossy(&buf).into_owned(),
            })
        }
    }
}

/// Structured-logging-only summary emitted after a successful AP self-update
/// round trip (`original_source/common/upgrade.go`'s `ApUpgradePayload`).
/// Never wire-marshalled; exists so the hub can log `?payload` with `tracing`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ApUpgradePayload {
    pub ap: String,
    pub ap_addr: String,
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_round_trips_through_wire_string() {
        let v = Version {
            version: "1.2.3".into(),
            commit: "abcdef".into(),
            build_date: Some(DateTime::parse_from_rfc3339("2024-02-01T09:00:00Z").unwrap().with_timezone(&Utc)),
            os: "linux".into(),
            arch: "amd64".into(),
            arm: 0,
            digest: "deadbeef".into(),
        };
        let s = v.to_wire_string();
        assert_eq!(Version::from_wire_str(&s), v);
    }

    #[test]
    fn version_tolerates_empty_middle_fields() {
        let s = "1.0.0::::0:";
        let v = Version::from_wire_str(s);
        assert_eq!(v.version, "1.0.0");
        assert_eq!(v.commit, "");
        assert!(v.build_date.is_none());
    }

    #[tokio::test]
    async fn version_wire_round_trip() {
        let v = Version {
            version: "9.9.9".into(),
            commit: "cafe".into(),
            build_date: None,
            os: "linux".into(),
            arch: "arm64".into(),
            arm: 7,
            digest: "beef".into(),
        };
        let mut buf = Vec::new();
        v.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Version::read(&mut cursor).await.unwrap();
        assert_eq!(decoded, v);
    }

    #[tokio::test]
    async fn upgrade_payload_round_trips_url_variant() {
        let p = UpgradePayload::ChangedUrl {
            url: "https://example.com/bin".into(),
        };
        let mut buf = Vec::new();
        p.write(&mut buf).await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        assert_eq!(UpgradePayload::read(&mut cursor).await.unwrap(), p);
    }

    #[tokio::test]
    async fn upgrade_payload_empty_error_becomes_sentinel() {
        let mut buf = Vec::new();
        buf.push(0u8); // ok = false
        buf.extend_from_slice(&0u16.to_be_bytes()); // err_size = 0
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = UpgradePayload::read(&mut cursor).await.unwrap();
        assert_eq!(
            decoded,
            UpgradePayload::Err {
                message: "<empty message>".into()
            }
        );
    }
}
