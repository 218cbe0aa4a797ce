//! Control-plane message types exchanged over the tunnel's authenticated
//! multiplexed transport.
//!
//! The wire is CBOR, length-prefixed via [`crate::codec`]. Message kinds
//! cover the five operation categories the transport contract promises:
//! pubkey auth, reverse-forward registration, forward-dial, small typed
//! requests, and exec channels (§4.5).

use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "xssh-1";

/// Numeric message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MsgType {
    Hello = 0x01,
    ServerHello = 0x02,
    Challenge = 0x03,
    Auth = 0x04,
    AuthOk = 0x05,
    AuthFail = 0x06,

    ReverseForwardRequest = 0x10,
    ReverseForwardOk = 0x11,
    ReverseForwardFail = 0x12,
    ReverseForwardCancel = 0x13,

    ForwardDialRequest = 0x20,
    ForwardDialOk = 0x21,
    ForwardDialFail = 0x22,

    GlobalRequest = 0x30,
    GlobalRequestOk = 0x31,
    GlobalRequestFail = 0x32,

    ExecOpen = 0x40,
    ExecData = 0x41,
    ExecClose = 0x42,

    Ping = 0x50,
    Pong = 0x51,

    Error = 0x60,

    ChannelData = 0x70,
    ChannelClose = 0x71,
}

impl From<MsgType> for u8 {
    fn from(m: MsgType) -> u8 {
        m as u8
    }
}

impl TryFrom<u8> for MsgType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        use MsgType::*;
        Ok(match v {
            0x01 => Hello,
            0x02 => ServerHello,
            0x03 => Challenge,
            0x04 => Auth,
            0x05 => AuthOk,
            0x06 => AuthFail,
            0x10 => ReverseForwardRequest,
            0x11 => ReverseForwardOk,
            0x12 => ReverseForwardFail,
            0x13 => ReverseForwardCancel,
            0x20 => ForwardDialRequest,
            0x21 => ForwardDialOk,
            0x22 => ForwardDialFail,
            0x30 => GlobalRequest,
            0x31 => GlobalRequestOk,
            0x32 => GlobalRequestFail,
            0x40 => ExecOpen,
            0x41 => ExecData,
            0x42 => ExecClose,
            0x50 => Ping,
            0x51 => Pong,
            0x60 => Error,
            0x70 => ChannelData,
            0x71 => ChannelClose,
            other => return Err(format!("unknown message type: {other:#x}")),
        })
    }
}

/// Authentication method carried in an `Auth` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    PublicKey,
    Password,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHello {
    pub session_id: String,
    pub nonce: Vec<u8>,
}

/// Carries the `principal[:ap_name[:proxy_user]]` user-naming convention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub method: AuthMethod,
    pub user: String,
    pub public_key: Option<Vec<u8>>,
    pub signature: Option<Vec<u8>>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOk {
    pub is_ap: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFail {
    pub reason: String,
}

/// Reverse-forward registration request. `addr` is `unix:<name>` or
/// `virtual:<name>`, optionally `*`-prefixed for LB participation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseForwardRequest {
    pub request_id: u64,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseForwardOk {
    pub request_id: u64,
    pub bound_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseForwardFail {
    pub request_id: u64,
    pub reason: String,
}

/// Hub tells the AP a channel has arrived on one of its registered listeners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseForwardChannelOpen {
    pub addr: String,
    pub channel_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReverseForwardCancel {
    pub addr: String,
}

/// Forward-dial request: `<service>[/<remote_addr_selector>]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardDialRequest {
    pub request_id: u64,
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardDialOk {
    pub request_id: u64,
    pub channel_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardDialFail {
    pub request_id: u64,
    pub reason: String,
}

/// Opaque small-payload request. `ap-version`/`cl-version` carry the
/// wire-encoded [`crate::version::Version`] string as `payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRequest {
    pub request_id: u64,
    pub kind: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRequestOk {
    pub request_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRequestFail {
    pub request_id: u64,
    pub reason: String,
}

/// One chunk of a multiplexed byte-stream channel (reverse-forward or
/// forward-dial data), keyed by `channel_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    pub channel_id: u32,
    pub data: Vec<u8>,
}

/// Half-close or full close of a multiplexed channel; either side may send
/// this once it has no more data (mirrors TCP half-close via EOF).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelClose {
    pub channel_id: u32,
}

/// Exec channel open; `args[0]` selects the operation (`update`, ssh-proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOpen {
    pub channel_id: u32,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecData {
    pub channel_id: u32,
    pub stderr: bool,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecClose {
    pub channel_id: u32,
}

/// Tagged union of every control-plane message kind; this is what actually
/// crosses the wire through [`crate::codec`]. `MsgType` remains as the
/// compact numeric identifier logged alongside it, matching the donor
/// protocol's convention of pairing a tag enum with payload structs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    Hello(Hello),
    ServerHello(ServerHello),
    Auth(Auth),
    AuthOk(AuthOk),
    AuthFail(AuthFail),
    ReverseForwardRequest(ReverseForwardRequest),
    ReverseForwardOk(ReverseForwardOk),
    ReverseForwardFail(ReverseForwardFail),
    ReverseForwardChannelOpen(ReverseForwardChannelOpen),
    ReverseForwardCancel(ReverseForwardCancel),
    ForwardDialRequest(ForwardDialRequest),
    ForwardDialOk(ForwardDialOk),
    ForwardDialFail(ForwardDialFail),
    GlobalRequest(GlobalRequest),
    GlobalRequestOk(GlobalRequestOk),
    GlobalRequestFail(GlobalRequestFail),
    ExecOpen(ExecOpen),
    ExecData(ExecData),
    ExecClose(ExecClose),
    ChannelData(ChannelData),
    ChannelClose(ChannelClose),
    Ping,
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_type_round_trips_through_u8() {
        for variant in [
            MsgType::Hello,
            MsgType::ReverseForwardRequest,
            MsgType::ForwardDialFail,
            MsgType::ExecClose,
            MsgType::Pong,
        ] {
            let tag: u8 = variant.into();
            assert_eq!(MsgType::try_from(tag).unwrap(), variant);
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        assert!(MsgType::try_from(0xff).is_err());
    }
}
