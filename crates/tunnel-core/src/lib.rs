//! tunnel-core: shared protocol library for the xssh reverse-tunnel hub.
//!
//! Provides CBOR control messages, length-prefixed framing, identity and
//! fingerprint management, authorized_keys parsing, HMAC session tokens,
//! and the `Version`/`UpgradePayload` wire types.

pub mod codec;
pub mod error;
pub mod identity;
pub mod keys;
pub mod messages;
pub mod token;
pub mod version;

pub use codec::{cbor_decode, frame_encode, FrameDecoder};
pub use error::{TunnelError, TunnelResult};
pub use identity::{fingerprint, short_fingerprint, FingerprintIndex};
pub use messages::{AuthMethod, MsgType, PROTOCOL_VERSION};
pub use token::{create_token, generate_secret, verify_token};
