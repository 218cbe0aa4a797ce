use thiserror::Error;

/// Errors produced by the tunnel protocol layer, shared between hub and agent.
///
/// Variants map 1:1 onto the error-kind table in the design notes: `Auth`,
/// `Registration.Overflow`, `Registration.Unknown`, `Resolve.NoSuchService`,
/// `Transport.Closed` below, plus the catch-all variants inherited from the
/// donor protocol layer.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error("registration overflow: {0}")]
    RegistrationOverflow(String),

    #[error("registration unknown: {0}")]
    RegistrationUnknown(String),

    #[error("no such service: {0}")]
    ResolveNoSuchService(String),

    #[error("transport closed")]
    TransportClosed,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TunnelError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TunnelError::Codec(e.to_string())
    }
}

pub type TunnelResult<T> = Result<T, TunnelError>;
