use std::path::PathBuf;

/// Error type for everything the engine can hit while offering load.
///
/// The variants map one-to-one onto the failure classes the reports
/// distinguish: transport (network, timeout, TLS), protocol (non-2xx),
/// parse (params script / base64 / missing fields), logic (the target
/// answered but said "no"), and session-unavailable (a dependent step
/// had no valid tokens to work with).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected response: HTTP {status}")]
    Protocol { status: u16 },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("{endpoint} failed: {detail}")]
    Logic { endpoint: &'static str, detail: String },

    #[error("no valid session for uid={uid}: {reason}")]
    SessionUnavailable { uid: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("trace file {0} not readable")]
    TraceUnavailable(PathBuf),

    #[error("auth token acquisition failed: {0}")]
    Auth(String),

    #[error("internal: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn parse(msg: impl Into<String>) -> Self {
        Error::Parse(msg.into())
    }

    /// Whether this failure came from the wire rather than from our own
    /// bookkeeping. Used only for log classification.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
