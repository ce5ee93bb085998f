use thiserror::Error;

/// Errors produced by the courier protocol and relay layers.
#[derive(Debug, Error)]
pub enum CourierError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("malformed credential: {0}")]
    MalformedCredential(String),

    #[error("invalid login: {0}")]
    InvalidLogin(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("already online: {0}")]
    AlreadyOnline(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        CourierError::Protocol(e.to_string())
    }
}

impl CourierError {
    /// Whether this error only affects the record being processed.
    ///
    /// Protocol errors are skipped by connection workers; everything else
    /// ends the connection.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CourierError::Protocol(_))
    }
}

pub type CourierResult<T> = Result<T, CourierError>;
