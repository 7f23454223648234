use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("not found")]
    NotFound,

    #[error("access denied")]
    AccessDenied,

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// A row shape or state the code considers impossible. Never shown to clients.
    #[error("invariant violation: {0}")]
    Invariant(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("operation timed out")]
    Timeout,

    #[error("batch load failed: {0}")]
    Batch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("token lookup collision")]
    TokenLookupCollision,

    #[error("invalid token format")]
    InvalidTokenFormat,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!("invariant violation: {message}");
        Error::Invariant(message)
    }

    /// A copy of this error for one of several waiters on a shared failure.
    /// Kinds that map to distinct client responses survive; the rest become
    /// [`Error::Batch`].
    pub fn share(&self) -> Self {
        match self {
            Error::NotFound => Error::NotFound,
            Error::AccessDenied => Error::AccessDenied,
            Error::Timeout => Error::Timeout,
            Error::Invalid(m) => Error::Invalid(m.clone()),
            Error::Conflict(m) => Error::Conflict(m.clone()),
            Error::Invariant(m) => Error::Invariant(m.clone()),
            Error::Upstream(m) => Error::Upstream(m.clone()),
            Error::Batch(m) => Error::Batch(m.clone()),
            other => Error::Batch(other.to_string()),
        }
    }
}
