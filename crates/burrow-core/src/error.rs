use thiserror::Error;

/// Errors produced by the burrow protocol and relay layers.
#[derive(Debug, Error)]
pub enum BurrowError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("unknown service kind: {0}")]
    UnknownService(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("server unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for BurrowError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        BurrowError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for BurrowError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        BurrowError::Codec(e.to_string())
    }
}

pub type BurrowResult<T> = Result<T, BurrowError>;
