use thiserror::Error;

/// Errors produced by the gateway protocol layer.
#[derive(Debug, Error)]
pub enum GwError {
    #[error("codec error: {0}")]
    Codec(String),

    /// A request whose `id` could be read but which is otherwise not a
    /// valid frame.
    #[error("bad request {id}: {reason}")]
    BadRequest { id: String, reason: String },

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GwError {
    fn from(e: serde_json::Error) -> Self {
        GwError::Codec(e.to_string())
    }
}

pub type GwResult<T> = Result<T, GwError>;
