use thiserror::Error;

/// Errors produced by the lobby protocol layer.
#[derive(Debug, Error)]
pub enum LobbyError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for LobbyError {
    fn from(e: serde_json::Error) -> Self {
        LobbyError::Codec(e.to_string())
    }
}

pub type LobbyResult<T> = Result<T, LobbyError>;
