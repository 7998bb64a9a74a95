use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    /// The local database could not be opened, read, or written
    #[error("Local store unavailable: {0}")]
    StoreUnavailable(String),

    /// The server could not be reached (connection, DNS, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Core(#[from] silt_core::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ClientError>;

impl From<libsql::Error> for ClientError {
    fn from(error: libsql::Error) -> Self {
        Self::StoreUnavailable(error.to_string())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(error: reqwest::Error) -> Self {
        Self::Transport(error.to_string())
    }
}

impl ClientError {
    /// Whether a retry without operator intervention can plausibly succeed
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
