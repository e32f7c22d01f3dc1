use thiserror::Error;

/// Outcome tag for a non-2xx response or a response without a body.
pub const BAD_RESPONSE: &str = "Bad response from provider";
/// Outcome tag for a malformed frame or an explicit upstream error object.
pub const PARSE_ERROR: &str = "Parse error";
/// Outcome tag for a branch that hit its deadline or was cancelled.
pub const TIMED_OUT: &str = "Request timed out";
/// Outcome tag for everything else.
pub const UNEXPECTED_FAILURE: &str = "Unexpected failure";

#[derive(Error, Debug)]
pub enum Error {
    #[error("API error: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Response has no body")]
    EmptyBody,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Provider protocol error: {0}")]
    Protocol(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("History storage error: {0}")]
    Storage(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// The fixed message reported to clients when a branch fails with this error.
    pub fn outcome_message(&self) -> &'static str {
        match self {
            Error::Api { .. } | Error::EmptyBody => BAD_RESPONSE,
            Error::Protocol(_) | Error::Serialization(_) => PARSE_ERROR,
            Error::Timeout(_) | Error::Cancelled => TIMED_OUT,
            _ => UNEXPECTED_FAILURE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::Cancelled)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
