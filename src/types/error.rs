//! Error types for the bridge core

/// Main error type for bridge operations
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Malformed id, ownership mismatch, same-protocol follower...
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unauthenticated or unauthorized overwrite of owned content
    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Concurrent writer won; retried by `db::transact`
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// HTTP-equivalent status code for the boundary layer
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Validation(_) => 400,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Database(_) => 503,
            Self::Protocol(_) => 502,
            Self::Config(_) => 500,
            Self::Internal(_) => 500,
        }
    }

    /// Whether a transaction body hitting this error should be re-run
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("JSON error: {}", err))
    }
}

impl From<mongodb::error::Error> for BridgeError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for BridgeError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON encoding failed: {}", err))
    }
}

impl From<tokio::task::JoinError> for BridgeError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("Background task failed: {}", err))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
