use thiserror::Error;

/// Errors produced by ptyhub.
///
/// `NotFound` covers both a missing session and a session owned by someone
/// else; callers must not be able to tell the two apart.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("session limit reached ({max} per user)")]
    LimitExceeded { max: usize },

    #[error("session not found: {0}")]
    NotFound(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailure(String),

    #[error("workspace error: {0}")]
    Workspace(String),

    #[error("session is {status}, expected active")]
    InvalidState { status: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("rate limited")]
    RateLimited,

    #[error("decryption failed")]
    Crypto,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("{0}")]
    Internal(String),
}

impl HubError {
    /// Stable machine-readable code sent to API clients.
    pub fn code(&self) -> &'static str {
        match self {
            HubError::Validation(_) => "validation_error",
            HubError::LimitExceeded { .. } => "limit_exceeded",
            HubError::NotFound(_) => "not_found",
            HubError::SpawnFailure(_) => "spawn_failure",
            HubError::Workspace(_) => "workspace_error",
            HubError::InvalidState { .. } => "invalid_state",
            HubError::Io(_) => "io_failure",
            HubError::AuthFailed(_) => "auth_failure",
            HubError::RateLimited => "rate_limited",
            HubError::Crypto => "authentication_failure",
            HubError::InvalidMessage(_) => "invalid_message",
            HubError::Internal(_) => "internal_error",
        }
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        HubError::InvalidMessage(e.to_string())
    }
}

pub type HubResult<T> = Result<T, HubError>;
