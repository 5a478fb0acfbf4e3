use std::time::Duration;

/// Workspace reported an error status while we waited for it.
pub const CODE_READINESS_INIT_FAILED: i32 = 3001;
/// Polling the workspace status failed (transport or decode error).
pub const CODE_READINESS_CHECK_ERROR: i32 = 3002;
/// Workspace did not become ready before the deadline.
pub const CODE_READINESS_TIMEOUT: i32 = 3003;

pub type Result<T> = std::result::Result<T, HypervisorError>;

#[derive(Debug, thiserror::Error)]
pub enum HypervisorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("illegal operation: {0}")]
    IllegalOperation(String),

    #[error("{operation} failed: {message} (code {code})")]
    SandboxOperation {
        operation: String,
        message: String,
        code: i32,
    },

    #[error("no interrupt acknowledgement from sandbox {sandbox_id} within {timeout:?}")]
    InterruptAckTimeout {
        sandbox_id: String,
        timeout: Duration,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("user {user_id} already has {running} running topics (limit {limit})")]
    ConcurrencyLimit {
        user_id: String,
        running: usize,
        limit: usize,
    },

    /// User-facing failure of the message dispatch flow. The cause is kept
    /// in the task's stored error message, not here.
    #[error("initialize task failed")]
    TaskInitFailed,
}

impl HypervisorError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn sandbox(operation: impl Into<String>, message: impl Into<String>, code: i32) -> Self {
        Self::SandboxOperation {
            operation: operation.into(),
            message: message.into(),
            code,
        }
    }

    /// Provider/readiness code carried by a sandbox operation failure.
    pub fn sandbox_code(&self) -> Option<i32> {
        match self {
            Self::SandboxOperation { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_readiness_timeout(&self) -> bool {
        self.sandbox_code() == Some(CODE_READINESS_TIMEOUT)
    }

    pub fn is_readiness_check_error(&self) -> bool {
        self.sandbox_code() == Some(CODE_READINESS_CHECK_ERROR)
    }

    pub fn is_readiness_init_failed(&self) -> bool {
        self.sandbox_code() == Some(CODE_READINESS_INIT_FAILED)
    }
}

impl From<reqwest::Error> for HypervisorError {
    fn from(e: reqwest::Error) -> Self {
        HypervisorError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HypervisorError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        HypervisorError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for HypervisorError {
    fn from(e: serde_json::Error) -> Self {
        HypervisorError::Transport(format!("invalid payload: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_predicates() {
        let timeout = HypervisorError::sandbox("Wait for workspace ready", "timeout", 3003);
        assert!(timeout.is_readiness_timeout());
        assert!(!timeout.is_readiness_check_error());

        let not_found = HypervisorError::not_found("topic", "t-1");
        assert_eq!(not_found.sandbox_code(), None);
        assert_eq!(not_found.to_string(), "topic not found: t-1");
    }
}
