use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("CONFLICT: {0}")]
    Conflict(String),
    #[error("INVALID_TRANSITION: {0}")]
    InvalidTransition(String),
    #[error("INVALID_INPUT: {0}")]
    Validation(String),
    #[error("PERSISTENCE_FAILURE: {0}")]
    Persistence(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors the caller can act on (resolve the active session, fix input) rather than faults.
    pub fn is_actionable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::InvalidTransition(_) | Self::Validation(_) | Self::NotFound(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Persistence(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::AppError;

    #[test]
    fn error_messages_carry_machine_readable_prefix() {
        let error = AppError::Conflict("session abc is still running".to_string());
        assert_eq!(error.to_string(), "CONFLICT: session abc is still running");
        assert!(error.is_actionable());
    }

    #[test]
    fn sqlite_failures_map_to_persistence() {
        let error = AppError::from(rusqlite::Error::InvalidQuery);
        assert!(matches!(error, AppError::Persistence(_)));
        assert!(!error.is_actionable());
    }
}
