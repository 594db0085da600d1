use rpc_bridge::OperationError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("player {0}")]
    NotFound(String),

    #[error("Duplicate key '{0}'")]
    DuplicateName(String),

    #[error("player {name} is at version {actual}, update expected {expected}")]
    VersionConflict {
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("connection pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type PlayerResult<T> = Result<T, PlayerError>;

/// Tag player failures for the bridge's classifier
impl From<PlayerError> for OperationError {
    fn from(err: PlayerError) -> Self {
        match err {
            PlayerError::NotFound(_) => OperationError::NotFound(err.to_string()),
            PlayerError::DuplicateName(_) | PlayerError::VersionConflict { .. } => {
                OperationError::Conflict(err.to_string())
            }
            PlayerError::Validation(msg) => OperationError::Validation(msg),
            PlayerError::PoolExhausted(_) => OperationError::ResourceExhausted(err.to_string()),
            PlayerError::Internal(msg) => OperationError::Other(msg),
        }
    }
}

impl From<validator::ValidationErrors> for PlayerError {
    fn from(err: validator::ValidationErrors) -> Self {
        PlayerError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_tags() {
        assert!(matches!(
            OperationError::from(PlayerError::NotFound("Ghost".into())),
            OperationError::NotFound(msg) if msg == "player Ghost"
        ));
        assert!(matches!(
            OperationError::from(PlayerError::VersionConflict {
                name: "Alice".into(),
                expected: 1,
                actual: 2,
            }),
            OperationError::Conflict(_)
        ));
        assert!(matches!(
            OperationError::from(PlayerError::PoolExhausted(Duration::from_millis(50))),
            OperationError::ResourceExhausted(_)
        ));
    }
}
