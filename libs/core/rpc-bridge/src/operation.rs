//! The narrow interface the bridge invokes on the domain layer.
//!
//! A domain crate implements [`Operation`] once per resource. The bridge
//! decides which [`Verb`] to run from the queue a delivery arrived on and
//! passes the envelope payload through untouched.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};
use thiserror::Error;

/// Verbs exposed per resource. Each one gets its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum Verb {
    /// No payload.
    GetAll,
    /// Payload is a name string.
    GetByName,
    /// Payload is a full entity.
    Insert,
    /// Payload is a full entity.
    Update,
    /// Payload is a name string.
    Delete,
    /// No payload.
    DeleteAll,
    /// Payload is a name string.
    Exists,
}

/// Startup group a verb's subscription belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, AsRefStr, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Wave {
    Reads,
    Writes,
    ExistenceChecks,
}

impl Wave {
    /// Waves in start order.
    pub fn ordered() -> impl Iterator<Item = Self> {
        Self::iter()
    }
}

impl Verb {
    pub fn all() -> impl Iterator<Item = Self> {
        Self::iter()
    }

    /// Whether a successful run changes the resource.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Verb::Insert | Verb::Update | Verb::Delete | Verb::DeleteAll
        )
    }

    /// Reads are side-effect free and served through the result cache.
    pub fn is_read(&self) -> bool {
        !self.is_mutation()
    }

    pub fn wave(&self) -> Wave {
        match self {
            Verb::GetAll | Verb::GetByName => Wave::Reads,
            Verb::Exists => Wave::ExistenceChecks,
            _ => Wave::Writes,
        }
    }

    /// Concurrency ceiling for this verb given the read and write defaults.
    pub fn ceiling(&self, read: usize, write: usize) -> usize {
        if self.is_read() { read } else { write }
    }
}

/// Failure reported by an operation.
///
/// Tagged variants classify directly. `Other` carries only a message and is
/// sorted by the classifier's rule list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OperationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("{0}")]
    Other(String),
}

impl OperationError {
    pub fn other(message: impl Into<String>) -> Self {
        OperationError::Other(message.into())
    }
}

/// A resource's domain operations.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Resource name, e.g. `player`. Used for queue names and cache keys.
    fn resource(&self) -> &str;

    /// Run `verb` with the envelope payload.
    async fn execute(&self, verb: Verb, payload: Value) -> Result<Value, OperationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verb_names() {
        assert_eq!(Verb::GetByName.to_string(), "get-by-name");
        assert_eq!(Verb::DeleteAll.as_ref(), "delete-all");
        assert_eq!("get-all".parse::<Verb>().unwrap(), Verb::GetAll);
        assert_eq!(Verb::all().count(), 7);
    }

    #[test]
    fn test_verb_waves() {
        assert_eq!(Verb::GetAll.wave(), Wave::Reads);
        assert_eq!(Verb::GetByName.wave(), Wave::Reads);
        assert_eq!(Verb::Insert.wave(), Wave::Writes);
        assert_eq!(Verb::DeleteAll.wave(), Wave::Writes);
        assert_eq!(Verb::Exists.wave(), Wave::ExistenceChecks);

        let order: Vec<Wave> = Wave::ordered().collect();
        assert_eq!(order, vec![Wave::Reads, Wave::Writes, Wave::ExistenceChecks]);
    }

    #[test]
    fn test_mutations_get_write_ceiling() {
        assert_eq!(Verb::Exists.ceiling(3, 1), 3);
        assert_eq!(Verb::Update.ceiling(3, 1), 1);
        assert_eq!(Verb::Delete.ceiling(3, 1), 1);
        assert!(Verb::Delete.is_mutation());
        assert!(!Verb::Exists.is_mutation());
    }

    #[test]
    fn test_not_found_message() {
        let err = OperationError::NotFound("player Ghost".into());
        assert_eq!(err.to_string(), "player Ghost not found");
    }
}
