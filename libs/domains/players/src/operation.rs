//! Bridge adapter for the `player` resource

use async_trait::async_trait;
use rpc_bridge::{Operation, OperationError, Verb};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::models::{NewPlayer, PlayerName, UpdatePlayer};
use crate::repository::PlayerRepository;
use crate::service::PlayerService;

pub const RESOURCE: &str = "player";

/// Routes bridge verbs to the player service
pub struct PlayerOperation<R: PlayerRepository> {
    service: PlayerService<R>,
}

impl<R: PlayerRepository> PlayerOperation<R> {
    pub fn new(service: PlayerService<R>) -> Self {
        Self { service }
    }
}

fn decode<T: DeserializeOwned>(verb: Verb, payload: Value) -> Result<T, OperationError> {
    serde_json::from_value(payload)
        .map_err(|e| OperationError::Validation(format!("{} payload: {}", verb, e)))
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Value, OperationError> {
    serde_json::to_value(value).map_err(|e| OperationError::other(e.to_string()))
}

#[async_trait]
impl<R: PlayerRepository + 'static> Operation for PlayerOperation<R> {
    fn resource(&self) -> &str {
        RESOURCE
    }

    async fn execute(&self, verb: Verb, payload: Value) -> Result<Value, OperationError> {
        match verb {
            Verb::GetAll => encode(&self.service.list_players().await?),
            Verb::GetByName => {
                let name: PlayerName = decode(verb, payload)?;
                encode(&self.service.get_player(name.as_str()).await?)
            }
            Verb::Insert => {
                let input: NewPlayer = decode(verb, payload)?;
                encode(&self.service.create_player(input).await?)
            }
            Verb::Update => {
                let input: UpdatePlayer = decode(verb, payload)?;
                encode(&self.service.update_player(input).await?)
            }
            Verb::Delete => {
                let name: PlayerName = decode(verb, payload)?;
                let deleted = self.service.delete_player(name.as_str()).await?;
                Ok(json!({ "deleted": deleted }))
            }
            Verb::DeleteAll => {
                let removed = self.service.delete_all_players().await?;
                Ok(json!({ "deleted": removed }))
            }
            Verb::Exists => {
                let name: PlayerName = decode(verb, payload)?;
                Ok(Value::Bool(self.service.player_exists(name.as_str()).await?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlayerError;
    use crate::memory::InMemoryPlayerRepository;
    use crate::repository::MockPlayerRepository;

    fn operation() -> PlayerOperation<InMemoryPlayerRepository> {
        PlayerOperation::new(PlayerService::new(InMemoryPlayerRepository::default()))
    }

    #[tokio::test]
    async fn test_insert_then_lookup() {
        let op = operation();
        op.execute(Verb::Insert, json!({"name": "Alice", "level": 3}))
            .await
            .unwrap();

        let found = op.execute(Verb::GetByName, json!("Alice")).await.unwrap();
        assert_eq!(found["name"], "Alice");
        assert_eq!(found["level"], 3);
        assert_eq!(found["version"], 1);

        let all = op.execute(Verb::GetAll, Value::Null).await.unwrap();
        assert_eq!(all.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_missing_player_is_not_found() {
        let err = operation()
            .execute(Verb::GetByName, json!({"name": "Ghost"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::NotFound(_)));
        assert_eq!(err.to_string(), "player Ghost not found");
    }

    #[tokio::test]
    async fn test_duplicate_and_stale_writes_conflict() {
        let op = operation();
        op.execute(Verb::Insert, json!({"name": "Alice"})).await.unwrap();

        let duplicate = op
            .execute(Verb::Insert, json!({"name": "Alice"}))
            .await
            .unwrap_err();
        assert!(matches!(duplicate, OperationError::Conflict(_)));

        op.execute(Verb::Update, json!({"name": "Alice", "score": 10, "version": 1}))
            .await
            .unwrap();
        let stale = op
            .execute(Verb::Update, json!({"name": "Alice", "score": 20, "version": 1}))
            .await
            .unwrap_err();
        assert!(matches!(stale, OperationError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_a_validation_failure() {
        let err = operation()
            .execute(Verb::Update, json!({"name": "Alice"}))
            .await
            .unwrap_err();
        assert!(matches!(err, OperationError::Validation(msg) if msg.starts_with("update payload")));
    }

    #[tokio::test]
    async fn test_exists_and_delete() {
        let op = operation();
        op.execute(Verb::Insert, json!({"name": "Bob"})).await.unwrap();

        assert_eq!(op.execute(Verb::Exists, json!("Bob")).await.unwrap(), json!(true));
        assert_eq!(
            op.execute(Verb::Delete, json!("Bob")).await.unwrap(),
            json!({"deleted": true})
        );
        assert_eq!(op.execute(Verb::Exists, json!("Bob")).await.unwrap(), json!(false));
        assert_eq!(
            op.execute(Verb::DeleteAll, Value::Null).await.unwrap(),
            json!({"deleted": 0})
        );
    }

    #[tokio::test]
    async fn test_saturated_pool_is_resource_exhausted() {
        let mut repo = MockPlayerRepository::new();
        repo.expect_list()
            .returning(|| Err(PlayerError::PoolExhausted(std::time::Duration::from_secs(5))));

        let op = PlayerOperation::new(PlayerService::new(repo));
        let err = op.execute(Verb::GetAll, Value::Null).await.unwrap_err();
        assert!(matches!(err, OperationError::ResourceExhausted(_)));
    }
}
