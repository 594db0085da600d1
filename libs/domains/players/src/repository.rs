use async_trait::async_trait;

use crate::error::PlayerResult;
use crate::models::{NewPlayer, Player, UpdatePlayer};

/// Repository trait for Player persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlayerRepository: Send + Sync {
    /// All players, ordered by name
    async fn list(&self) -> PlayerResult<Vec<Player>>;

    async fn get(&self, name: &str) -> PlayerResult<Option<Player>>;

    /// Fails with `DuplicateName` when the name is taken
    async fn insert(&self, input: NewPlayer) -> PlayerResult<Player>;

    /// Fails with `VersionConflict` unless `input.version` matches
    async fn update(&self, input: UpdatePlayer) -> PlayerResult<Player>;

    /// Whether a player was removed
    async fn delete(&self, name: &str) -> PlayerResult<bool>;

    /// Number of players removed
    async fn delete_all(&self) -> PlayerResult<u64>;

    async fn exists(&self, name: &str) -> PlayerResult<bool>;
}
