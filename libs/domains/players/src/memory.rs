//! In-memory player store behind a bounded connection pool
//!
//! Every call holds one pool slot for its duration. A caller that cannot get a
//! slot within `acquire_timeout` fails with `PoolExhausted`, the same way a
//! database pool reports saturation.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::debug;

use crate::error::{PlayerError, PlayerResult};
use crate::models::{NewPlayer, Player, UpdatePlayer};
use crate::repository::PlayerRepository;

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct InMemoryPlayerRepository {
    players: Arc<RwLock<BTreeMap<String, Player>>>,
    pool: Arc<Semaphore>,
    acquire_timeout: Duration,
    latency: Duration,
}

impl Default for InMemoryPlayerRepository {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE)
    }
}

impl InMemoryPlayerRepository {
    pub fn new(pool_size: usize) -> Self {
        Self {
            players: Arc::new(RwLock::new(BTreeMap::new())),
            pool: Arc::new(Semaphore::new(pool_size)),
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
            latency: Duration::ZERO,
        }
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Simulated per-call latency while the slot is held
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Free pool slots
    pub fn available(&self) -> usize {
        self.pool.available_permits()
    }

    async fn checkout(&self) -> PlayerResult<OwnedSemaphorePermit> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.pool.clone().acquire_owned())
            .await
            .map_err(|_| PlayerError::PoolExhausted(self.acquire_timeout))?
            .map_err(|_| PlayerError::Internal("connection pool closed".to_string()))?;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(permit)
    }
}

#[async_trait]
impl PlayerRepository for InMemoryPlayerRepository {
    async fn list(&self) -> PlayerResult<Vec<Player>> {
        let _slot = self.checkout().await?;
        Ok(self.players.read().await.values().cloned().collect())
    }

    async fn get(&self, name: &str) -> PlayerResult<Option<Player>> {
        let _slot = self.checkout().await?;
        Ok(self.players.read().await.get(name).cloned())
    }

    async fn insert(&self, input: NewPlayer) -> PlayerResult<Player> {
        let _slot = self.checkout().await?;
        let mut players = self.players.write().await;
        if players.contains_key(&input.name) {
            return Err(PlayerError::DuplicateName(input.name));
        }
        let player = Player::new(input);
        players.insert(player.name.clone(), player.clone());
        debug!(name = %player.name, "Player inserted");
        Ok(player)
    }

    async fn update(&self, input: UpdatePlayer) -> PlayerResult<Player> {
        let _slot = self.checkout().await?;
        let mut players = self.players.write().await;
        let player = players
            .get_mut(&input.name)
            .ok_or_else(|| PlayerError::NotFound(input.name.clone()))?;
        if player.version != input.version {
            return Err(PlayerError::VersionConflict {
                name: input.name,
                expected: input.version,
                actual: player.version,
            });
        }
        player.apply_update(input);
        Ok(player.clone())
    }

    async fn delete(&self, name: &str) -> PlayerResult<bool> {
        let _slot = self.checkout().await?;
        Ok(self.players.write().await.remove(name).is_some())
    }

    async fn delete_all(&self) -> PlayerResult<u64> {
        let _slot = self.checkout().await?;
        let mut players = self.players.write().await;
        let removed = players.len() as u64;
        players.clear();
        Ok(removed)
    }

    async fn exists(&self, name: &str) -> PlayerResult<bool> {
        let _slot = self.checkout().await?;
        Ok(self.players.read().await.contains_key(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> NewPlayer {
        NewPlayer {
            name: "Alice".to_string(),
            level: 5,
            score: 100,
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicates() {
        let repo = InMemoryPlayerRepository::default();
        repo.insert(alice()).await.unwrap();

        let err = repo.insert(alice()).await.unwrap_err();
        assert!(matches!(err, PlayerError::DuplicateName(name) if name == "Alice"));
    }

    #[tokio::test]
    async fn test_update_checks_version() {
        let repo = InMemoryPlayerRepository::default();
        repo.insert(alice()).await.unwrap();

        let updated = repo
            .update(UpdatePlayer {
                name: "Alice".to_string(),
                level: Some(6),
                score: None,
                version: 1,
            })
            .await
            .unwrap();
        assert_eq!(updated.version, 2);

        let stale = repo
            .update(UpdatePlayer {
                name: "Alice".to_string(),
                level: Some(7),
                score: None,
                version: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            stale,
            PlayerError::VersionConflict { expected: 1, actual: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_update_missing_player() {
        let repo = InMemoryPlayerRepository::default();
        let err = repo
            .update(UpdatePlayer {
                name: "Ghost".to_string(),
                level: None,
                score: None,
                version: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_all_counts() {
        let repo = InMemoryPlayerRepository::default();
        repo.insert(alice()).await.unwrap();
        repo.insert(NewPlayer {
            name: "Bob".to_string(),
            level: 1,
            score: 0,
        })
        .await
        .unwrap();

        assert_eq!(repo.delete_all().await.unwrap(), 2);
        assert!(repo.list().await.unwrap().is_empty());
        assert!(!repo.delete("Alice").await.unwrap());
    }

    #[tokio::test]
    async fn test_saturated_pool_times_out() {
        let repo = InMemoryPlayerRepository::new(1)
            .with_acquire_timeout(Duration::from_millis(20))
            .with_latency(Duration::from_millis(200));

        let busy = repo.clone();
        let holder = tokio::spawn(async move { busy.list().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = repo.exists("Alice").await.unwrap_err();
        assert!(matches!(err, PlayerError::PoolExhausted(_)));
        holder.await.unwrap().unwrap();
        assert_eq!(repo.available(), 1);
    }
}
