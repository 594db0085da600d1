//! Player Service - validation and business rules over the repository

use std::sync::Arc;
use tracing::instrument;
use validator::Validate;

use crate::error::{PlayerError, PlayerResult};
use crate::models::{NewPlayer, Player, UpdatePlayer};
use crate::repository::PlayerRepository;

pub struct PlayerService<R: PlayerRepository> {
    repository: Arc<R>,
}

impl<R: PlayerRepository> PlayerService<R> {
    pub fn new(repository: R) -> Self {
        Self {
            repository: Arc::new(repository),
        }
    }

    #[instrument(skip(self))]
    pub async fn list_players(&self) -> PlayerResult<Vec<Player>> {
        self.repository.list().await
    }

    #[instrument(skip(self))]
    pub async fn get_player(&self, name: &str) -> PlayerResult<Player> {
        self.repository
            .get(name)
            .await?
            .ok_or_else(|| PlayerError::NotFound(name.to_string()))
    }

    #[instrument(skip(self, input), fields(player_name = %input.name))]
    pub async fn create_player(&self, input: NewPlayer) -> PlayerResult<Player> {
        input.validate()?;
        self.repository.insert(input).await
    }

    #[instrument(skip(self, input), fields(player_name = %input.name, version = input.version))]
    pub async fn update_player(&self, input: UpdatePlayer) -> PlayerResult<Player> {
        input.validate()?;
        self.repository.update(input).await
    }

    #[instrument(skip(self))]
    pub async fn delete_player(&self, name: &str) -> PlayerResult<bool> {
        self.repository.delete(name).await
    }

    #[instrument(skip(self))]
    pub async fn delete_all_players(&self) -> PlayerResult<u64> {
        self.repository.delete_all().await
    }

    #[instrument(skip(self))]
    pub async fn player_exists(&self, name: &str) -> PlayerResult<bool> {
        if name.trim().is_empty() {
            return Err(PlayerError::Validation("name must not be blank".to_string()));
        }
        self.repository.exists(name).await
    }
}

impl<R: PlayerRepository> Clone for PlayerService<R> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MockPlayerRepository;

    #[tokio::test]
    async fn test_get_missing_player_is_not_found() {
        let mut repo = MockPlayerRepository::new();
        repo.expect_get()
            .withf(|name| name == "Ghost")
            .times(1)
            .returning(|_| Ok(None));

        let service = PlayerService::new(repo);
        let err = service.get_player("Ghost").await.unwrap_err();
        assert!(matches!(err, PlayerError::NotFound(name) if name == "Ghost"));
    }

    #[tokio::test]
    async fn test_invalid_insert_never_reaches_repository() {
        let mut repo = MockPlayerRepository::new();
        repo.expect_insert().never();

        let service = PlayerService::new(repo);
        let err = service
            .create_player(NewPlayer {
                name: String::new(),
                level: 1,
                score: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PlayerError::Validation(_)));
    }

    #[tokio::test]
    async fn test_blank_exists_is_rejected() {
        let mut repo = MockPlayerRepository::new();
        repo.expect_exists().never();

        let service = PlayerService::new(repo);
        assert!(matches!(
            service.player_exists("  ").await,
            Err(PlayerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_pool_exhaustion_propagates() {
        let mut repo = MockPlayerRepository::new();
        repo.expect_list()
            .returning(|| Err(PlayerError::PoolExhausted(std::time::Duration::from_secs(5))));

        let service = PlayerService::new(repo);
        assert!(matches!(
            service.list_players().await,
            Err(PlayerError::PoolExhausted(_))
        ));
    }
}
