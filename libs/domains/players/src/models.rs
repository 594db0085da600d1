use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use validator::Validate;

/// Player tier, derived from level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlayerTier {
    Rookie,
    Veteran,
    Elite,
}

impl PlayerTier {
    pub fn for_level(level: u32) -> Self {
        match level {
            0..=9 => PlayerTier::Rookie,
            10..=49 => PlayerTier::Veteran,
            _ => PlayerTier::Elite,
        }
    }
}

/// Player entity. `name` is the natural key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub name: String,
    pub level: u32,
    pub score: i64,
    /// Bumped on every successful update
    pub version: u64,
    pub tier: PlayerTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// DTO for inserting a player
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct NewPlayer {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[serde(default = "default_level")]
    #[validate(range(min = 1, max = 100))]
    pub level: u32,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub score: i64,
}

fn default_level() -> u32 {
    1
}

/// DTO for updating a player
///
/// `version` must match the stored version or the update is rejected.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UpdatePlayer {
    #[validate(length(min = 1, max = 64))]
    pub name: String,
    #[validate(range(min = 1, max = 100))]
    pub level: Option<u32>,
    #[validate(range(min = 0))]
    pub score: Option<i64>,
    pub version: u64,
}

/// Lookup by name. Accepts a bare string or `{"name": ...}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum PlayerName {
    Bare(String),
    Keyed { name: String },
}

impl PlayerName {
    pub fn as_str(&self) -> &str {
        match self {
            PlayerName::Bare(name) | PlayerName::Keyed { name } => name,
        }
    }

    pub fn into_inner(self) -> String {
        match self {
            PlayerName::Bare(name) | PlayerName::Keyed { name } => name,
        }
    }
}

impl Player {
    pub fn new(input: NewPlayer) -> Self {
        let now = Utc::now();
        Self {
            tier: PlayerTier::for_level(input.level),
            name: input.name,
            level: input.level,
            score: input.score,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply an update and bump the version
    pub fn apply_update(&mut self, update: UpdatePlayer) {
        if let Some(level) = update.level {
            self.level = level;
            self.tier = PlayerTier::for_level(level);
        }
        if let Some(score) = update.score {
            self.score = score;
        }
        self.version += 1;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_player_starts_at_version_one() {
        let player = Player::new(NewPlayer {
            name: "Alice".to_string(),
            level: 12,
            score: 0,
        });
        assert_eq!(player.version, 1);
        assert_eq!(player.tier, PlayerTier::Veteran);
    }

    #[test]
    fn test_apply_update_bumps_version() {
        let mut player = Player::new(NewPlayer {
            name: "Alice".to_string(),
            level: 1,
            score: 0,
        });
        player.apply_update(UpdatePlayer {
            name: "Alice".to_string(),
            level: Some(60),
            score: None,
            version: 1,
        });
        assert_eq!(player.version, 2);
        assert_eq!(player.level, 60);
        assert_eq!(player.tier, PlayerTier::Elite);
    }

    #[test]
    fn test_validation_rejects_out_of_range_level() {
        let input: NewPlayer = serde_json::from_value(json!({"name": "Bob", "level": 0})).unwrap();
        assert!(input.validate().is_err());

        let input: NewPlayer = serde_json::from_value(json!({"name": "Bob"})).unwrap();
        assert!(input.validate().is_ok());
        assert_eq!(input.level, 1);
    }

    #[test]
    fn test_player_name_accepts_both_shapes() {
        let bare: PlayerName = serde_json::from_value(json!("Alice")).unwrap();
        let keyed: PlayerName = serde_json::from_value(json!({"name": "Alice"})).unwrap();
        assert_eq!(bare.as_str(), keyed.as_str());
    }
}
