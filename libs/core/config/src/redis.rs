use crate::{ConfigError, FromEnv, env_or_default};

/// Redis connection settings
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Logical database selected after connecting
    pub database: Option<u8>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// URL with the database appended when one is configured and the URL
    /// does not already name one.
    pub fn connection_url(&self) -> String {
        let Some(database) = self.database else {
            return self.url.clone();
        };

        let trimmed = self.url.trim_end_matches('/');
        let has_path = trimmed
            .split_once("://")
            .map(|(_, rest)| rest.contains('/'))
            .unwrap_or(false);
        if has_path {
            self.url.clone()
        } else {
            format!("{}/{}", trimmed, database)
        }
    }
}

impl FromEnv for RedisConfig {
    /// `REDIS_URL`, falling back to `REDIS_HOST`, is required.
    /// `REDIS_DATABASE` is optional.
    fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        let database = match env_or_default("REDIS_DATABASE", "").trim() {
            "" => None,
            raw => Some(raw.parse().map_err(|e| ConfigError::ParseError {
                key: "REDIS_DATABASE".to_string(),
                details: format!("{}", e),
            })?),
        };

        Ok(Self { url, database })
    }
}
