use serde::Deserialize;
use whiteboard_sync::ServerConfig;

const ENV_PREFIX: &str = "WHITEBOARD_";

/// Server settings read from `WHITEBOARD_*` environment variables.
///
/// Unset variables keep the [`ServerConfig`] defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    pub bind_addr: Option<String>,
    pub max_participants_per_room: Option<usize>,
    pub broadcast_capacity: Option<usize>,
    pub truncate_log_on_clear: Option<bool>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable error: {0}")]
    Env(#[from] envy::Error),
}

impl Config {
    /// Load `.env` if present, then read the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Ok(envy::prefixed(ENV_PREFIX).from_env::<Config>()?)
    }

    pub fn from_vars<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        Ok(envy::prefixed(ENV_PREFIX).from_iter::<_, Config>(vars)?)
    }

    pub fn server_config(&self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind_addr: self.bind_addr.clone().unwrap_or(defaults.bind_addr),
            max_participants_per_room: self
                .max_participants_per_room
                .unwrap_or(defaults.max_participants_per_room),
            broadcast_capacity: self
                .broadcast_capacity
                .unwrap_or(defaults.broadcast_capacity),
            truncate_log_on_clear: self
                .truncate_log_on_clear
                .unwrap_or(defaults.truncate_log_on_clear),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_empty_environment_uses_defaults() {
        let config = Config::from_vars(Vec::new()).unwrap();
        assert_eq!(config.server_config(), ServerConfig::default());
    }

    #[test]
    fn test_prefixed_overrides() {
        let config = Config::from_vars(vars(&[
            ("WHITEBOARD_BIND_ADDR", "0.0.0.0:8080"),
            ("WHITEBOARD_MAX_PARTICIPANTS_PER_ROOM", "12"),
            ("WHITEBOARD_TRUNCATE_LOG_ON_CLEAR", "true"),
            ("BIND_ADDR", "ignored:1"),
        ]))
        .unwrap();

        let server = config.server_config();
        assert_eq!(server.bind_addr, "0.0.0.0:8080");
        assert_eq!(server.max_participants_per_room, 12);
        assert_eq!(server.broadcast_capacity, 256);
        assert!(server.truncate_log_on_clear);
    }

    #[test]
    fn test_invalid_number_is_an_error() {
        let result = Config::from_vars(vars(&[("WHITEBOARD_BROADCAST_CAPACITY", "lots")]));
        assert!(result.is_err());
    }
}
