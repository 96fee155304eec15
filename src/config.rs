use std::env;
use std::str::FromStr;

use thiserror::Error;

use crate::render::{PLAYLIST_DISPLAY_LIMIT, QUEUE_DISPLAY_LIMIT};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Expected {0} in the environment")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub token: String,
    pub prefix: String,
    pub playlist_db: String,
    pub queue_display_limit: usize,
    pub playlist_display_limit: usize,
    pub ytdlp_path: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let token = lookup("DISCORD_TOKEN")
            .filter(|token| !token.trim().is_empty())
            .ok_or(ConfigError::Missing("DISCORD_TOKEN"))?;

        Ok(Config {
            token,
            prefix: lookup("COMMAND_PREFIX").unwrap_or_else(|| "!".to_string()),
            playlist_db: lookup("PLAYLIST_DB").unwrap_or_else(|| "sqlite://playlists.db".to_string()),
            queue_display_limit: parse_or(&lookup, "QUEUE_DISPLAY_LIMIT", QUEUE_DISPLAY_LIMIT)?,
            playlist_display_limit: parse_or(&lookup, "PLAYLIST_DISPLAY_LIMIT", PLAYLIST_DISPLAY_LIMIT)?,
            ytdlp_path: lookup("YTDLP_PATH").unwrap_or_else(|| "yt-dlp".to_string()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();

        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn token_is_required() {
        assert_eq!(config_from(&[]).unwrap_err(), ConfigError::Missing("DISCORD_TOKEN"));
        assert_eq!(config_from(&[("DISCORD_TOKEN", "  ")]).unwrap_err(), ConfigError::Missing("DISCORD_TOKEN"));
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&[("DISCORD_TOKEN", "abc")]).unwrap();

        assert_eq!(config.token, "abc");
        assert_eq!(config.prefix, "!");
        assert_eq!(config.playlist_db, "sqlite://playlists.db");
        assert_eq!(config.queue_display_limit, 15);
        assert_eq!(config.playlist_display_limit, 25);
        assert_eq!(config.ytdlp_path, "yt-dlp");
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("DISCORD_TOKEN", "abc"),
            ("COMMAND_PREFIX", "?"),
            ("QUEUE_DISPLAY_LIMIT", "5"),
            ("PLAYLIST_DB", "sqlite::memory:"),
        ])
        .unwrap();

        assert_eq!(config.prefix, "?");
        assert_eq!(config.queue_display_limit, 5);
        assert_eq!(config.playlist_db, "sqlite::memory:");
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let error = config_from(&[("DISCORD_TOKEN", "abc"), ("QUEUE_DISPLAY_LIMIT", "lots")]).unwrap_err();

        assert_eq!(
            error,
            ConfigError::Invalid {
                key: "QUEUE_DISPLAY_LIMIT",
                value: "lots".to_string()
            }
        );
    }
}
