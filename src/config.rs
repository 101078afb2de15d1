//! Configuration types for Spectrec

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::record::is_valid_platform;
use crate::{Result, SpectrecError};

/// A player whose games are watched by the poller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Player {
    /// Upstream summoner id
    pub id: String,
    /// Platform the player belongs to
    pub platform: String,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Players to watch for active games
    #[serde(default)]
    pub players: Vec<Player>,

    /// Directory for storing and loading recordings
    #[serde(default = "default_recordings_directory")]
    pub recordings_directory: PathBuf,

    /// Address the replay server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// API key used by the player poller
    #[serde(default)]
    pub riot_api_key: String,

    /// How often the full player list is polled, in seconds
    #[serde(rename = "refresh_rate_seconds", default = "default_refresh_rate")]
    pub refresh_rate: u64,

    /// Cap on the number of recordings kept before eviction
    #[serde(default = "default_keep_num_recordings")]
    pub keep_num_recordings: usize,
}

fn default_recordings_directory() -> PathBuf {
    PathBuf::from("recordings")
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_refresh_rate() -> u64 {
    120
}

fn default_keep_num_recordings() -> usize {
    40
}

impl Default for Config {
    fn default() -> Self {
        Self {
            players: Vec::new(),
            recordings_directory: default_recordings_directory(),
            bind_address: default_bind_address(),
            riot_api_key: String::new(),
            refresh_rate: default_refresh_rate(),
            keep_num_recordings: default_keep_num_recordings(),
        }
    }
}

impl Config {
    /// Load and validate a configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            SpectrecError::Config(format!("failed to read {}: {e}", path.display()))
        })?;

        let config: Config = serde_json::from_slice(&data)
            .map_err(|e| SpectrecError::Config(format!("invalid configuration: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        for player in &self.players {
            if !is_valid_platform(&player.platform) {
                return Err(SpectrecError::Config(format!(
                    "{}'s platform {} is not a valid platform",
                    player.id, player.platform
                )));
            }
        }

        if self.keep_num_recordings == 0 {
            return Err(SpectrecError::Config(
                "keep_num_recordings must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert!(config.players.is_empty());
        assert_eq!(config.recordings_directory, PathBuf::from("recordings"));
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.refresh_rate, 120);
        assert_eq!(config.keep_num_recordings, 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_full_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "players": [{"id": "12345", "platform": "OC1"}],
                "recordings_directory": "/var/lib/spectrec",
                "bind_address": "127.0.0.1:9000",
                "riot_api_key": "secret",
                "refresh_rate_seconds": 60,
                "keep_num_recordings": 10
            }"#,
        )
        .unwrap();

        assert_eq!(config.players.len(), 1);
        assert_eq!(config.players[0].platform, "OC1");
        assert_eq!(config.refresh_rate, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_platform_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"players": [{"id": "12345", "platform": "XX9"}]}"#,
        )
        .unwrap();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_keep_num_rejected() {
        let config: Config =
            serde_json::from_str(r#"{"keep_num_recordings": 0}"#).unwrap();

        assert!(config.validate().is_err());
    }
}
