//! CLI configuration file
//!
//! `~/.config/ferry/config.toml` with a `[transfer]` table holding the core
//! tunables and a `[logging]` table. Missing keys take their defaults.

use anyhow::Context;
use ferry_core::TransferConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when neither `--verbose` nor `--debug` is given
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Complete configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Transfer core tunables
    pub transfer: TransferConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// `~/.config/ferry/config.toml`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".config/ferry/config.toml")
    }

    /// Load from `path`
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load from the default path, or defaults if no file exists there
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check the transfer tunables
    pub fn validate(&self) -> anyhow::Result<()> {
        self.transfer.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_table_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[transfer]\nblock_size = 1048576\nskip_missing_sources = true\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.transfer.block_size, 1_048_576);
        assert!(config.transfer.skip_missing_sources);
        assert_eq!(
            config.transfer.max_window_size,
            TransferConfig::default().max_window_size
        );
        assert_eq!(config.logging.level, "info");
        config.validate().unwrap();
    }

    #[test]
    fn test_serialized_config_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = Config::default();
        config.transfer.fail_fast = true;
        config.logging.level = "debug".into();
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.transfer.fail_fast);
        assert_eq!(loaded.logging.level, "debug");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer]\nmax_window_size = 0\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transfer\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
