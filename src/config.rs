use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::hashing::{DEFAULT_HASH_SIZE, validate_hash_size};
use crate::similarity::DEFAULT_THRESHOLD;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Minimum combined similarity, in percent, for a match to be reported.
    #[serde(default = "default_threshold")]
    pub threshold: f64,

    #[serde(default = "default_supported_extensions")]
    pub supported_extensions: Vec<String>,

    /// How many of a record's most recent locations `history list` shows.
    #[serde(default = "default_recent_locations")]
    pub recent_locations: usize,

    /// Hash grid edge. Changing it makes existing records incomparable.
    #[serde(default = "default_hash_size")]
    pub hash_size: u32,
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("imgprint")
        .join("image_fingerprints.json")
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

pub fn default_supported_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "bmp", "tiff", "webp"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_recent_locations() -> usize {
    3
}

fn default_hash_size() -> u32 {
    DEFAULT_HASH_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_path: default_store_path(),
            threshold: default_threshold(),
            supported_extensions: default_supported_extensions(),
            recent_locations: default_recent_locations(),
            hash_size: default_hash_size(),
        }
    }
}

impl Config {
    /// Reads `path` if given, otherwise the per-user config file when it
    /// exists. Missing fields take their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = Self::config_path();
                if !default.exists() {
                    return Ok(Config::default());
                }
                default
            }
        };

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config {:?}", config_path))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {:?}", config_path))?;
        config
            .validate()
            .with_context(|| format!("Invalid config {:?}", config_path))?;
        Ok(config)
    }

    /// Checks values serde accepts but the matcher cannot use. Call again
    /// after applying command-line overrides.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=100.0).contains(&self.threshold),
            "Threshold must be between 0 and 100, got {}",
            self.threshold
        );
        validate_hash_size(self.hash_size)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("imgprint")
            .join("config.toml")
    }
}
