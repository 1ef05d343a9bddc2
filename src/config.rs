use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::db::{BatchConfig, ConnectionConfig};
use crate::query::{Entity, TableBindings};

/// Settings of one observation store, stored as TOML.
///
/// ```toml
/// [connection]
/// host = "localhost"
/// database = "osh"
///
/// [batch]
/// batch_size = 500
///
/// [tables]
/// obs = "obs"
/// datastream = "datastreams"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub connection: ConnectionConfig,
    pub batch: BatchConfig,
    pub tables: TableBindings,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            batch: BatchConfig::default(),
            tables: TableBindings::new()
                .with(Entity::Observation, "obs")
                .with(Entity::DataStream, "datastreams")
                .with(Entity::Foi, "fois")
                .with(Entity::System, "systems"),
        }
    }
}

impl StoreConfig {
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("pgobs").join("config.toml"))
    }

    /// Load from the default location; defaults when no file exists.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()?)
    }

    /// The password is never written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
