//! Handles settings for the application. Configuration is read from an
//! optional `settings.toml` and from `TALLY__*` environment variables
//! (e.g. `TALLY__ENGINE__BACKUP_CAPACITY=10`).
use config::{Config, ConfigError, Environment, File};
use engine::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct App {
    pub level: String,
}

impl Default for App {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Directory holding one JSON file per committed table.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Data {
    pub dir: String,
}

impl Default for Data {
    fn default() -> Self {
        Self {
            dir: "./data".to_string(),
        }
    }
}

/// Directory backing the durable backup store.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Backup {
    pub dir: String,
}

impl Default for Backup {
    fn default() -> Self {
        Self {
            dir: "./data/backups".to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub app: App,
    pub data: Data,
    pub backup: Backup,
    pub engine: EngineConfig,
}

impl Settings {
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("TALLY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        settings.try_deserialize()
    }
}
