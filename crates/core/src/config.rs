//! TOML-based configuration for the reconciliation engine.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Engine configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory for persistent data (tree store database).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Conflict rename settings.
    #[serde(default)]
    pub conflict_names: ConflictNameConfig,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/twinsync")
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            conflict_names: ConflictNameConfig::default(),
        }
    }
}

/// Name patterns for conflict renames (see `name::PatternNameFactory` for
/// the placeholder table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictNameConfig {
    /// Pattern for the loser of a name clash.
    #[serde(default = "default_name_clash_pattern")]
    pub name_clash_pattern: String,

    /// Pattern for a restored node relocated after a delete conflict.
    #[serde(default = "default_delete_conflict_pattern")]
    pub delete_conflict_pattern: String,
}

fn default_name_clash_pattern() -> String {
    "{name} ({n}){ext}".into()
}

fn default_delete_conflict_pattern() -> String {
    "{name} (restored {date}-{n}){ext}".into()
}

impl Default for ConflictNameConfig {
    fn default() -> Self {
        Self {
            name_clash_pattern: default_name_clash_pattern(),
            delete_conflict_pattern: default_delete_conflict_pattern(),
        }
    }
}

impl EngineConfig {
    /// Path of the tree store database inside the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("twinsync.db")
    }

    /// Load and validate a configuration file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading engine configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        debug!("engine configuration loaded");
        Ok(config)
    }

    /// Validate field values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

        if !LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "log_level".into(),
                detail: format!("'{}' is not a tracing level", self.log_level),
            });
        }

        for (field, pattern) in [
            (
                "conflict_names.name_clash_pattern",
                &self.conflict_names.name_clash_pattern,
            ),
            (
                "conflict_names.delete_conflict_pattern",
                &self.conflict_names.delete_conflict_pattern,
            ),
        ] {
            if !pattern.contains("{name}") {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "pattern must contain the {name} placeholder".into(),
                });
            }

            // Without a varying part repeated rename attempts cannot make
            // progress.
            if !pattern.contains("{n}") && !pattern.contains("{random}") {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "pattern must contain {n} or {random}".into(),
                });
            }
        }

        Ok(())
    }
}
