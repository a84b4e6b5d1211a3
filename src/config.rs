//! Layered configuration.
//!
//! Settings merge from TOML files in precedence order: built-in defaults,
//! the global user file, then the workspace files. Every field carries a
//! serde default so each file can be partial; validation runs on the
//! merged result.

use crate::error::InventoryError;
use crate::logging::LoggingConfig;
use crate::session::SessionSettings;
use config::builder::DefaultState;
use config::{Config, ConfigBuilder, File};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Root configuration: one backend session plus logging.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurserConfig {
    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration validation errors.
#[derive(Debug, Clone)]
pub enum ValidationError {
    Session(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Session(msg) => write!(f, "Session: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl PurserConfig {
    /// Validate the entire configuration, collecting every section's
    /// complaint rather than stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.session.validate() {
            errors.push(ValidationError::Session(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loader for the layered configuration files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load one TOML file directly, no layering.
    pub fn load_from_file(path: &Path) -> Result<PurserConfig, InventoryError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            InventoryError::Config(format!("could not read {}: {}", path.display(), e))
        })?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Path of the global config file, `~/.config/purser/config.toml`.
    /// None when `HOME` is not set.
    pub fn global_config_path() -> Option<PathBuf> {
        std::env::var("HOME").ok().map(|home| {
            PathBuf::from(home)
                .join(".config")
                .join("purser")
                .join("config.toml")
        })
    }

    /// Layered load: defaults, then the global file, then the workspace's
    /// `config/config.toml` and `config/{PURSER_ENV}.toml`. Later sources
    /// win.
    pub fn load(workspace_root: &Path) -> Result<PurserConfig, InventoryError> {
        let mut builder = Config::builder();
        builder = Self::add_global_source(builder);
        builder = Self::add_workspace_sources(builder, workspace_root);

        let merged = builder.build()?;
        let config: PurserConfig = merged.try_deserialize()?;
        debug!(
            endpoint = %config.session.endpoint,
            "Loaded layered configuration"
        );
        Ok(config)
    }

    fn add_global_source(builder: ConfigBuilder<DefaultState>) -> ConfigBuilder<DefaultState> {
        match Self::global_config_path() {
            Some(path) if path.exists() => builder.add_source(File::from(path).required(false)),
            Some(path) => {
                warn!(
                    config_path = %path.display(),
                    "No global configuration file; user-level settings fall back to defaults"
                );
                builder
            }
            None => builder,
        }
    }

    fn add_workspace_sources(
        mut builder: ConfigBuilder<DefaultState>,
        workspace_root: &Path,
    ) -> ConfigBuilder<DefaultState> {
        let config_dir = workspace_root.join("config");
        let environment =
            std::env::var("PURSER_ENV").unwrap_or_else(|_| "development".to_string());

        let base_path = config_dir.join("config.toml");
        if base_path.exists() {
            builder = builder.add_source(File::from(base_path).required(false));
        }

        let env_path = config_dir.join(format!("{}.toml", environment));
        if env_path.exists() {
            builder = builder.add_source(File::from(env_path).required(false));
        }

        builder
    }
}

/// Shared runtime configuration with validated reload.
pub struct ConfigManager {
    config: Arc<RwLock<PurserConfig>>,
}

impl ConfigManager {
    pub fn new(config: PurserConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
        }
    }

    /// Reload from the layered files. The running configuration only
    /// changes when the new one validates.
    pub fn reload(&self, workspace_root: &Path) -> Result<(), InventoryError> {
        let new_config = ConfigLoader::load(workspace_root)?;
        new_config.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            InventoryError::Config(format!(
                "configuration validation failed: {}",
                messages.join("; ")
            ))
        })?;

        *self.config.write() = new_config;
        Ok(())
    }

    /// Current configuration snapshot.
    pub fn get(&self) -> PurserConfig {
        self.config.read().clone()
    }
}
