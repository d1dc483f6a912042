//! Unit configuration.
//!
//! Settings that apply to every handler of a unit and are worth changing
//! without recompiling: the default concurrency strategy, the unit's
//! name and diagnostics. Loaded from YAML files and environment
//! variables, or built in code.

use serde::Deserialize;

use crate::strategy::ConcurrencyStrategy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "tessera.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "TESSERA_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "TESSERA";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "TESSERA_LOG";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Per-unit configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UnitConfig {
    /// Name attached to the unit's log records.
    pub name: Option<String>,

    /// Strategy for handlers registered without one.
    ///
    /// Default: parallel.
    pub default_strategy: ConcurrencyStrategy,

    /// Log events that match no handler (at debug level).
    ///
    /// Default: true.
    pub log_unhandled: bool,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            name: None,
            default_strategy: ConcurrencyStrategy::default(),
            log_unhandled: true,
        }
    }
}

impl UnitConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `tessera.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: UnitConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the unit cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if matches!(self.name.as_deref(), Some(name) if name.trim().is_empty()) {
            return Err(ConfigError::Invalid("name must not be blank".to_string()));
        }
        Ok(())
    }

    /// Set the unit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the default strategy.
    pub fn with_default_strategy(mut self, strategy: ConcurrencyStrategy) -> Self {
        self.default_strategy = strategy;
        self
    }
}
