// src/utils/config.rs
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use config::{Config as ConfigLib, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use crate::utils::error::{Result, RunnerError};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub runner: RunnerConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunnerConfig {
    /// Lifetime of the wrapped bootstrap token.
    pub wrap_ttl_secs: u64,
    /// Validity window of the ephemeral CA and its leaves.
    pub cert_validity_secs: u64,
    /// How long the host waits for the plugin's handshake line.
    pub handshake_timeout_secs: u64,
    pub mlock: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: Option<String>,
    pub file_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub plugins: Vec<CatalogEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Hex-encoded SHA-256 of the plugin binary, recorded at registration.
    #[serde(default)]
    pub sha256: String,
}

impl Config {
    /// Loads `config/default` and `config/local` (both optional) with
    /// `PLUGIN_RUNNER__SECTION__KEY` environment overrides.
    pub fn new() -> Result<Self> {
        let config = Self::builder()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("PLUGIN_RUNNER").separator("__"))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::builder()?
            .add_source(File::from(path))
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    fn builder() -> Result<ConfigBuilder<DefaultState>> {
        Ok(ConfigLib::builder()
            .set_default("runner.wrap_ttl_secs", 60)?
            .set_default("runner.cert_validity_secs", 86_400)?  // 24h
            .set_default("runner.handshake_timeout_secs", 10)?
            .set_default("runner.mlock", false)?
            .set_default("logging.level", "info")?
            .set_default("logging.file_prefix", "plugin-runner")?)
    }

    fn validate(&self) -> Result<()> {
        if self.runner.wrap_ttl_secs == 0 {
            return Err(RunnerError::Config("wrap_ttl_secs must be greater than 0".into()));
        }
        if self.runner.cert_validity_secs < 60 {
            return Err(RunnerError::Config("cert_validity_secs must be at least 60".into()));
        }
        if self.runner.handshake_timeout_secs == 0 {
            return Err(RunnerError::Config("handshake_timeout_secs must be greater than 0".into()));
        }

        for entry in &self.catalog.plugins {
            if entry.name.is_empty() {
                return Err(RunnerError::Config("catalog entry without a name".into()));
            }
        }

        Ok(())
    }

    pub fn wrap_ttl(&self) -> Duration {
        Duration::from_secs(self.runner.wrap_ttl_secs)
    }

    pub fn cert_validity(&self) -> Duration {
        Duration::from_secs(self.runner.cert_validity_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.runner.handshake_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runner: RunnerConfig {
                wrap_ttl_secs: 60,
                cert_validity_secs: 86_400,
                handshake_timeout_secs: 10,
                mlock: false,
            },
            logging: LoggingConfig {
                level: "info".into(),
                directory: None,
                file_prefix: "plugin-runner".into(),
            },
            catalog: CatalogConfig::default(),
        }
    }
}

impl From<ConfigError> for RunnerError {
    fn from(error: ConfigError) -> Self {
        RunnerError::Config(error.to_string())
    }
}
