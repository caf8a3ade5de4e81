// src/utils/logging.rs
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, EnvFilter};

use crate::utils::config::LoggingConfig;
use crate::utils::error::{Result, RunnerError};

/// Installs the global subscriber. When a log directory is configured the
/// output goes to a daily rolling file and the returned guard must be kept
/// alive for the life of the process.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| RunnerError::Config(format!("Invalid log level: {}", e)))?;

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .try_init()
                .map_err(|e| RunnerError::Config(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            // Plugins write to stderr; the host forwards it line by line.
            fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .try_init()
                .map_err(|e| RunnerError::Config(e.to_string()))?;
            Ok(None)
        }
    }
}

/// Minimal logging capability handed to the launcher and its plugin clients.
pub trait PluginLogger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    /// Child logger whose name replaces this logger's name.
    fn named(&self, name: &str) -> Arc<dyn PluginLogger>;
    fn name(&self) -> &str;
}

/// Adapts `tracing` to [`PluginLogger`]; the logger name travels as the
/// `logger` field.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    name: String,
}

impl TracingLogger {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("plugin-runner")
    }
}

impl PluginLogger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(logger = %self.name, "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(logger = %self.name, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(logger = %self.name, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(logger = %self.name, "{}", message);
    }

    fn named(&self, name: &str) -> Arc<dyn PluginLogger> {
        Arc::new(TracingLogger::new(name))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
