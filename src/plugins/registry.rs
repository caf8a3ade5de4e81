// src/plugins/registry.rs
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::plugins::traits::Looker;
use crate::plugins::types::{BuiltinFactory, PluginDescriptor};
use crate::utils::config::{CatalogConfig, CatalogEntry};
use crate::utils::error::{Result, RunnerError};

/// Plugins the host knows how to launch, by name.
#[derive(Default)]
pub struct PluginCatalog {
    plugins: RwLock<HashMap<String, PluginDescriptor>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the catalog from configuration. Every entry must carry a
    /// digest; one bad entry fails the whole load.
    pub fn from_config(config: &CatalogConfig) -> Result<Self> {
        let mut plugins = HashMap::new();
        for entry in &config.plugins {
            let descriptor = PluginDescriptor::try_from(entry)?;
            if plugins.insert(descriptor.name.clone(), descriptor).is_some() {
                return Err(RunnerError::Config(format!(
                    "plugin {} is registered twice",
                    entry.name
                )));
            }
        }
        info!(count = plugins.len(), "Loaded plugin catalog");

        Ok(Self {
            plugins: RwLock::new(plugins),
        })
    }

    /// Adds or replaces a plugin.
    pub async fn register(&self, descriptor: PluginDescriptor) -> Result<()> {
        descriptor.validate()?;
        let mut plugins = self.plugins.write().await;
        debug!(plugin = %descriptor.name, builtin = descriptor.is_builtin(), "Registered plugin");
        plugins.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub async fn register_entry(&self, entry: &CatalogEntry) -> Result<()> {
        self.register(PluginDescriptor::try_from(entry)?).await
    }

    pub async fn register_builtin(&self, name: &str, factory: BuiltinFactory) -> Result<()> {
        self.register(PluginDescriptor::builtin(name, factory)).await
    }

    pub async fn deregister(&self, name: &str) -> bool {
        self.plugins.write().await.remove(name).is_some()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Looker for PluginCatalog {
    async fn lookup_plugin(&self, name: &str) -> Result<PluginDescriptor> {
        self.plugins
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| RunnerError::NotFound(format!("no plugin named {}", name)))
    }
}
