// src/plugins/manager.rs
//! Mount table for launched plugins.
//!
//! A reload never restarts an existing client. It runs the whole launch
//! protocol again, so the new process gets a new CA, new leaves and a new
//! token, and the old process is killed.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::core::crypto::secure_memory::lock_process_memory;
use crate::plugins::connection::PluginConnection;
use crate::plugins::runner::{PluginClient, PluginRunner};
use crate::plugins::traits::{Looker, Plugin, RunnerUtil, Wrapper};
use crate::plugins::types::{
    BootstrapContract, HandshakeConfig, LaunchEnvironment, PluginDescriptor, PluginSource,
};
use crate::plugins::wrapping::SystemView;
use crate::utils::config::Config;
use crate::utils::error::{Result, RunnerError};
use crate::utils::logging::PluginLogger;

pub enum Backend {
    Subprocess(Arc<PluginClient>),
    Builtin(Arc<Mutex<Box<dyn Plugin>>>),
}

impl Backend {
    async fn teardown(self, mount: &str) {
        match self {
            Backend::Subprocess(client) => {
                if let Err(e) = client.kill().await {
                    warn!(mount, error = %e, "Failed to kill plugin process");
                }
            }
            Backend::Builtin(plugin) => {
                if let Err(e) = plugin.lock().await.shutdown().await {
                    warn!(mount, error = %e, "Built-in plugin shutdown failed");
                }
            }
        }
    }
}

impl Clone for Backend {
    fn clone(&self) -> Self {
        match self {
            Backend::Subprocess(client) => Backend::Subprocess(client.clone()),
            Backend::Builtin(plugin) => Backend::Builtin(plugin.clone()),
        }
    }
}

struct Mount {
    plugin_name: String,
    backend: Backend,
}

pub struct PluginManager {
    runner: Arc<PluginRunner>,
    looker: Arc<dyn Looker>,
    util: Arc<dyn RunnerUtil>,
    handshake: HandshakeConfig,
    env: LaunchEnvironment,
    mounts: RwLock<HashMap<String, Mount>>,
}

impl PluginManager {
    pub fn new(
        runner: Arc<PluginRunner>,
        looker: Arc<dyn Looker>,
        util: Arc<dyn RunnerUtil>,
        handshake: HandshakeConfig,
    ) -> Self {
        Self {
            runner,
            looker,
            util,
            handshake,
            env: LaunchEnvironment::new(),
            mounts: RwLock::new(HashMap::new()),
        }
    }

    /// Builds the runner and the wrapping view from `config`. With
    /// `runner.mlock` set the host locks its own memory and every launch asks
    /// the plugin to do the same.
    pub fn from_config(
        config: &Config,
        looker: Arc<dyn Looker>,
        wrapper: Arc<dyn Wrapper>,
        logger: Arc<dyn PluginLogger>,
    ) -> Self {
        if config.runner.mlock {
            match lock_process_memory() {
                Ok(()) => info!("Host process memory locked"),
                Err(e) => warn!(error = %e, "Failed to lock host process memory"),
            }
        }

        let runner = PluginRunner::from_config(config, BootstrapContract::default(), logger);
        let util = SystemView::from_config(config, wrapper);
        Self::new(Arc::new(runner), looker, Arc::new(util), HandshakeConfig::default())
    }

    /// Environment passed to every launched plugin.
    pub fn with_environment(mut self, env: LaunchEnvironment) -> Self {
        self.env = env;
        self
    }

    pub async fn mount(&self, path: &str, plugin_name: &str) -> Result<()> {
        if self.mounts.read().await.contains_key(path) {
            return Err(RunnerError::Config(format!("{} is already mounted", path)));
        }

        let backend = self.launch(plugin_name).await?;
        let mut mounts = self.mounts.write().await;
        if mounts.contains_key(path) {
            drop(mounts);
            backend.teardown(path).await;
            return Err(RunnerError::Config(format!("{} is already mounted", path)));
        }
        mounts.insert(
            path.to_string(),
            Mount {
                plugin_name: plugin_name.to_string(),
                backend,
            },
        );
        info!(mount = path, plugin = plugin_name, "Mounted plugin");
        Ok(())
    }

    pub async fn unmount(&self, path: &str) -> Result<()> {
        let mount = self
            .mounts
            .write()
            .await
            .remove(path)
            .ok_or_else(|| RunnerError::NotFound(format!("nothing mounted at {}", path)))?;
        mount.backend.teardown(path).await;
        info!(mount = path, "Unmounted plugin");
        Ok(())
    }

    pub async fn backend(&self, path: &str) -> Result<Backend> {
        self.mounts
            .read()
            .await
            .get(path)
            .map(|m| m.backend.clone())
            .ok_or_else(|| RunnerError::NotFound(format!("nothing mounted at {}", path)))
    }

    /// Opens a channel to the plugin behind `path`, starting it on first use.
    pub async fn connect(&self, path: &str) -> Result<PluginConnection> {
        match self.backend(path).await? {
            Backend::Subprocess(client) => client.connect().await,
            Backend::Builtin(_) => Err(RunnerError::DescriptorInvalid(format!(
                "{} is served in process and has no channel",
                path
            ))),
        }
    }

    pub async fn mounts(&self) -> Vec<(String, String)> {
        let mut mounts: Vec<(String, String)> = self
            .mounts
            .read()
            .await
            .iter()
            .map(|(path, m)| (path.clone(), m.plugin_name.clone()))
            .collect();
        mounts.sort();
        mounts
    }

    /// Relaunches every mount of `plugin_name`. Returns how many were reloaded.
    pub async fn reload_plugin(&self, plugin_name: &str) -> Result<usize> {
        let paths: Vec<String> = self
            .mounts
            .read()
            .await
            .iter()
            .filter(|(_, m)| m.plugin_name == plugin_name)
            .map(|(path, _)| path.clone())
            .collect();

        if paths.is_empty() {
            return Err(RunnerError::NotFound(format!(
                "plugin {} is not mounted",
                plugin_name
            )));
        }

        for path in &paths {
            self.reload_mount(path).await?;
        }
        Ok(paths.len())
    }

    pub async fn reload_mounts<S: AsRef<str>>(&self, paths: &[S]) -> Result<()> {
        for path in paths {
            self.reload_mount(path.as_ref()).await?;
        }
        Ok(())
    }

    /// Called when a request to a mount failed at the transport level. The
    /// mount is relaunched so the next request reaches a fresh process.
    pub async fn report_rpc_failure(&self, path: &str, cause: &RunnerError) -> Result<()> {
        warn!(mount = path, error = %cause, "Plugin RPC failed; reloading");
        self.reload_mount(path).await
    }

    pub async fn shutdown(&self) {
        let mounts: Vec<(String, Mount)> = self.mounts.write().await.drain().collect();
        let count = mounts.len();
        join_all(
            mounts
                .into_iter()
                .map(|(path, mount)| async move { mount.backend.teardown(&path).await }),
        )
        .await;
        info!(count, "Plugin manager shut down");
    }

    async fn reload_mount(&self, path: &str) -> Result<()> {
        let plugin_name = self
            .mounts
            .read()
            .await
            .get(path)
            .map(|m| m.plugin_name.clone())
            .ok_or_else(|| RunnerError::NotFound(format!("nothing mounted at {}", path)))?;

        let backend = self.launch(&plugin_name).await.map_err(|e| {
            error!(mount = path, plugin = %plugin_name, error = %e, "Plugin reload failed");
            e
        })?;

        let previous = {
            let mut mounts = self.mounts.write().await;
            match mounts.get_mut(path) {
                Some(mount) => Some(std::mem::replace(&mut mount.backend, backend)),
                None => {
                    drop(mounts);
                    backend.teardown(path).await;
                    return Err(RunnerError::NotFound(format!("{} was unmounted during reload", path)));
                }
            }
        };

        if let Some(previous) = previous {
            previous.teardown(path).await;
        }
        info!(mount = path, plugin = %plugin_name, "Reloaded plugin");
        Ok(())
    }

    async fn launch(&self, plugin_name: &str) -> Result<Backend> {
        let descriptor: PluginDescriptor = self.looker.lookup_plugin(plugin_name).await?;
        match &descriptor.source {
            PluginSource::InProcess(factory) => {
                let mut plugin = factory().map_err(|e| {
                    RunnerError::Process(format!("built-in plugin {} failed: {:#}", plugin_name, e))
                })?;
                plugin.initialize().await?;
                Ok(Backend::Builtin(Arc::new(Mutex::new(plugin))))
            }
            PluginSource::Subprocess { .. } => {
                let client = self
                    .runner
                    .run(&descriptor, self.util.as_ref(), &self.env, &self.handshake, false)
                    .await?;
                Ok(Backend::Subprocess(Arc::new(client)))
            }
        }
    }
}
