// src/plugins/types.rs
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::traits::Plugin;
use crate::core::crypto::checksum::{parse_hex_digest, Sha256Digest};
use crate::utils::config::CatalogEntry;
use crate::utils::error::{Result, RunnerError};

/// Constructor for a plugin compiled into the host.
pub type BuiltinFactory = Arc<dyn Fn() -> anyhow::Result<Box<dyn Plugin>> + Send + Sync>;

/// Where a plugin's code lives.
#[derive(Clone)]
pub enum PluginSource {
    InProcess(BuiltinFactory),
    Subprocess {
        command: String,
        args: Vec<String>,
        sha256: Sha256Digest,
    },
}

impl fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginSource::InProcess(_) => f.write_str("InProcess(..)"),
            PluginSource::Subprocess { command, args, sha256 } => f
                .debug_struct("Subprocess")
                .field("command", command)
                .field("args", args)
                .field("sha256", &hex::encode(sha256))
                .finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PluginDescriptor {
    pub name: String,
    pub source: PluginSource,
}

impl PluginDescriptor {
    pub fn subprocess(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        sha256: Sha256Digest,
    ) -> Result<Self> {
        let descriptor = Self {
            name: name.into(),
            source: PluginSource::Subprocess {
                command: command.into(),
                args,
                sha256,
            },
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn builtin(name: impl Into<String>, factory: BuiltinFactory) -> Self {
        Self {
            name: name.into(),
            source: PluginSource::InProcess(factory),
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self.source, PluginSource::InProcess(_))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(RunnerError::DescriptorInvalid("plugin name is empty".into()));
        }
        if let PluginSource::Subprocess { command, .. } = &self.source {
            if command.trim().is_empty() {
                return Err(RunnerError::DescriptorInvalid(format!(
                    "plugin {} has no command",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl TryFrom<&CatalogEntry> for PluginDescriptor {
    type Error = RunnerError;

    fn try_from(entry: &CatalogEntry) -> Result<Self> {
        if entry.sha256.is_empty() {
            return Err(RunnerError::DescriptorInvalid(format!(
                "plugin {} is registered without a sha256",
                entry.name
            )));
        }
        let sha256 = parse_hex_digest(&entry.sha256)?;
        Self::subprocess(&entry.name, &entry.command, entry.args.clone(), sha256)
    }
}

/// Values both sides must agree on before the plugin will serve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    pub protocol_version: u32,
    pub magic_cookie_key: String,
    pub magic_cookie_value: String,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            protocol_version: 1,
            magic_cookie_key: "PLUGIN_RUNNER_MAGIC_COOKIE".into(),
            magic_cookie_value: "b1f5c7d0a4e2436e9d3c8f7a6b5e4d3c".into(),
        }
    }
}

/// Names of the environment variables shared by the launcher and the plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapContract {
    pub unwrap_token_env: String,
    /// Only used on test and manual bootstrap paths.
    pub ca_cert_pem_env: String,
    pub metadata_mode_env: String,
    pub mlock_enabled_env: String,
    /// Address of the host endpoint the plugin unwraps its token against.
    pub api_addr_env: String,
}

impl Default for BootstrapContract {
    fn default() -> Self {
        Self {
            unwrap_token_env: "PLUGIN_UNWRAP_TOKEN".into(),
            ca_cert_pem_env: "PLUGIN_CA_CERT_PEM".into(),
            metadata_mode_env: "PLUGIN_METADATA_MODE".into(),
            mlock_enabled_env: "PLUGIN_MLOCK_ENABLED".into(),
            api_addr_env: "PLUGIN_API_ADDR".into(),
        }
    }
}

/// Ordered environment handed to the plugin process.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct LaunchEnvironment {
    vars: Vec<(String, String)>,
}

impl LaunchEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts `KEY=VALUE` strings; entries without `=` are rejected.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Self::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                RunnerError::DescriptorInvalid(format!("malformed environment entry: {}", pair))
            })?;
            env.push(key, value);
        }
        Ok(env)
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.push((key.into(), value.into()));
    }

    /// Last value wins, matching how the child process will see it.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn count(&self, key: &str) -> usize {
        self.vars.iter().filter(|(k, _)| k == key).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl fmt::Debug for LaunchEnvironment {
    // Values may carry a wrapping token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.vars.iter().map(|(k, _)| format!("{}=..", k)))
            .finish()
    }
}
