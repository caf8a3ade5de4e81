// src/plugins/traits/mod.rs
use std::time::Duration;

use async_trait::async_trait;

use crate::plugins::types::PluginDescriptor;
use crate::plugins::wrapping::WrapInfo;
use crate::utils::error::Result;

/// A plugin compiled into the host and constructed by a [`BuiltinFactory`].
///
/// [`BuiltinFactory`]: crate::plugins::types::BuiltinFactory
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    async fn initialize(&mut self) -> Result<()>;
    async fn shutdown(&mut self) -> Result<()>;
}

/// Looks plugins up in the catalog.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Looker: Send + Sync {
    async fn lookup_plugin(&self, name: &str) -> Result<PluginDescriptor>;
}

/// Issues single-use, time-limited wrapping tokens.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Wrapper: Send + Sync {
    async fn wrap(&self, payload: serde_json::Value, ttl: Duration) -> Result<WrapInfo>;
}

/// Exchanges a wrapping token for its payload. A token can be exchanged at
/// most once.
#[async_trait]
pub trait Unwrapper: Send + Sync {
    async fn unwrap(&self, token: &str) -> Result<serde_json::Value>;
}

/// Host facilities the launcher needs: wrapping and the memory-locking policy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunnerUtil: Send + Sync {
    async fn response_wrap_data(&self, data: serde_json::Value, ttl: Duration) -> Result<WrapInfo>;
    fn mlock_enabled(&self) -> bool;
}
