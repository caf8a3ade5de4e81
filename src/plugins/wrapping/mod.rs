// src/plugins/wrapping/mod.rs
//! Response wrapping of the plugin's TLS bootstrap material.
//!
//! The server leaf, its key and the ephemeral CA never cross the process
//! boundary in plaintext. They are wrapped into a single-use token, the token
//! is handed to the plugin, and the plugin exchanges it exactly once.

pub mod endpoint;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::crypto::ca::{CertRole, EphemeralCa};
use crate::core::crypto::secure_memory::zero_string;
use crate::plugins::traits::{RunnerUtil, Unwrapper, Wrapper};
use crate::utils::config::Config;
use crate::utils::error::{Result, RunnerError};

pub use endpoint::{RemoteUnwrapper, UnwrapEndpoint};

const TOKEN_BYTES: usize = 32;
const CONSUMED_RETENTION: Duration = Duration::from_secs(3600);

/// What the wrapping service hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrapInfo {
    pub token: String,
    pub ttl: Duration,
    pub creation_time: DateTime<Utc>,
}

/// Plaintext bootstrap material. Only ever lives in memory between signing
/// and wrapping on the host, and between unwrapping and listener setup in the
/// plugin.
#[derive(Serialize, Deserialize)]
pub struct BootstrapPayload {
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
}

impl BootstrapPayload {
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self)
            .map_err(|e| RunnerError::WrapService(format!("payload encoding failed: {}", e)))
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| RunnerError::Unwrap(format!("malformed bootstrap payload: {}", e)))
    }
}

impl std::fmt::Debug for BootstrapPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BootstrapPayload([REDACTED])")
    }
}

impl Drop for BootstrapPayload {
    fn drop(&mut self) {
        zero_string(&mut self.server_key);
        zero_string(&mut self.server_cert);
        zero_string(&mut self.ca_cert);
    }
}

/// Signs a server leaf with `ca` and wraps it together with the CA
/// certificate. A wrapping failure aborts the launch; the material is never
/// sent unwrapped.
pub async fn wrap_server_config(
    util: &dyn RunnerUtil,
    ca: &EphemeralCa,
    ttl: Duration,
) -> Result<WrapInfo> {
    let server = ca.sign_leaf(CertRole::Server)?;
    let server_key = server
        .key_pem()
        .expose_str()
        .ok_or_else(|| RunnerError::CertGeneration("server key is not valid PEM".into()))?
        .to_string();

    let payload = BootstrapPayload {
        ca_cert: ca.cert_pem(),
        server_cert: server.cert_pem.clone(),
        server_key,
    };

    let info = util
        .response_wrap_data(payload.to_value()?, ttl)
        .await
        .map_err(|e| match e {
            RunnerError::WrapService(_) => e,
            other => RunnerError::WrapService(other.to_string()),
        })?;

    if info.token.is_empty() {
        return Err(RunnerError::WrapService("wrapping service returned an empty token".into()));
    }

    Ok(info)
}

/// [`RunnerUtil`] backed by any [`Wrapper`] plus the host's mlock policy.
pub struct SystemView {
    wrapper: Arc<dyn Wrapper>,
    mlock: bool,
}

impl SystemView {
    pub fn new(wrapper: Arc<dyn Wrapper>, mlock: bool) -> Self {
        Self { wrapper, mlock }
    }

    /// Takes the mlock policy from `runner.mlock`.
    pub fn from_config(config: &Config, wrapper: Arc<dyn Wrapper>) -> Self {
        Self::new(wrapper, config.runner.mlock)
    }
}

#[async_trait]
impl RunnerUtil for SystemView {
    async fn response_wrap_data(&self, data: serde_json::Value, ttl: Duration) -> Result<WrapInfo> {
        self.wrapper.wrap(data, ttl).await
    }

    fn mlock_enabled(&self) -> bool {
        self.mlock
    }
}

struct WrappedEntry {
    payload: serde_json::Value,
    expires_at: Instant,
}

#[derive(Default)]
struct WrapState {
    live: HashMap<String, WrappedEntry>,
    consumed: HashMap<String, Instant>,
}

impl WrapState {
    fn purge(&mut self, now: Instant) {
        self.live.retain(|_, entry| entry.expires_at > now);
        self.consumed
            .retain(|_, at| now.duration_since(*at) < CONSUMED_RETENTION);
    }
}

/// In-process wrapping service. Every token is removed on its first unwrap
/// attempt whether or not that attempt succeeds.
pub struct InMemoryWrapper {
    state: Mutex<WrapState>,
    rng: SystemRandom,
}

impl InMemoryWrapper {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WrapState::default()),
            rng: SystemRandom::new(),
        }
    }

    pub fn live_tokens(&self) -> usize {
        self.state.lock().live.len()
    }

    fn new_token(&self) -> Result<String> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| RunnerError::WrapService("random source unavailable".into()))?;
        Ok(hex::encode(bytes))
    }
}

impl Default for InMemoryWrapper {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Wrapper for InMemoryWrapper {
    async fn wrap(&self, payload: serde_json::Value, ttl: Duration) -> Result<WrapInfo> {
        if ttl.is_zero() {
            return Err(RunnerError::WrapService("ttl must be greater than zero".into()));
        }

        let token = self.new_token()?;
        let now = Instant::now();

        let mut state = self.state.lock();
        state.purge(now);
        state.live.insert(
            token.clone(),
            WrappedEntry {
                payload,
                expires_at: now + ttl,
            },
        );
        debug!(live = state.live.len(), "Wrapped payload");

        Ok(WrapInfo {
            token,
            ttl,
            creation_time: Utc::now(),
        })
    }
}

#[async_trait]
impl Unwrapper for InMemoryWrapper {
    async fn unwrap(&self, token: &str) -> Result<serde_json::Value> {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.purge(now);

        if state.consumed.contains_key(token) {
            warn!("Rejected replay of a consumed wrapping token");
            return Err(RunnerError::Unwrap("wrapping token already consumed".into()));
        }

        // Only issued tokens are remembered; unknown ones leave no state.
        let entry = state
            .live
            .remove(token)
            .ok_or_else(|| RunnerError::Unwrap("unknown wrapping token".into()))?;
        state.consumed.insert(token.to_string(), now);

        if entry.expires_at <= now {
            return Err(RunnerError::Unwrap("wrapping token expired".into()));
        }

        Ok(entry.payload)
    }
}
