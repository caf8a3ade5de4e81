// src/plugins/consumer.rs
//! Plugin side of the launch protocol.
//!
//! A plugin started by [`PluginRunner`](crate::plugins::runner::PluginRunner)
//! finds either a wrapping token or the metadata flag in its environment. The
//! token is exchanged exactly once for the server certificate, key and CA, and
//! the listener only accepts clients holding a leaf from that CA.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::{ClientConfig, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::core::crypto::secure_memory::{lock_process_memory, zero_string};
use crate::core::crypto::tls::{client_config, parse_certs, plugin_server_config, root_store};
use crate::plugins::connection::{OperationKind, PluginConnection};
use crate::plugins::flags::{read_pem, TlsOverride};
use crate::plugins::handshake::{ChannelSecurity, HandshakeLine};
use crate::plugins::traits::Unwrapper;
use crate::plugins::types::{BootstrapContract, HandshakeConfig};
use crate::plugins::wrapping::BootstrapPayload;
use crate::utils::error::{Result, RunnerError};

/// What the launcher left in the environment.
#[derive(Clone, PartialEq, Eq)]
pub enum Bootstrap {
    Wrapped(String),
    Metadata,
    /// Started by hand, or by something that does not speak the protocol.
    NotManaged,
}

impl std::fmt::Debug for Bootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bootstrap::Wrapped(_) => f.write_str("Wrapped([REDACTED])"),
            Bootstrap::Metadata => f.write_str("Metadata"),
            Bootstrap::NotManaged => f.write_str("NotManaged"),
        }
    }
}

pub enum ServeMode {
    Secure(Arc<ServerConfig>),
    MetadataOnly,
}

impl ServeMode {
    pub fn is_secure(&self) -> bool {
        matches!(self, ServeMode::Secure(_))
    }

    pub fn authorize(&self, operation: OperationKind) -> Result<()> {
        match (self, operation) {
            (ServeMode::MetadataOnly, OperationKind::Secure) => Err(RunnerError::MetadataOnly),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for ServeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServeMode::Secure(_) => f.write_str("Secure"),
            ServeMode::MetadataOnly => f.write_str("MetadataOnly"),
        }
    }
}

pub struct BootstrapConsumer {
    contract: BootstrapContract,
    handshake: HandshakeConfig,
}

impl BootstrapConsumer {
    pub fn new(contract: BootstrapContract, handshake: HandshakeConfig) -> Self {
        Self { contract, handshake }
    }

    pub fn contract(&self) -> &BootstrapContract {
        &self.contract
    }

    pub fn handshake(&self) -> &HandshakeConfig {
        &self.handshake
    }

    pub fn resolve_from_env(&self) -> Bootstrap {
        self.resolve(|key| std::env::var(key).ok())
    }

    /// Works out how the plugin was launched. Without the right magic cookie
    /// the plugin is not managed, whatever else is set.
    pub fn resolve<F>(&self, lookup: F) -> Bootstrap
    where
        F: Fn(&str) -> Option<String>,
    {
        match lookup(&self.handshake.magic_cookie_key) {
            Some(cookie) if cookie == self.handshake.magic_cookie_value => {}
            Some(_) => {
                warn!("Magic cookie does not match; not serving");
                return Bootstrap::NotManaged;
            }
            None => return Bootstrap::NotManaged,
        }

        let token = lookup(&self.contract.unwrap_token_env).filter(|t| !t.is_empty());
        if lookup(&self.contract.metadata_mode_env).map_or(false, |v| is_truthy(&v)) {
            if token.is_some() {
                warn!("Both metadata mode and an unwrap token are set; ignoring the token");
            }
            return Bootstrap::Metadata;
        }

        match token {
            Some(token) => Bootstrap::Wrapped(token),
            None => Bootstrap::NotManaged,
        }
    }

    /// Exchanges the token for the listener's TLS material. There is exactly
    /// one unwrap attempt; any failure is fatal for the plugin.
    pub async fn bootstrap(&self, bootstrap: Bootstrap, unwrapper: &dyn Unwrapper) -> Result<ServeMode> {
        let mut token = match bootstrap {
            Bootstrap::Metadata => {
                info!("Serving in metadata mode");
                return Ok(ServeMode::MetadataOnly);
            }
            Bootstrap::NotManaged => {
                return Err(RunnerError::Config(
                    "plugin was not launched by a plugin runner".into(),
                ))
            }
            Bootstrap::Wrapped(token) => token,
        };

        let unwrapped = unwrapper.unwrap(&token).await;
        zero_string(&mut token);
        let value = unwrapped.map_err(|e| match e {
            RunnerError::Unwrap(_) => e,
            other => RunnerError::Unwrap(other.to_string()),
        })?;

        let payload = BootstrapPayload::from_value(value)?;
        let config = plugin_server_config(&payload.ca_cert, &payload.server_cert, &payload.server_key)
            .map_err(|e| RunnerError::Unwrap(format!("unusable bootstrap material: {}", e)))?;

        debug!("Bootstrap material unwrapped");
        Ok(ServeMode::Secure(config))
    }

    pub fn mlock_requested<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(&self.contract.mlock_enabled_env).map_or(false, |v| is_truthy(&v))
    }

    /// Locks the process memory when the launcher asked for it. Failure is
    /// logged and otherwise ignored.
    pub fn apply_mlock_policy<F>(&self, lookup: F) -> bool
    where
        F: Fn(&str) -> Option<String>,
    {
        if !self.mlock_requested(lookup) {
            return false;
        }
        match lock_process_memory() {
            Ok(()) => {
                debug!("Process memory locked");
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to lock process memory");
                false
            }
        }
    }

    pub fn api_addr<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(&self.contract.api_addr_env).filter(|a| !a.is_empty())
    }

    /// TLS config for calls to the host API. Explicit flags win; otherwise the
    /// CA named by the contract's PEM variable (inline PEM or a path) is the
    /// only trusted root.
    pub fn host_api_tls<F>(&self, tls_override: Option<&TlsOverride>, lookup: F) -> Result<Arc<ClientConfig>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tls) = tls_override {
            return tls.client_config();
        }

        let ca = lookup(&self.contract.ca_cert_pem_env)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                RunnerError::Config(format!(
                    "no CA for the host API: set {} or pass TLS flags",
                    self.contract.ca_cert_pem_env
                ))
            })?;
        let roots = root_store(parse_certs(&read_pem(&ca)?)?)?;
        client_config(Some(roots), None, false)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "t")
}

/// Bound on the TLS handshake of a single incoming connection.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(10);

/// The plugin's loopback listener.
pub struct PluginServer {
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    app_version: u32,
    handshake_timeout: Duration,
}

impl PluginServer {
    pub async fn bind(mode: &ServeMode, handshake: &HandshakeConfig) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let acceptor = match mode {
            ServeMode::Secure(config) => Some(TlsAcceptor::from(config.clone())),
            ServeMode::MetadataOnly => None,
        };

        Ok(Self {
            listener,
            acceptor,
            app_version: handshake.protocol_version,
            handshake_timeout: DEFAULT_ACCEPT_TIMEOUT,
        })
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The line to print on stdout once the listener is up.
    pub fn handshake_line(&self) -> Result<HandshakeLine> {
        let security = if self.acceptor.is_some() {
            ChannelSecurity::Tls
        } else {
            ChannelSecurity::Plain
        };
        Ok(HandshakeLine::new(self.app_version, self.local_addr()?, security))
    }

    /// Takes the next TCP connection off the listener. The TLS handshake is
    /// left to [`IncomingConnection::establish`] so that a slow peer never
    /// holds up the accept loop.
    pub async fn accept(&self) -> Result<IncomingConnection> {
        let (tcp, peer) = self.listener.accept().await?;
        Ok(IncomingConnection {
            tcp,
            peer,
            acceptor: self.acceptor.clone(),
            timeout: self.handshake_timeout,
        })
    }
}

/// An accepted socket that has not finished its handshake yet.
pub struct IncomingConnection {
    tcp: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    timeout: Duration,
}

impl IncomingConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn establish(self) -> Result<PluginConnection> {
        let peer = self.peer;
        let Some(acceptor) = self.acceptor else {
            debug!(peer = %peer, "Accepted metadata connection");
            return Ok(PluginConnection::new(Box::new(self.tcp), false));
        };

        let stream = tokio::time::timeout(self.timeout, acceptor.accept(self.tcp))
            .await
            .map_err(|_| RunnerError::Tls(format!("handshake with {} timed out", peer)))?
            .map_err(|e| RunnerError::Tls(format!("handshake with {} failed: {}", peer, e)))?;
        debug!(peer = %peer, "Accepted mutually authenticated connection");
        Ok(PluginConnection::new(Box::new(stream), true))
    }
}
