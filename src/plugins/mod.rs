// src/plugins/mod.rs
pub mod connection;
pub mod consumer;
pub mod flags;
pub mod handshake;
pub mod manager;
pub mod registry;
pub mod runner;
pub mod traits;
pub mod types;
pub mod wrapping;

pub use connection::{OperationKind, PluginConnection};
pub use consumer::{Bootstrap, BootstrapConsumer, IncomingConnection, PluginServer, ServeMode};
pub use flags::{ClientTlsOverride, TlsOverride};
pub use manager::PluginManager;
pub use registry::PluginCatalog;
pub use runner::{PluginClient, PluginRunner};
pub use types::{BootstrapContract, HandshakeConfig, LaunchEnvironment, PluginDescriptor, PluginSource};
