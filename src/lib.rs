// src/lib.rs
//! Launches plugin binaries as child processes and hands each one its TLS
//! identity through a single-use wrapping token.
//!
//! The host side lives in [`plugins::runner`] and [`plugins::manager`]; a
//! plugin binary uses [`plugins::consumer`] to unwrap its material and serve.

pub mod core;
pub mod plugins;
pub mod utils;

pub use crate::plugins::{
    BootstrapConsumer, BootstrapContract, HandshakeConfig, PluginClient, PluginManager,
    PluginRunner,
};
pub use crate::utils::config::Config;
pub use crate::utils::error::{Result, RunnerError};
