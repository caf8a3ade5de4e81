// src/plugins/flags.rs
//! Flags for operators who run a plugin binary by hand.
//!
//! These configure how the plugin reaches the host API when no launcher is
//! involved. They never configure the plugin's own listener.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use rustls::ClientConfig;

use crate::core::crypto::tls::{client_config, parse_certs, parse_private_key, root_store, root_store_from_dir};
use crate::utils::error::{Result, RunnerError};

#[derive(Debug, Clone, Default, Parser)]
#[command(name = "plugin", about = "Plugin TLS settings")]
pub struct ClientTlsOverride {
    /// CA certificate used to verify the host (PEM file)
    #[arg(long)]
    pub ca_cert: Option<String>,

    /// Directory of CA certificates used to verify the host
    #[arg(long)]
    pub ca_path: Option<String>,

    /// Client certificate presented to the host (PEM file)
    #[arg(long)]
    pub client_cert: Option<String>,

    /// Key for --client-cert (PEM file)
    #[arg(long)]
    pub client_key: Option<String>,

    /// Skip verification of the host certificate
    #[arg(long)]
    pub tls_skip_verify: bool,

    /// Run in metadata mode
    #[arg(long)]
    pub metadata: bool,
}

/// Explicit TLS settings collected from the flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOverride {
    pub ca_cert: Option<String>,
    pub ca_path: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub tls_server_name: Option<String>,
    pub insecure: bool,
}

impl ClientTlsOverride {
    /// Parses plugin arguments (without the program name).
    pub fn parse_args<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv = std::iter::once("plugin".to_string()).chain(args.into_iter().map(Into::into));
        Self::try_parse_from(argv).map_err(|e| RunnerError::Config(e.to_string()))
    }

    pub fn fetch_metadata(&self) -> bool {
        self.metadata
    }

    /// `None` unless at least one TLS flag was given, in which case the
    /// bootstrap defaults are not used.
    pub fn tls_config(&self) -> Option<TlsOverride> {
        let any_set = [&self.ca_cert, &self.ca_path, &self.client_cert, &self.client_key]
            .iter()
            .any(|flag| flag.as_deref().map_or(false, |v| !v.is_empty()))
            || self.tls_skip_verify;

        if !any_set {
            return None;
        }

        Some(TlsOverride {
            ca_cert: non_empty(&self.ca_cert),
            ca_path: non_empty(&self.ca_path),
            client_cert: non_empty(&self.client_cert),
            client_key: non_empty(&self.client_key),
            tls_server_name: None,
            insecure: self.tls_skip_verify,
        })
    }
}

impl TlsOverride {
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let mut certs = Vec::new();
        if let Some(ca_cert) = &self.ca_cert {
            certs.extend(parse_certs(&read_pem(ca_cert)?)?);
        }
        let roots = match (&self.ca_path, certs.is_empty()) {
            (Some(dir), true) => Some(root_store_from_dir(Path::new(dir))?),
            (Some(dir), false) => {
                let mut roots = root_store(certs)?;
                for cert in root_store_from_dir(Path::new(dir))?.roots {
                    roots.roots.push(cert);
                }
                Some(roots)
            }
            (None, false) => Some(root_store(certs)?),
            (None, true) => None,
        };

        let identity = match (&self.client_cert, &self.client_key) {
            (Some(cert), Some(key)) => Some((
                parse_certs(&read_pem(cert)?)?,
                parse_private_key(&read_pem(key)?)?,
            )),
            (None, None) => None,
            _ => {
                return Err(RunnerError::Config(
                    "--client-cert and --client-key must be given together".into(),
                ))
            }
        };

        client_config(roots, identity, self.insecure)
    }
}

/// Accepts inline PEM or a path to a PEM file.
pub fn read_pem(value: &str) -> Result<String> {
    if value.trim_start().starts_with("-----BEGIN") {
        return Ok(value.to_string());
    }
    std::fs::read_to_string(value)
        .map_err(|e| RunnerError::Config(format!("cannot read {}: {}", value, e)))
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|v| !v.is_empty()).cloned()
}
