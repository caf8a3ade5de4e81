// src/core/crypto/tls.rs
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{self, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};

use super::ca::CertPair;
use crate::utils::error::{Result, RunnerError};

/// Server name the host presents when dialing a plugin.
pub const PLUGIN_SERVER_NAME: &str = "localhost";

pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(crypto::ring::default_provider())
}

pub fn parse_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| RunnerError::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(RunnerError::Tls("PEM contained no certificates".into()));
    }
    Ok(certs)
}

pub fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| RunnerError::Tls(format!("invalid private key PEM: {}", e)))?
        .ok_or_else(|| RunnerError::Tls("PEM contained no private key".into()))
}

pub fn root_store(certs: Vec<CertificateDer<'static>>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// Reads every `.pem`/`.crt` file in a directory into a root store.
pub fn root_store_from_dir(dir: &Path) -> Result<RootCertStore> {
    let mut certs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_cert = path
            .extension()
            .map_or(false, |ext| ext == "pem" || ext == "crt");
        if is_cert {
            certs.extend(parse_certs(&std::fs::read_to_string(&path)?)?);
        }
    }
    if certs.is_empty() {
        return Err(RunnerError::Tls(format!(
            "no certificates found in {}",
            dir.display()
        )));
    }
    root_store(certs)
}

/// Host-side config: trusts only the ephemeral CA and presents the client leaf.
pub fn plugin_client_config(
    ca_cert: CertificateDer<'static>,
    client: &CertPair,
) -> Result<Arc<ClientConfig>> {
    let roots = root_store(vec![ca_cert])?;
    let config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_client_auth_cert(vec![client.cert_der.clone()], client.private_key())?;
    Ok(Arc::new(config))
}

/// Plugin-side config: requires a client certificate chained to `ca_pem`.
pub fn plugin_server_config(ca_pem: &str, cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    let provider = provider();
    let roots = root_store(parse_certs(ca_pem)?)?;
    let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| RunnerError::Tls(format!("client verifier: {}", e)))?;

    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_single_cert(parse_certs(cert_pem)?, parse_private_key(key_pem)?)?;
    Ok(Arc::new(config))
}

/// Server config without client authentication, used by the host's unwrap
/// endpoint.
pub fn server_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(parse_certs(cert_pem)?, parse_private_key(key_pem)?)?;
    Ok(Arc::new(config))
}

/// Generic client config. With `insecure` set the server certificate is not
/// verified at all.
pub fn client_config(
    roots: Option<RootCertStore>,
    identity: Option<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)>,
    insecure: bool,
) -> Result<Arc<ClientConfig>> {
    let provider = provider();
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()?;

    let builder = if insecure {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification::new(provider)))
    } else {
        let roots = roots.ok_or_else(|| {
            RunnerError::Tls("no trusted CA configured and verification is enabled".into())
        })?;
        builder.with_root_certificates(roots)
    };

    let config = match identity {
        Some((chain, key)) => builder.with_client_auth_cert(chain, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| RunnerError::Tls(format!("invalid server name {}: {}", name, e)))
}

// Certificate verification for operator-requested --tls-skip-verify
#[derive(Debug)]
struct SkipServerVerification {
    provider: Arc<CryptoProvider>,
}

impl SkipServerVerification {
    fn new(provider: Arc<CryptoProvider>) -> Self {
        Self { provider }
    }
}

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
