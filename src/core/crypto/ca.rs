// src/core/crypto/ca.rs
//! Ephemeral certificate authority used for exactly one plugin launch.
//!
//! Keys are ECDSA P-256 with SHA-256 signatures. Every CA gets a random
//! serial and a validity window that starts slightly in the past to absorb
//! clock skew between host and plugin.

use std::time::Duration;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use uuid::Uuid;

use super::secure_memory::SecretBytes;
use crate::utils::error::{Result, RunnerError};

const CLOCK_SKEW: Duration = Duration::from_secs(30);

/// Names every leaf is valid for. The host always dials the plugin over
/// loopback.
pub const LEAF_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertRole {
    Server,
    Client,
}

impl CertRole {
    fn common_name(&self) -> &'static str {
        match self {
            CertRole::Server => "plugin-runner-server",
            CertRole::Client => "plugin-runner-client",
        }
    }

    fn extended_key_usage(&self) -> ExtendedKeyUsagePurpose {
        match self {
            CertRole::Server => ExtendedKeyUsagePurpose::ServerAuth,
            CertRole::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

/// A signed leaf certificate and its private key.
#[derive(Debug)]
pub struct CertPair {
    pub role: CertRole,
    pub cert_pem: String,
    pub cert_der: CertificateDer<'static>,
    key_der: SecretBytes,
    key_pem: SecretBytes,
}

impl CertPair {
    pub fn key_pem(&self) -> &SecretBytes {
        &self.key_pem
    }

    /// Copies the PKCS#8 key into the form rustls expects.
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.expose().to_vec()))
    }
}

pub struct EphemeralCa {
    certificate: Certificate,
    key_pair: KeyPair,
    validity: Duration,
}

impl EphemeralCa {
    pub fn generate(validity: Duration) -> Result<Self> {
        let key_pair = KeyPair::generate()
            .map_err(|e| RunnerError::CertGeneration(format!("CA key generation failed: {}", e)))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "plugin-runner-ephemeral-ca");
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(random_serial());
        set_validity(&mut params, validity)?;

        let certificate = params
            .self_signed(&key_pair)
            .map_err(|e| RunnerError::CertGeneration(format!("CA self-signing failed: {}", e)))?;

        Ok(Self {
            certificate,
            key_pair,
            validity,
        })
    }

    pub fn cert_pem(&self) -> String {
        self.certificate.pem()
    }

    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.certificate.der().clone()
    }

    /// Issues a leaf for `role`, valid for the same window as the CA.
    pub fn sign_leaf(&self, role: CertRole) -> Result<CertPair> {
        let key_pair = KeyPair::generate()
            .map_err(|e| RunnerError::CertGeneration(format!("leaf key generation failed: {}", e)))?;

        let names: Vec<String> = LEAF_NAMES.iter().map(|n| n.to_string()).collect();
        let mut params = CertificateParams::new(names)?;
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, role.common_name());
        params.distinguished_name = dn;
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![role.extended_key_usage()];
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(random_serial());
        set_validity(&mut params, self.validity)?;

        let certificate = params
            .signed_by(&key_pair, &self.certificate, &self.key_pair)
            .map_err(|e| RunnerError::CertGeneration(format!("leaf signing failed: {}", e)))?;

        Ok(CertPair {
            role,
            cert_pem: certificate.pem(),
            cert_der: certificate.der().clone(),
            key_der: SecretBytes::new(key_pair.serialize_der()),
            key_pem: SecretBytes::from(key_pair.serialize_pem()),
        })
    }
}

impl std::fmt::Debug for EphemeralCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralCa")
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

fn random_serial() -> SerialNumber {
    SerialNumber::from(Uuid::new_v4().as_bytes().to_vec())
}

fn set_validity(params: &mut CertificateParams, validity: Duration) -> Result<()> {
    let skew = time::Duration::try_from(CLOCK_SKEW)
        .map_err(|e| RunnerError::CertGeneration(e.to_string()))?;
    let lifetime = time::Duration::try_from(validity)
        .map_err(|e| RunnerError::CertGeneration(format!("invalid validity window: {}", e)))?;

    let now = OffsetDateTime::now_utc();
    params.not_before = now - skew;
    params.not_after = now + lifetime;
    Ok(())
}
