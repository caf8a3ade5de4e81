// src/utils/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Certificate generation error: {0}")]
    CertGeneration(String),

    #[error("Wrapping service error: {0}")]
    WrapService(String),

    #[error("Checksum mismatch for plugin binary: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Unwrap error: {0}")]
    Unwrap(String),

    #[error("Invalid plugin descriptor: {0}")]
    DescriptorInvalid(String),

    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Plugin process error: {0}")]
    Process(String),

    #[error("Operation requires the secure channel; plugin is serving metadata only")]
    MetadataOnly,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    /// Errors that must be surfaced to operators as possible tampering rather
    /// than ordinary startup failures.
    pub fn is_security_event(&self) -> bool {
        matches!(self, RunnerError::ChecksumMismatch { .. })
    }
}

impl From<rustls::Error> for RunnerError {
    fn from(error: rustls::Error) -> Self {
        RunnerError::Tls(error.to_string())
    }
}

impl From<rcgen::Error> for RunnerError {
    fn from(error: rcgen::Error) -> Self {
        RunnerError::CertGeneration(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
