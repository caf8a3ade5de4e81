//! Cryptographic building blocks for the plugin bootstrap

pub mod ca;
pub mod checksum;
pub mod secure_memory;
pub mod tls;

// Re-export commonly used types
pub use ca::{CertPair, CertRole, EphemeralCa};
pub use checksum::{parse_hex_digest, sha256_file, verify_binary, Sha256Digest};
pub use secure_memory::SecretBytes;
