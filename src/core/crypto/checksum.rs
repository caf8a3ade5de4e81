// src/core/crypto/checksum.rs
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::utils::error::{Result, RunnerError};

pub const DIGEST_LEN: usize = 32;

pub type Sha256Digest = [u8; DIGEST_LEN];

/// Parses a registration-time hex digest.
pub fn parse_hex_digest(value: &str) -> Result<Sha256Digest> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| RunnerError::DescriptorInvalid(format!("sha256 is not valid hex: {}", e)))?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        RunnerError::DescriptorInvalid(format!(
            "sha256 must be {} bytes, got {}",
            DIGEST_LEN,
            bytes.len()
        ))
    })
}

pub async fn sha256_file(path: &Path) -> Result<Sha256Digest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Hashes the binary at `path` and compares it against the expected digest.
/// Runs before the binary is spawned.
pub async fn verify_binary(path: &Path, expected: &Sha256Digest) -> Result<()> {
    let actual = sha256_file(path).await?;
    if &actual != expected {
        return Err(RunnerError::ChecksumMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }

    debug!(binary = %path.display(), "Plugin checksum verified");
    Ok(())
}

/// Resolves a command to the file that will be executed. Commands containing a
/// path separator are used as given, bare names are searched in `search_path`.
pub fn resolve_command(command: &str, search_path: Option<&str>) -> Result<PathBuf> {
    if command.is_empty() {
        return Err(RunnerError::DescriptorInvalid("empty command".into()));
    }

    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return if candidate.is_file() {
            Ok(candidate.to_path_buf())
        } else {
            Err(RunnerError::Process(format!("plugin binary not found: {}", command)))
        };
    }

    let search_path = search_path
        .map(str::to_owned)
        .or_else(|| std::env::var("PATH").ok())
        .unwrap_or_default();

    std::env::split_paths(&search_path)
        .map(|dir| dir.join(command))
        .find(|path| path.is_file())
        .ok_or_else(|| RunnerError::Process(format!("plugin command not found in PATH: {}", command)))
}
