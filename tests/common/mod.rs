// tests/common/mod.rs
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use plugin_runner::core::crypto::ca::{CertRole, EphemeralCa};
use plugin_runner::core::crypto::checksum::{sha256_file, Sha256Digest};
use plugin_runner::core::crypto::tls::server_config;
use plugin_runner::plugins::traits::Wrapper;
use plugin_runner::plugins::wrapping::{InMemoryWrapper, SystemView, UnwrapEndpoint, WrapInfo};
use plugin_runner::plugins::{BootstrapContract, LaunchEnvironment, PluginDescriptor, PluginRunner};
use plugin_runner::utils::error::{Result, RunnerError};
use plugin_runner::utils::logging::TracingLogger;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;

pub fn echo_plugin_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_echo-plugin"))
}

pub async fn echo_plugin_digest() -> Sha256Digest {
    sha256_file(&echo_plugin_path())
        .await
        .expect("Failed to hash echo-plugin")
}

pub fn echo_descriptor(sha256: Sha256Digest) -> PluginDescriptor {
    PluginDescriptor::subprocess(
        "echo-plugin",
        echo_plugin_path().to_string_lossy(),
        vec![],
        sha256,
    )
    .expect("Failed to build descriptor")
}

pub fn runner() -> PluginRunner {
    PluginRunner::new(BootstrapContract::default(), Arc::new(TracingLogger::default()))
        .with_handshake_timeout(Duration::from_secs(20))
}

/// Sends one command line and returns the reply line.
pub async fn request<S>(conn: &mut BufReader<S>, line: &str) -> String
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let writer = conn.get_mut();
    writer.write_all(line.as_bytes()).await.expect("Failed to send request");
    writer.write_all(b"\n").await.expect("Failed to send request");
    writer.flush().await.expect("Failed to flush request");

    let mut reply = String::new();
    conn.read_line(&mut reply).await.expect("Failed to read reply");
    reply.trim_end().to_string()
}

/// The host half of a launch: the wrapping service plus the TLS endpoint
/// plugins unwrap their token against.
pub struct TestHost {
    pub wrapper: Arc<InMemoryWrapper>,
    pub api_ca_pem: String,
    pub api_addr: String,
    handle: JoinHandle<()>,
}

impl TestHost {
    pub async fn start() -> Self {
        let wrapper = Arc::new(InMemoryWrapper::new());
        let ca = EphemeralCa::generate(Duration::from_secs(3600)).expect("Failed to generate API CA");
        let leaf = ca.sign_leaf(CertRole::Server).expect("Failed to sign API certificate");
        let tls = server_config(
            &leaf.cert_pem,
            leaf.key_pem().expose_str().expect("API key is not UTF-8"),
        )
        .expect("Failed to build API TLS config");

        let endpoint = UnwrapEndpoint::bind("127.0.0.1:0", tls, wrapper.clone())
            .await
            .expect("Failed to bind unwrap endpoint");
        let api_addr = endpoint.local_addr().expect("No endpoint address").to_string();

        Self {
            wrapper,
            api_ca_pem: ca.cert_pem(),
            api_addr,
            handle: endpoint.spawn(),
        }
    }

    pub fn util(&self, mlock: bool) -> SystemView {
        SystemView::new(self.wrapper.clone(), mlock)
    }

    /// What a plugin needs to reach the unwrap endpoint.
    pub fn plugin_env(&self) -> LaunchEnvironment {
        let contract = BootstrapContract::default();
        let mut env = LaunchEnvironment::new();
        env.push(contract.api_addr_env, &self.api_addr);
        env.push(contract.ca_cert_pem_env, &self.api_ca_pem);
        env
    }
}

impl Drop for TestHost {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A wrapping service that is always unavailable.
pub struct FailingWrapper;

#[async_trait]
impl Wrapper for FailingWrapper {
    async fn wrap(&self, _payload: serde_json::Value, _ttl: Duration) -> Result<WrapInfo> {
        Err(RunnerError::WrapService("wrapping service is sealed".into()))
    }
}
