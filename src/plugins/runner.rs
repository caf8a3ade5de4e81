// src/plugins/runner.rs
//! Host side of the plugin launch protocol.
//!
//! Every call to [`PluginRunner::run`] generates a fresh CA, a client leaf for
//! the host and a server leaf for the plugin. The server leaf travels to the
//! plugin only inside a single-use wrapping token. The returned
//! [`PluginClient`] is inert: the binary is checksummed, spawned and dialed on
//! the first [`PluginClient::connect`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rustls::ClientConfig;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::crypto::ca::{CertRole, EphemeralCa};
use crate::core::crypto::checksum::{resolve_command, verify_binary, Sha256Digest};
use crate::core::crypto::tls::{plugin_client_config, server_name, PLUGIN_SERVER_NAME};
use crate::plugins::connection::PluginConnection;
use crate::plugins::handshake::{ChannelSecurity, HandshakeLine};
use crate::plugins::traits::RunnerUtil;
use crate::plugins::types::{
    BootstrapContract, HandshakeConfig, LaunchEnvironment, PluginDescriptor, PluginSource,
};
use crate::plugins::wrapping::wrap_server_config;
use crate::utils::config::Config;
use crate::utils::error::{Result, RunnerError};
use crate::utils::logging::PluginLogger;

pub struct PluginRunner {
    contract: BootstrapContract,
    cert_validity: Duration,
    wrap_ttl: Duration,
    handshake_timeout: Duration,
    logger: Arc<dyn PluginLogger>,
}

impl PluginRunner {
    pub fn new(contract: BootstrapContract, logger: Arc<dyn PluginLogger>) -> Self {
        let defaults = Config::default();
        Self::from_config(&defaults, contract, logger)
    }

    pub fn from_config(
        config: &Config,
        contract: BootstrapContract,
        logger: Arc<dyn PluginLogger>,
    ) -> Self {
        Self {
            contract,
            cert_validity: config.cert_validity(),
            wrap_ttl: config.wrap_ttl(),
            handshake_timeout: config.handshake_timeout(),
            logger,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn contract(&self) -> &BootstrapContract {
        &self.contract
    }

    /// Prepares a plugin launch. Nothing is spawned until the returned client
    /// is first used.
    pub async fn run(
        &self,
        descriptor: &PluginDescriptor,
        util: &dyn RunnerUtil,
        env: &LaunchEnvironment,
        handshake: &HandshakeConfig,
        metadata_mode: bool,
    ) -> Result<PluginClient> {
        descriptor.validate()?;
        let (command, args, sha256) = match &descriptor.source {
            PluginSource::Subprocess { command, args, sha256 } => {
                (command.clone(), args.clone(), *sha256)
            }
            PluginSource::InProcess(_) => {
                return Err(RunnerError::DescriptorInvalid(format!(
                    "plugin {} is built in and is not launched as a subprocess",
                    descriptor.name
                )))
            }
        };

        let launch_id = Uuid::new_v4();

        // Metadata-mode launches carry no secret material at all.
        let (tls, token) = if metadata_mode {
            (None, None)
        } else {
            let ca = EphemeralCa::generate(self.cert_validity)?;
            let client = ca.sign_leaf(CertRole::Client)?;
            let tls = plugin_client_config(ca.cert_der(), &client)?;
            let wrapped = wrap_server_config(util, &ca, self.wrap_ttl).await?;
            (Some(tls), Some(wrapped.token))
        };

        let launch_env = self.launch_environment(env, handshake, token, metadata_mode, util.mlock_enabled());

        let logger = if metadata_mode {
            self.logger.named("plugin.metadata")
        } else {
            self.logger.named("plugin")
        };

        info!(
            plugin = %descriptor.name,
            launch_id = %launch_id,
            metadata_mode,
            "Prepared plugin launch"
        );

        Ok(PluginClient {
            id: launch_id,
            name: descriptor.name.clone(),
            command,
            args,
            sha256,
            env: launch_env,
            tls,
            handshake: handshake.clone(),
            handshake_timeout: self.handshake_timeout,
            logger,
            state: Mutex::new(ProcessState::NotStarted),
        })
    }

    fn launch_environment(
        &self,
        env: &LaunchEnvironment,
        handshake: &HandshakeConfig,
        token: Option<String>,
        metadata_mode: bool,
        mlock: bool,
    ) -> LaunchEnvironment {
        let reserved = [
            self.contract.unwrap_token_env.as_str(),
            self.contract.metadata_mode_env.as_str(),
            self.contract.mlock_enabled_env.as_str(),
            handshake.magic_cookie_key.as_str(),
        ];

        let mut launch_env = LaunchEnvironment::new();
        for (key, value) in env.iter() {
            if reserved.contains(&key) {
                warn!(variable = key, "Dropping caller-supplied bootstrap variable");
                continue;
            }
            launch_env.push(key, value);
        }

        launch_env.push(&handshake.magic_cookie_key, &handshake.magic_cookie_value);
        match token {
            Some(token) => launch_env.push(&self.contract.unwrap_token_env, token),
            None if metadata_mode => launch_env.push(&self.contract.metadata_mode_env, "true"),
            None => {}
        }
        if mlock {
            launch_env.push(&self.contract.mlock_enabled_env, "true");
        }

        launch_env
    }
}

enum ProcessState {
    NotStarted,
    Running(RunningPlugin),
    /// A client is never restarted: its token has been spent.
    Stopped,
}

struct RunningPlugin {
    child: Child,
    addr: SocketAddr,
    pumps: Vec<JoinHandle<()>>,
}

/// Handle to one launched (or launchable) plugin process.
pub struct PluginClient {
    id: Uuid,
    name: String,
    command: String,
    args: Vec<String>,
    sha256: Sha256Digest,
    env: LaunchEnvironment,
    tls: Option<Arc<ClientConfig>>,
    handshake: HandshakeConfig,
    handshake_timeout: Duration,
    logger: Arc<dyn PluginLogger>,
    state: Mutex<ProcessState>,
}

impl PluginClient {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn launch_env(&self) -> &LaunchEnvironment {
        &self.env
    }

    pub fn tls_config(&self) -> Option<&Arc<ClientConfig>> {
        self.tls.as_ref()
    }

    pub fn is_metadata_mode(&self) -> bool {
        self.tls.is_none()
    }

    pub fn logger_name(&self) -> &str {
        self.logger.name()
    }

    pub async fn is_running(&self) -> bool {
        let mut state = self.state.lock().await;
        match &mut *state {
            ProcessState::Running(running) => matches!(running.child.try_wait(), Ok(None)),
            _ => false,
        }
    }

    /// Process id of the child, once spawned.
    pub async fn pid(&self) -> Option<u32> {
        match &*self.state.lock().await {
            ProcessState::Running(running) => running.child.id(),
            _ => None,
        }
    }

    /// Spawns the plugin if needed and returns the address it listens on.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut state = self.state.lock().await;
        match &mut *state {
            ProcessState::Running(running) => {
                if let Ok(None) = running.child.try_wait() {
                    return Ok(running.addr);
                }
                *state = ProcessState::Stopped;
                Err(RunnerError::Process(format!(
                    "plugin {} exited; relaunch it through the runner",
                    self.name
                )))
            }
            ProcessState::Stopped => Err(RunnerError::Process(format!(
                "plugin {} was stopped; relaunch it through the runner",
                self.name
            ))),
            ProcessState::NotStarted => {
                // A failed start spends the client just like a clean exit.
                *state = ProcessState::Stopped;
                let running = self.spawn().await?;
                let addr = running.addr;
                *state = ProcessState::Running(running);
                Ok(addr)
            }
        }
    }

    /// Starts the plugin on first use and opens a channel to it. A failed dial
    /// or TLS handshake tears the process down.
    pub async fn connect(&self) -> Result<PluginConnection> {
        let addr = self.start().await?;
        match self.dial(addr).await {
            Ok(conn) => Ok(conn),
            Err(e) => {
                error!(plugin = %self.name, error = %e, "Failed to connect to plugin");
                self.kill().await?;
                Err(e)
            }
        }
    }

    async fn dial(&self, addr: SocketAddr) -> Result<PluginConnection> {
        let tcp = tokio::time::timeout(self.handshake_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                RunnerError::Handshake(format!("dialing plugin {} at {} timed out", self.name, addr))
            })??;

        let Some(tls) = &self.tls else {
            return Ok(PluginConnection::new(Box::new(tcp), false));
        };

        let connect = TlsConnector::from(tls.clone()).connect(server_name(PLUGIN_SERVER_NAME)?, tcp);
        let stream = tokio::time::timeout(self.handshake_timeout, connect)
            .await
            .map_err(|_| RunnerError::Tls(format!("handshake with plugin {} timed out", self.name)))?
            .map_err(|e| RunnerError::Tls(format!("handshake with plugin {} failed: {}", self.name, e)))?;
        Ok(PluginConnection::new(Box::new(stream), true))
    }

    /// Kills the plugin process. Safe to call on a client that never started.
    pub async fn kill(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let ProcessState::Running(mut running) =
            std::mem::replace(&mut *state, ProcessState::Stopped)
        {
            if let Ok(None) = running.child.try_wait() {
                running.child.kill().await?;
            }
            for pump in running.pumps {
                pump.abort();
            }
            debug!(plugin = %self.name, launch_id = %self.id, "Plugin process killed");
        }
        Ok(())
    }

    async fn spawn(&self) -> Result<RunningPlugin> {
        let binary = resolve_command(&self.command, self.env.get("PATH"))?;
        if let Err(e) = verify_binary(&binary, &self.sha256).await {
            if e.is_security_event() {
                error!(
                    plugin = %self.name,
                    binary = %binary.display(),
                    security_event = true,
                    "Plugin binary failed checksum verification; refusing to execute"
                );
            }
            return Err(e);
        }

        let mut child = self.command(binary).spawn().map_err(|e| {
            RunnerError::Process(format!("failed to spawn plugin {}: {}", self.name, e))
        })?;

        match self.await_handshake(&mut child).await {
            Ok((addr, pumps)) => {
                self.logger.info(&format!("plugin {} listening on {}", self.name, addr));
                Ok(RunningPlugin { child, addr, pumps })
            }
            Err(e) => {
                warn!(plugin = %self.name, error = %e, "Plugin failed to start; killing process");
                if let Err(kill_err) = child.kill().await {
                    warn!(plugin = %self.name, error = %kill_err, "Failed to kill plugin process");
                }
                Err(e)
            }
        }
    }

    fn command(&self, binary: PathBuf) -> Command {
        let mut cmd = Command::new(binary);
        cmd.args(&self.args)
            .env_clear()
            .envs(self.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    async fn await_handshake(&self, child: &mut Child) -> Result<(SocketAddr, Vec<JoinHandle<()>>)> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::Process("plugin stdout unavailable".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RunnerError::Process("plugin stderr unavailable".into()))?;

        let mut pumps = vec![forward_stderr(stderr, self.logger.clone())];

        let mut lines = BufReader::new(stdout).lines();
        let first = match tokio::time::timeout(self.handshake_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                let status = child.wait().await?;
                return Err(RunnerError::Handshake(format!(
                    "plugin exited before handshake: {}",
                    status
                )));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(RunnerError::Handshake(format!(
                    "no handshake within {:?}",
                    self.handshake_timeout
                )))
            }
        };

        let line = HandshakeLine::parse(&first)?;
        let expected = if self.tls.is_some() {
            ChannelSecurity::Tls
        } else {
            ChannelSecurity::Plain
        };
        line.validate(&self.handshake, expected)?;

        // Keep draining stdout so the plugin never blocks on a full pipe.
        let logger = self.logger.clone();
        pumps.push(tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                logger.debug(&line);
            }
        }));

        Ok((line.addr, pumps))
    }
}

fn forward_stderr(stderr: tokio::process::ChildStderr, logger: Arc<dyn PluginLogger>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.contains("ERROR") {
                logger.error(&line);
            } else if line.contains("WARN") {
                logger.warn(&line);
            } else {
                logger.debug(&line);
            }
        }
    })
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("command", &self.command)
            .field("metadata_mode", &self.is_metadata_mode())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::crypto::checksum::sha256_file;
    use crate::plugins::traits::{MockRunnerUtil, Unwrapper};
    use crate::plugins::wrapping::{BootstrapPayload, InMemoryWrapper, SystemView};
    use crate::utils::logging::TracingLogger;

    fn runner() -> PluginRunner {
        PluginRunner::new(BootstrapContract::default(), Arc::new(TracingLogger::default()))
    }

    fn descriptor(sha256: Sha256Digest) -> PluginDescriptor {
        PluginDescriptor::subprocess("echo", "echo", vec!["hello".into()], sha256).unwrap()
    }

    #[tokio::test]
    async fn test_run_injects_single_token() {
        let runner = runner();
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), true);
        let handshake = HandshakeConfig::default();

        let client = runner
            .run(&descriptor([0u8; 32]), &util, &LaunchEnvironment::new(), &handshake, false)
            .await
            .unwrap();

        let env = client.launch_env();
        let contract = runner.contract();
        assert_eq!(env.count(&contract.unwrap_token_env), 1);
        assert_eq!(env.count(&contract.mlock_enabled_env), 1);
        assert_eq!(env.count(&contract.metadata_mode_env), 0);
        assert_eq!(env.get(&handshake.magic_cookie_key), Some(handshake.magic_cookie_value.as_str()));
        assert!(client.tls_config().is_some());
        assert_eq!(client.logger_name(), "plugin");
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn test_metadata_mode_has_no_secret_material() {
        let runner = runner();
        let mut util = MockRunnerUtil::new();
        util.expect_response_wrap_data().never();
        util.expect_mlock_enabled().return_const(false);

        let client = runner
            .run(
                &descriptor([0u8; 32]),
                &util,
                &LaunchEnvironment::new(),
                &HandshakeConfig::default(),
                true,
            )
            .await
            .unwrap();

        let contract = runner.contract();
        assert_eq!(client.launch_env().count(&contract.unwrap_token_env), 0);
        assert_eq!(client.launch_env().get(&contract.metadata_mode_env), Some("true"));
        assert!(client.tls_config().is_none());
        assert_eq!(client.logger_name(), "plugin.metadata");
    }

    #[tokio::test]
    async fn test_wrap_failure_aborts_launch() {
        let mut util = MockRunnerUtil::new();
        util.expect_response_wrap_data()
            .returning(|_, _| Err(RunnerError::WrapService("sealed".into())));
        util.expect_mlock_enabled().return_const(false);

        let err = runner()
            .run(
                &descriptor([0u8; 32]),
                &util,
                &LaunchEnvironment::new(),
                &HandshakeConfig::default(),
                false,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::WrapService(_)));
    }

    #[tokio::test]
    async fn test_builtin_descriptor_is_rejected() {
        let descriptor = PluginDescriptor::builtin(
            "builtin",
            Arc::new(|| -> anyhow::Result<Box<dyn crate::plugins::traits::Plugin>> {
                Err(anyhow::anyhow!("unused"))
            }),
        );
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), false);
        let err = runner()
            .run(&descriptor, &util, &LaunchEnvironment::new(), &HandshakeConfig::default(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::DescriptorInvalid(_)));
    }

    #[tokio::test]
    async fn test_caller_cannot_smuggle_bootstrap_variables() {
        let runner = runner();
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), false);
        let env = LaunchEnvironment::from_pairs(["PLUGIN_UNWRAP_TOKEN=forged", "KEEP=1"]).unwrap();

        let client = runner
            .run(&descriptor([0u8; 32]), &util, &env, &HandshakeConfig::default(), false)
            .await
            .unwrap();

        assert_eq!(client.launch_env().count("PLUGIN_UNWRAP_TOKEN"), 1);
        assert_ne!(client.launch_env().get("PLUGIN_UNWRAP_TOKEN"), Some("forged"));
        assert_eq!(client.launch_env().get("KEEP"), Some("1"));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_never_spawns() {
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), false);
        let client = runner()
            .run(
                &descriptor([0xde; 32]),
                &util,
                &LaunchEnvironment::new(),
                &HandshakeConfig::default(),
                false,
            )
            .await
            .unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RunnerError::ChecksumMismatch { .. }));
        assert!(client.pid().await.is_none());
        // The client is spent after a failed start.
        assert!(matches!(client.start().await, Err(RunnerError::Process(_))));
    }

    #[tokio::test]
    async fn test_plugin_without_handshake_is_killed() {
        let echo = resolve_command("echo", None).unwrap();
        let digest = sha256_file(&echo).await.unwrap();
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), false);

        let client = runner()
            .with_handshake_timeout(Duration::from_secs(2))
            .run(
                &descriptor(digest),
                &util,
                &LaunchEnvironment::new(),
                &HandshakeConfig::default(),
                false,
            )
            .await
            .unwrap();

        // echo prints "hello", which is not a handshake line.
        let err = client.start().await.unwrap_err();
        assert!(matches!(err, RunnerError::Handshake(_)));
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn test_each_run_uses_fresh_material() {
        let runner = runner();
        let wrapper = Arc::new(InMemoryWrapper::new());
        let util = SystemView::new(wrapper.clone(), false);
        let handshake = HandshakeConfig::default();

        let first = runner
            .run(&descriptor([0u8; 32]), &util, &LaunchEnvironment::new(), &handshake, false)
            .await
            .unwrap();
        let second = runner
            .run(&descriptor([0u8; 32]), &util, &LaunchEnvironment::new(), &handshake, false)
            .await
            .unwrap();

        let token = |c: &PluginClient| c.launch_env().get("PLUGIN_UNWRAP_TOKEN").map(str::to_owned);
        assert_ne!(token(&first), token(&second));
        assert_ne!(first.id(), second.id());
        assert_eq!(wrapper.live_tokens(), 2);

        let ca = |c: &PluginClient| {
            let token = token(c).unwrap();
            let wrapper = wrapper.clone();
            async move {
                let value = wrapper.unwrap(&token).await.unwrap();
                BootstrapPayload::from_value(value).unwrap().ca_cert.clone()
            }
        };
        let first_ca = ca(&first).await;
        let second_ca = ca(&second).await;
        assert!(first_ca.contains("BEGIN CERTIFICATE"));
        assert_ne!(first_ca, second_ca);
    }

    /// Launches `sh -c` printing a TLS handshake line for `addr`, then idling.
    async fn idle_plugin(addr: SocketAddr) -> PluginClient {
        let sh = resolve_command("sh", None).unwrap();
        let digest = sha256_file(&sh).await.unwrap();
        let line = HandshakeLine::new(
            HandshakeConfig::default().protocol_version,
            addr,
            ChannelSecurity::Tls,
        );
        let script = format!("echo '{}'; exec sleep 30", line);
        let descriptor =
            PluginDescriptor::subprocess("idle", sh.to_string_lossy(), vec!["-c".into(), script], digest)
                .unwrap();

        let mut env = LaunchEnvironment::new();
        if let Ok(path) = std::env::var("PATH") {
            env.push("PATH", path);
        }
        let util = SystemView::new(Arc::new(InMemoryWrapper::new()), false);

        runner()
            .with_handshake_timeout(Duration::from_secs(1))
            .run(&descriptor, &util, &env, &HandshakeConfig::default(), false)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_silent_listener_times_out_and_kills_plugin() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((tcp, _)) = listener.accept().await {
                held.push(tcp);
            }
        });

        let client = idle_plugin(addr).await;
        let err = tokio::time::timeout(Duration::from_secs(10), client.connect())
            .await
            .expect("connect must not hang")
            .unwrap_err();
        assert!(matches!(err, RunnerError::Tls(_)));
        assert!(!client.is_running().await);
        assert!(client.pid().await.is_none());

        hold.abort();
    }

    #[tokio::test]
    async fn test_refused_dial_kills_plugin() {
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let client = idle_plugin(addr).await;
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, RunnerError::Io(_)));
        assert!(!client.is_running().await);
        assert!(matches!(client.start().await, Err(RunnerError::Process(_))));
    }
}
