// tests/integration/launch_tests.rs
use std::time::Duration;

use plugin_runner::plugins::{HandshakeConfig, LaunchEnvironment};
use plugin_runner::utils::error::RunnerError;
use plugin_runner::plugins::wrapping::SystemView;
use std::sync::Arc;
use tokio::io::BufReader;

use crate::common::{echo_descriptor, echo_plugin_digest, request, runner, FailingWrapper, TestHost};

#[tokio::test]
async fn test_secure_launch_end_to_end() {
    let host = TestHost::start().await;
    let runner = runner();
    let digest = echo_plugin_digest().await;

    let client = runner
        .run(
            &echo_descriptor(digest),
            &host.util(false),
            &host.plugin_env(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect("Failed to prepare launch");

    // Lazy: nothing runs until the first connect.
    assert!(client.pid().await.is_none());
    assert_eq!(host.wrapper.live_tokens(), 1);

    let conn = client.connect().await.expect("Failed to connect to plugin");
    assert!(conn.is_secure());
    assert!(client.is_running().await);

    // The plugin spent its token on startup.
    assert_eq!(host.wrapper.live_tokens(), 0);

    let mut conn = BufReader::new(conn);
    assert_eq!(request(&mut conn, "echo hello").await, "hello");
    assert!(request(&mut conn, "meta").await.ends_with("secure=true"));

    client.kill().await.expect("Failed to kill plugin");
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn test_launch_environment_carries_one_token_and_mlock() {
    let host = TestHost::start().await;
    let runner = runner();
    let digest = echo_plugin_digest().await;

    let client = runner
        .run(
            &echo_descriptor(digest),
            &host.util(true),
            &host.plugin_env(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect("Failed to prepare launch");

    let contract = runner.contract();
    let env = client.launch_env();
    assert_eq!(env.count(&contract.unwrap_token_env), 1);
    assert_eq!(env.get(&contract.mlock_enabled_env), Some("true"));
    assert_eq!(env.count(&contract.metadata_mode_env), 0);

    // mlock may fail without privileges; the plugin only warns about it.
    let conn = client.connect().await.expect("Failed to connect to plugin");
    let mut conn = BufReader::new(conn);
    assert_eq!(request(&mut conn, "echo locked").await, "locked");
    client.kill().await.expect("Failed to kill plugin");
}

#[tokio::test]
async fn test_metadata_launch_serves_plain_and_refuses_secrets() {
    let host = TestHost::start().await;
    let runner = runner();
    let digest = echo_plugin_digest().await;

    let client = runner
        .run(
            &echo_descriptor(digest),
            &host.util(false),
            &LaunchEnvironment::new(),
            &HandshakeConfig::default(),
            true,
        )
        .await
        .expect("Failed to prepare metadata launch");

    assert!(client.is_metadata_mode());
    assert_eq!(host.wrapper.live_tokens(), 0);

    let conn = client.connect().await.expect("Failed to connect to plugin");
    assert!(!conn.is_secure());

    let mut conn = BufReader::new(conn);
    assert!(request(&mut conn, "meta").await.ends_with("secure=false"));
    assert!(request(&mut conn, "echo secret").await.starts_with("error:"));

    client.kill().await.expect("Failed to kill plugin");
}

#[tokio::test]
async fn test_tampered_binary_is_never_executed() {
    let host = TestHost::start().await;
    let mut digest = echo_plugin_digest().await;
    digest[0] ^= 0xff;

    let client = runner()
        .run(
            &echo_descriptor(digest),
            &host.util(false),
            &host.plugin_env(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect("Failed to prepare launch");

    let err = client.connect().await.expect_err("Tampered binary must not start");
    assert!(matches!(err, RunnerError::ChecksumMismatch { .. }));
    assert!(err.is_security_event());
    assert!(client.pid().await.is_none());
    // The token was never handed to a process.
    assert_eq!(host.wrapper.live_tokens(), 1);
}

#[tokio::test]
async fn test_wrap_failure_launches_nothing() {
    let digest = echo_plugin_digest().await;
    let util = SystemView::new(Arc::new(FailingWrapper), false);

    let err = runner()
        .run(
            &echo_descriptor(digest),
            &util,
            &LaunchEnvironment::new(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect_err("Launch must fail without a wrapping service");
    assert!(matches!(err, RunnerError::WrapService(_)));
}

#[tokio::test]
async fn test_plugin_without_unwrap_endpoint_fails_to_start() {
    let host = TestHost::start().await;
    let digest = echo_plugin_digest().await;

    // No API address: the plugin cannot unwrap and exits before the handshake.
    let client = runner()
        .with_handshake_timeout(Duration::from_secs(10))
        .run(
            &echo_descriptor(digest),
            &host.util(false),
            &LaunchEnvironment::new(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect("Failed to prepare launch");

    let err = client.connect().await.expect_err("Plugin must not come up");
    assert!(matches!(err, RunnerError::Handshake(_)));
    assert!(!client.is_running().await);
}

#[tokio::test]
async fn test_stolen_token_is_useless_after_startup() {
    use plugin_runner::plugins::traits::Unwrapper;

    let host = TestHost::start().await;
    let runner = runner();
    let digest = echo_plugin_digest().await;

    let client = runner
        .run(
            &echo_descriptor(digest),
            &host.util(false),
            &host.plugin_env(),
            &HandshakeConfig::default(),
            false,
        )
        .await
        .expect("Failed to prepare launch");
    let token = client
        .launch_env()
        .get(&runner.contract().unwrap_token_env)
        .expect("No token in launch environment")
        .to_string();

    let _conn = client.connect().await.expect("Failed to connect to plugin");
    let replay = host.wrapper.unwrap(&token).await;
    assert!(matches!(replay, Err(RunnerError::Unwrap(_))));

    client.kill().await.expect("Failed to kill plugin");
}
