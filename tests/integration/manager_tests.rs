// tests/integration/manager_tests.rs
use std::sync::Arc;

use plugin_runner::plugins::manager::Backend;
use plugin_runner::plugins::{HandshakeConfig, PluginCatalog, PluginClient, PluginManager};
use plugin_runner::utils::config::{CatalogConfig, CatalogEntry, Config};
use plugin_runner::utils::error::RunnerError;
use plugin_runner::utils::logging::TracingLogger;
use tokio::io::BufReader;

use crate::common::{echo_plugin_digest, echo_plugin_path, request, runner, TestHost};

async fn catalog_config() -> CatalogConfig {
    CatalogConfig {
        plugins: vec![CatalogEntry {
            name: "mock-plugin".into(),
            command: echo_plugin_path().to_string_lossy().into_owned(),
            args: vec![],
            sha256: hex::encode(echo_plugin_digest().await),
        }],
    }
}

async fn manager(host: &TestHost) -> PluginManager {
    let catalog = PluginCatalog::from_config(&catalog_config().await).expect("Failed to build catalog");

    PluginManager::new(
        Arc::new(runner()),
        Arc::new(catalog),
        Arc::new(host.util(false)),
        HandshakeConfig::default(),
    )
    .with_environment(host.plugin_env())
}

async fn client(manager: &PluginManager, path: &str) -> Arc<PluginClient> {
    match manager.backend(path).await.expect("Nothing mounted") {
        Backend::Subprocess(client) => client,
        Backend::Builtin(_) => panic!("expected a subprocess mount"),
    }
}

async fn echo(manager: &PluginManager, path: &str, text: &str) -> String {
    let conn = manager.connect(path).await.expect("Failed to connect to mount");
    let mut conn = BufReader::new(conn);
    request(&mut conn, &format!("echo {}", text)).await
}

#[tokio::test]
async fn test_reload_by_plugin_relaunches_every_mount() {
    let host = TestHost::start().await;
    let manager = manager(&host).await;
    manager.mount("mock-0/", "mock-plugin").await.expect("Failed to mount");
    manager.mount("mock-1/", "mock-plugin").await.expect("Failed to mount");

    assert_eq!(echo(&manager, "mock-0/", "a").await, "a");
    assert_eq!(echo(&manager, "mock-1/", "b").await, "b");
    let old = client(&manager, "mock-0/").await;
    let old_pid = old.pid().await;
    assert!(old_pid.is_some());

    assert_eq!(manager.reload_plugin("mock-plugin").await.expect("Reload failed"), 2);

    // The old process is gone and the new client has not started yet.
    assert!(!old.is_running().await);
    let new = client(&manager, "mock-0/").await;
    assert_ne!(old.id(), new.id());
    assert!(new.pid().await.is_none());

    assert_eq!(echo(&manager, "mock-0/", "again").await, "again");
    assert_ne!(new.pid().await, old_pid);

    manager.shutdown().await;
    assert!(!new.is_running().await);
}

#[tokio::test]
async fn test_reload_by_mounts_and_auto_reload() {
    let host = TestHost::start().await;
    let manager = manager(&host).await;
    manager.mount("mock-0/", "mock-plugin").await.expect("Failed to mount");
    manager.mount("mock-1/", "mock-plugin").await.expect("Failed to mount");

    let untouched = client(&manager, "mock-1/").await;
    manager.reload_mounts(&["mock-0/"]).await.expect("Reload failed");
    assert_eq!(client(&manager, "mock-1/").await.id(), untouched.id());

    assert_eq!(echo(&manager, "mock-0/", "x").await, "x");
    let before = client(&manager, "mock-0/").await;
    manager
        .report_rpc_failure("mock-0/", &RunnerError::Process("broken pipe".into()))
        .await
        .expect("Auto-reload failed");
    assert!(!before.is_running().await);
    assert_eq!(echo(&manager, "mock-0/", "y").await, "y");

    manager.shutdown().await;
    assert!(manager.mounts().await.is_empty());
}

#[tokio::test]
async fn test_manager_from_config_launches_catalog_plugins() {
    let host = TestHost::start().await;
    let mut config = Config::default();
    config.runner.handshake_timeout_secs = 20;
    config.catalog = catalog_config().await;

    let catalog = PluginCatalog::from_config(&config.catalog).expect("Failed to build catalog");
    let manager = PluginManager::from_config(
        &config,
        Arc::new(catalog),
        host.wrapper.clone(),
        Arc::new(TracingLogger::default()),
    )
    .with_environment(host.plugin_env());

    manager.mount("cfg/", "mock-plugin").await.expect("Failed to mount");
    let launched = client(&manager, "cfg/").await;
    assert_eq!(launched.launch_env().count("PLUGIN_MLOCK_ENABLED"), 0);
    assert_eq!(echo(&manager, "cfg/", "configured").await, "configured");

    manager.shutdown().await;
}
