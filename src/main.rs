// src/main.rs
//! `echo-plugin`: a minimal plugin binary speaking the launch protocol.
//!
//! Each connection carries newline-terminated commands. `meta` is allowed in
//! every mode; `echo <text>` needs the mutually authenticated channel.

use std::io::Write;

use anyhow::Context;
use dotenv::dotenv;
use plugin_runner::plugins::wrapping::RemoteUnwrapper;
use plugin_runner::plugins::{
    Bootstrap, BootstrapConsumer, BootstrapContract, ClientTlsOverride, HandshakeConfig,
    OperationKind, PluginConnection, PluginServer, ServeMode,
};
use plugin_runner::utils::{config::Config, logging};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{debug, error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    // The launcher clears the environment, so a missing config is normal.
    let config = Config::new().unwrap_or_default();
    let _guard = logging::init(&config.logging)?;

    let flags = ClientTlsOverride::parse_args(std::env::args().skip(1))?;
    let consumer = BootstrapConsumer::new(BootstrapContract::default(), HandshakeConfig::default());
    let env = |key: &str| std::env::var(key).ok();

    consumer.apply_mlock_policy(env);

    let bootstrap = match consumer.resolve_from_env() {
        Bootstrap::NotManaged => {
            eprintln!(
                "This binary is a plugin. It is meant to be launched by a plugin runner, not run directly."
            );
            std::process::exit(1);
        }
        Bootstrap::Wrapped(_) if flags.fetch_metadata() => Bootstrap::Metadata,
        other => other,
    };

    let mode = match bootstrap {
        Bootstrap::Wrapped(token) => {
            let addr = consumer
                .api_addr(env)
                .context("no host API address to unwrap the bootstrap token against")?;
            let tls = consumer.host_api_tls(flags.tls_config().as_ref(), env)?;
            let unwrapper = RemoteUnwrapper::new(addr, tls);
            consumer
                .bootstrap(Bootstrap::Wrapped(token), &unwrapper)
                .await
                .map_err(|e| {
                    error!(error = %e, "Failed to unwrap bootstrap material");
                    e
                })?
        }
        _ => {
            info!("Serving in metadata mode");
            ServeMode::MetadataOnly
        }
    };

    let server = PluginServer::bind(&mode, consumer.handshake())
        .await?
        .with_handshake_timeout(config.handshake_timeout());
    let line = server.handshake_line()?;
    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        stdout.flush()?;
    }
    info!(addr = %line.addr, secure = mode.is_secure(), "Plugin listening");

    loop {
        tokio::select! {
            accepted = server.accept() => match accepted {
                Ok(incoming) => {
                    tokio::spawn(async move {
                        let conn = match incoming.establish().await {
                            Ok(conn) => conn,
                            Err(e) => {
                                warn!(error = %e, "Rejected connection");
                                return;
                            }
                        };
                        if let Err(e) = serve(conn).await {
                            debug!(error = %e, "Connection closed with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Failed to accept connection"),
            },
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
        }
    }

    Ok(())
}

async fn serve(conn: PluginConnection) -> anyhow::Result<()> {
    let mut conn = BufReader::new(conn);
    let mut line = String::new();

    loop {
        line.clear();
        if conn.read_line(&mut line).await? == 0 {
            return Ok(());
        }

        let request = line.trim_end();
        let (command, rest) = request.split_once(' ').unwrap_or((request, ""));
        let reply = match command {
            "meta" => conn
                .get_ref()
                .authorize(OperationKind::Metadata)
                .map(|_| {
                    format!(
                        "echo-plugin {} secure={}",
                        env!("CARGO_PKG_VERSION"),
                        conn.get_ref().is_secure()
                    )
                }),
            "echo" => conn
                .get_ref()
                .authorize(OperationKind::Secure)
                .map(|_| rest.to_string()),
            other => Ok(format!("error: unknown command {:?}", other)),
        }
        .unwrap_or_else(|e| format!("error: {}", e));

        let writer = conn.get_mut();
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
}
