// src/plugins/wrapping/endpoint.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::{ClientConfig, ServerConfig};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::core::crypto::secure_memory::zero;
use crate::core::crypto::tls::{server_name, PLUGIN_SERVER_NAME};
use crate::plugins::traits::Unwrapper;
use crate::utils::error::{Result, RunnerError};

const MAX_MESSAGE_BYTES: u64 = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize, Deserialize)]
struct UnwrapRequest {
    token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UnwrapResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Host-side TLS endpoint that plugins call to exchange their wrapping token.
/// One JSON line in, one JSON line out, then the connection is closed.
pub struct UnwrapEndpoint {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    unwrapper: Arc<dyn Unwrapper>,
}

impl UnwrapEndpoint {
    pub async fn bind(
        addr: &str,
        tls: Arc<ServerConfig>,
        unwrapper: Arc<dyn Unwrapper>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "Unwrap endpoint listening");

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            unwrapper,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.serve())
    }

    pub async fn serve(self) {
        loop {
            let (tcp, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Unwrap endpoint accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let acceptor = self.acceptor.clone();
            let unwrapper = self.unwrapper.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(acceptor, tcp, unwrapper).await {
                    warn!(peer = %peer, error = %e, "Unwrap request failed");
                }
            });
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    tcp: TcpStream,
    unwrapper: Arc<dyn Unwrapper>,
) -> Result<()> {
    let tls = tokio::time::timeout(DEFAULT_TIMEOUT, acceptor.accept(tcp))
        .await
        .map_err(|_| RunnerError::Tls("unwrap endpoint handshake timed out".into()))??;
    let (reader, mut writer) = tokio::io::split(tls);

    let request: UnwrapRequest = read_message(reader).await?;
    let response = match unwrapper.unwrap(&request.token).await {
        Ok(data) => UnwrapResponse {
            data: Some(data),
            error: None,
        },
        Err(e) => UnwrapResponse {
            data: None,
            error: Some(e.to_string()),
        },
    };

    let mut bytes = serde_json::to_vec(&response)
        .map_err(|e| RunnerError::Unwrap(format!("response encoding failed: {}", e)))?;
    bytes.push(b'\n');
    let written = writer.write_all(&bytes).await;
    zero(&mut bytes);
    written?;
    writer.shutdown().await?;

    debug!(ok = response.error.is_none(), "Served unwrap request");
    Ok(())
}

async fn read_message<R, T>(reader: R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut reader = BufReader::new(reader.take(MAX_MESSAGE_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Err(RunnerError::Unwrap("empty message".into()));
    }
    serde_json::from_str(line.trim())
        .map_err(|e| RunnerError::Unwrap(format!("malformed message: {}", e)))
}

async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(message)
        .map_err(|e| RunnerError::Unwrap(format!("message encoding failed: {}", e)))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Plugin-side client of [`UnwrapEndpoint`].
pub struct RemoteUnwrapper {
    addr: String,
    tls: Arc<ClientConfig>,
    server_name: String,
    timeout: Duration,
}

impl RemoteUnwrapper {
    pub fn new(addr: impl Into<String>, tls: Arc<ClientConfig>) -> Self {
        Self {
            addr: addr.into(),
            tls,
            server_name: PLUGIN_SERVER_NAME.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn exchange(&self, token: &str) -> Result<serde_json::Value> {
        let tcp = TcpStream::connect(&self.addr).await?;
        let tls = TlsConnector::from(self.tls.clone())
            .connect(server_name(&self.server_name)?, tcp)
            .await?;
        let (reader, mut writer) = tokio::io::split(tls);

        write_message(&mut writer, &UnwrapRequest { token: token.to_string() }).await?;
        let response: UnwrapResponse = read_message(reader).await?;

        match (response.data, response.error) {
            (_, Some(error)) => Err(RunnerError::Unwrap(error)),
            (Some(data), None) => Ok(data),
            (None, None) => Err(RunnerError::Unwrap("empty unwrap response".into())),
        }
    }
}

#[async_trait]
impl Unwrapper for RemoteUnwrapper {
    async fn unwrap(&self, token: &str) -> Result<serde_json::Value> {
        tokio::time::timeout(self.timeout, self.exchange(token))
            .await
            .map_err(|_| RunnerError::Unwrap(format!("unwrap call to {} timed out", self.addr)))?
            .map_err(|e| match e {
                RunnerError::Unwrap(_) => e,
                other => RunnerError::Unwrap(other.to_string()),
            })
    }
}
