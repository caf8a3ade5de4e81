// src/plugins/connection.rs
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::utils::error::{Result, RunnerError};

pub trait PluginStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PluginStream for T {}

/// What a request on the channel needs from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only introspection, allowed in metadata mode.
    Metadata,
    /// Anything that touches secrets or mutates state.
    Secure,
}

/// An open channel between host and plugin; mutually authenticated unless the
/// plugin runs in metadata mode.
pub struct PluginConnection {
    stream: Box<dyn PluginStream>,
    secure: bool,
}

impl PluginConnection {
    pub(crate) fn new(stream: Box<dyn PluginStream>, secure: bool) -> Self {
        Self { stream, secure }
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn authorize(&self, operation: OperationKind) -> Result<()> {
        match (operation, self.secure) {
            (OperationKind::Secure, false) => Err(RunnerError::MetadataOnly),
            _ => Ok(()),
        }
    }
}

impl AsyncRead for PluginConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for PluginConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("secure", &self.secure)
            .finish_non_exhaustive()
    }
}
