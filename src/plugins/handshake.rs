// src/plugins/handshake.rs
use std::fmt;
use std::net::SocketAddr;

use crate::plugins::types::HandshakeConfig;
use crate::utils::error::{Result, RunnerError};

pub const CORE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSecurity {
    Tls,
    Plain,
}

impl ChannelSecurity {
    fn as_str(&self) -> &'static str {
        match self {
            ChannelSecurity::Tls => "tls",
            ChannelSecurity::Plain => "plain",
        }
    }
}

/// The single line a plugin prints on stdout once its listener is up:
/// `CORE|APP|tcp|ADDR|tls`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub core_version: u32,
    pub app_version: u32,
    pub addr: SocketAddr,
    pub security: ChannelSecurity,
}

impl HandshakeLine {
    pub fn new(app_version: u32, addr: SocketAddr, security: ChannelSecurity) -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version,
            addr,
            security,
        }
    }

    pub fn parse(line: &str) -> Result<Self> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 5 {
            return Err(RunnerError::Handshake(format!(
                "unrecognized handshake line: {:?}",
                line.trim()
            )));
        }

        let core_version = parts[0]
            .parse()
            .map_err(|_| RunnerError::Handshake(format!("bad core version: {}", parts[0])))?;
        let app_version = parts[1]
            .parse()
            .map_err(|_| RunnerError::Handshake(format!("bad protocol version: {}", parts[1])))?;
        if parts[2] != "tcp" {
            return Err(RunnerError::Handshake(format!("unsupported network: {}", parts[2])));
        }
        let addr = parts[3]
            .parse()
            .map_err(|_| RunnerError::Handshake(format!("bad address: {}", parts[3])))?;
        let security = match parts[4] {
            "tls" => ChannelSecurity::Tls,
            "plain" => ChannelSecurity::Plain,
            other => {
                return Err(RunnerError::Handshake(format!("unknown channel security: {}", other)))
            }
        };

        Ok(Self {
            core_version,
            app_version,
            addr,
            security,
        })
    }

    /// Checks the plugin speaks our protocol, listens on loopback, and offers
    /// the channel security the launch expects.
    pub fn validate(&self, config: &HandshakeConfig, expected: ChannelSecurity) -> Result<()> {
        if self.core_version != CORE_PROTOCOL_VERSION {
            return Err(RunnerError::Handshake(format!(
                "core protocol version {} unsupported",
                self.core_version
            )));
        }
        if self.app_version != config.protocol_version {
            return Err(RunnerError::Handshake(format!(
                "plugin speaks protocol {}, host expects {}",
                self.app_version, config.protocol_version
            )));
        }
        if !self.addr.ip().is_loopback() {
            return Err(RunnerError::Handshake(format!(
                "plugin listens on non-loopback address {}",
                self.addr
            )));
        }
        if self.security != expected {
            return Err(RunnerError::Handshake(format!(
                "plugin offered {} channel, expected {}",
                self.security.as_str(),
                expected.as_str()
            )));
        }
        Ok(())
    }
}

impl fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|tcp|{}|{}",
            self.core_version,
            self.app_version,
            self.addr,
            self.security.as_str()
        )
    }
}
