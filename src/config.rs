use std::fmt;

use clap::ValueEnum;

use crate::{
    error::{Error, Result},
    serialize::U8ReprEnum,
};

/// The multiplexing protocol revision spoken by this build. Both peers must use the same one.
pub const MUX_PROTOCOL_VERSION: u8 = 1;

/// The multiplexing protocol revisions this build can speak.
pub const SUPPORTED_MUX_VERSIONS: &[u8] = &[MUX_PROTOCOL_VERSION];

/// Default per-stream receive buffer, in bytes.
pub const DEFAULT_MAX_STREAM_BUFFER: usize = 1024 * 1024;

/// The maximum amount of concurrently open streams the client opens on one multiplexed session.
/// Opening more fails for the new stream only.
pub const MAX_STREAMS_PER_SESSION: usize = 8192;

/// Whether each transport connection carries one relayed connection or many multiplexed streams.
///
/// This is chosen once for the whole process and must be the same on both ends of the tunnel.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    SingleConnection = 0,
    Multiplexed = 1,
}

impl RelayMode {
    pub const fn from_flag(single_connection_mode: bool) -> Self {
        match single_connection_mode {
            true => Self::SingleConnection,
            false => Self::Multiplexed,
        }
    }
}

impl fmt::Display for RelayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleConnection => write!(f, "single-connection"),
            Self::Multiplexed => write!(f, "multiplexed"),
        }
    }
}

impl U8ReprEnum for RelayMode {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::SingleConnection),
            1 => Some(Self::Multiplexed),
            _ => None,
        }
    }

    fn into_u8(self) -> u8 {
        self as u8
    }
}

/// The protocol spoken by the relayed application, used for the client's local listener and the
/// server's destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// How transport connections between the client and the server are established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportKind {
    /// A plain TCP connection.
    Tcp,

    /// One bidirectional stream on its own QUIC connection.
    Quic,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Quic => write!(f, "quic"),
        }
    }
}

/// Configuration of a multiplexed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxConfig {
    /// The multiplexing protocol revision. Must match the peer's exactly.
    pub protocol_version: u8,

    /// Always true. Dead transports are detected by the transport itself.
    pub keep_alive_disabled: bool,

    /// The receive buffer each stream may use, in bytes.
    pub max_stream_receive_buffer: usize,
}

impl MuxConfig {
    pub const fn new() -> Self {
        Self {
            protocol_version: MUX_PROTOCOL_VERSION,
            keep_alive_disabled: true,
            max_stream_receive_buffer: DEFAULT_MAX_STREAM_BUFFER,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_MUX_VERSIONS.contains(&self.protocol_version) {
            return Err(Error::Config(format!(
                "unsupported multiplexing protocol version {} (supported: {SUPPORTED_MUX_VERSIONS:?})",
                self.protocol_version
            )));
        }

        if !self.keep_alive_disabled {
            return Err(Error::Config("multiplexer keep-alive cannot be enabled".to_string()));
        }

        if self.max_stream_receive_buffer == 0 {
            return Err(Error::Config("the stream receive buffer must not be empty".to_string()));
        }

        Ok(())
    }
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Specifies how the client side of the relay runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Where to listen for local application connections.
    pub listen_address: String,

    /// The protocol of the local application connections.
    pub protocol: Protocol,

    /// The server's transport endpoint.
    pub server_address: String,

    /// The TLS server name presented when the transport is QUIC.
    pub server_name: String,

    pub transport: TransportKind,
    pub mode: RelayMode,
    pub mux: MuxConfig,
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            return Err(Error::Config("a listen address must be specified".to_string()));
        }

        if self.server_address.is_empty() {
            return Err(Error::Config("a server address must be specified".to_string()));
        }

        self.mux.validate()
    }
}

/// Specifies how the server side of the relay runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Where to listen for transport connections.
    pub listen_address: String,

    /// The address every relayed connection is forwarded to.
    pub destination_address: String,

    /// The protocol used towards the destination.
    pub destination_protocol: Protocol,

    pub transport: TransportKind,
    pub mode: RelayMode,
    pub mux: MuxConfig,
}

impl ServerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.listen_address.is_empty() {
            return Err(Error::Config("a listen address must be specified".to_string()));
        }

        if self.destination_address.is_empty() {
            return Err(Error::Config("a destination address must be specified".to_string()));
        }

        self.mux.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_config() -> ServerConfig {
        ServerConfig {
            listen_address: "localhost:7901".to_string(),
            destination_address: "localhost:1080".to_string(),
            destination_protocol: Protocol::Tcp,
            transport: TransportKind::Tcp,
            mode: RelayMode::Multiplexed,
            mux: MuxConfig::new(),
        }
    }

    #[test]
    fn default_mux_config_is_valid() {
        let config = MuxConfig::default();
        assert!(config.keep_alive_disabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unsupported_mux_version_is_rejected() {
        let mut config = server_config();
        config.mux.protocol_version = 9;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn missing_destination_is_rejected() {
        let mut config = server_config();
        config.destination_address.clear();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn mode_round_trips_through_its_byte() {
        assert_eq!(RelayMode::from_u8(RelayMode::Multiplexed.into_u8()), Some(RelayMode::Multiplexed));
        assert_eq!(RelayMode::from_u8(7), None);
        assert_eq!(RelayMode::from_flag(true), RelayMode::SingleConnection);
    }
}
