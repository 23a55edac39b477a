//! Command line arguments.

use clap::{Args, Parser, Subcommand};

use crate::config::{
    ClientConfig, MuxConfig, Protocol, RelayMode, ServerConfig, TransportKind, DEFAULT_MAX_STREAM_BUFFER, MUX_PROTOCOL_VERSION,
};

pub const DEFAULT_CLIENT_LISTEN_ADDRESS: &str = "localhost:2080";
pub const DEFAULT_SERVER_LISTEN_ADDRESS: &str = "localhost:7901";

/// Relays TCP and UDP connections through single or multiplexed transport connections.
#[derive(Debug, Parser)]
#[command(name = "tunnel-relay", version, about, long_about = None)]
pub struct Cli {
    /// Log filter directive (e.g. info, debug, tunnel_relay=trace). RUST_LOG takes precedence.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log IP addresses instead of scrubbing them out.
    #[arg(long, global = true)]
    pub unsafe_logging: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Accept local application connections and relay them to a relay server.
    Client(ClientArgs),

    /// Accept transport connections from relay clients and relay them to a destination.
    Server(ServerArgs),
}

/// Options both sides must agree on.
#[derive(Debug, Args)]
pub struct RelayArgs {
    /// Relay every connection over its own transport connection instead of multiplexing all of
    /// them over one. Required when the destination expects one logical stream per connection.
    #[arg(long)]
    pub single_connection_mode: bool,

    /// The multiplexing protocol version. Must match the other side.
    #[arg(long, default_value_t = MUX_PROTOCOL_VERSION)]
    pub mux_version: u8,

    /// The receive buffer of each multiplexed stream, in bytes.
    #[arg(long, default_value_t = DEFAULT_MAX_STREAM_BUFFER)]
    pub max_stream_buffer: usize,

    /// How transport connections are established.
    #[arg(long, value_enum, default_value_t = TransportKind::Quic)]
    pub transport: TransportKind,

    /// The protocol of the relayed application, used on the client's listener and towards the
    /// destination.
    #[arg(long, value_enum, default_value_t = Protocol::Tcp)]
    pub destination_protocol: Protocol,
}

impl RelayArgs {
    fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            protocol_version: self.mux_version,
            max_stream_receive_buffer: self.max_stream_buffer,
            ..MuxConfig::new()
        }
    }
}

#[derive(Debug, Args)]
pub struct ClientArgs {
    /// Where to accept local application connections.
    #[arg(long, default_value = DEFAULT_CLIENT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// The relay server's transport address.
    #[arg(long)]
    pub server_address: String,

    /// The server name to present when the transport is QUIC.
    #[arg(long, default_value = crate::transport::quic::CERTIFICATE_SERVER_NAME)]
    pub server_name: String,

    #[command(flatten)]
    pub relay: RelayArgs,
}

impl ClientArgs {
    pub fn into_config(self) -> ClientConfig {
        ClientConfig {
            mode: RelayMode::from_flag(self.relay.single_connection_mode),
            mux: self.relay.mux_config(),
            listen_address: self.listen_address,
            protocol: self.relay.destination_protocol,
            server_address: self.server_address,
            server_name: self.server_name,
            transport: self.relay.transport,
        }
    }
}

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Where to accept transport connections.
    #[arg(long, default_value = DEFAULT_SERVER_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Where to forward every relayed connection.
    #[arg(long)]
    pub destination_address: String,

    #[command(flatten)]
    pub relay: RelayArgs,
}

impl ServerArgs {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            mode: RelayMode::from_flag(self.relay.single_connection_mode),
            mux: self.relay.mux_config(),
            listen_address: self.listen_address,
            destination_address: self.destination_address,
            destination_protocol: self.relay.destination_protocol,
            transport: self.relay.transport,
        }
    }
}
