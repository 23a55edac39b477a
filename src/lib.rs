//! Relays local TCP and UDP connections to a remote destination through a client/server tunnel.
//!
//! The client accepts local application connections and forwards each of them either over its
//! own transport connection, or as one stream of a multiplexed session sharing a single transport
//! connection. The server accepts transport connections, dials a fixed destination for every
//! relayed connection or stream, and copies bytes both ways until either side is done.

pub mod accept;
pub mod args;
pub mod client;
pub mod config;
pub mod error;
pub mod logging;
pub mod mux;
pub mod preface;
pub mod relay;
pub mod serialize;
pub mod server;
pub mod transport;

#[cfg(test)]
pub mod test_utils;

pub use client::run_client;
pub use error::{Error, Result};
pub use server::run_server;
