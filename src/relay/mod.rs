//! Pairing of local connections with remote streams, and the copy loop that runs between them.

pub mod copy;
pub mod pair;

pub use copy::{copy_loop, CopyEnd, CopyOutcome};
pub use pair::{open_and_relay, relay_pair};
