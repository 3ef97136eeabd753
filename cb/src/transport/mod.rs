//! Unix-socket transport for the host/worker channels
//!
//! One JSON envelope per line over a Unix domain socket. The host binds and
//! listens; each worker connects and introduces itself with a hello envelope
//! carrying its worker id, after which the connection becomes that worker's
//! channel in both directions.
//!
//! The transport makes no delivery guarantees beyond what the socket gives
//! us: no retries, no reconnects, no backpressure. A dead peer simply stops
//! being routed to.

use std::path::PathBuf;

pub mod client;
pub mod listener;

pub use client::connect_worker;
pub use listener::{bind, cleanup_socket, serve};

/// Event name a worker's first line must carry, with its id in the header.
pub const HELLO_EVENT: &str = "worker.hello";

/// Default socket path for the bus
///
/// Uses the runtime dir where available, like other per-user daemon files.
pub fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("clusterbus")
        .join("bus.sock")
}
