//! ClusterBus - host/worker message bus with reply correlation
//!
//! A host process owns a pool of worker processes and is the only router
//! between them. Within a process, components publish and subscribe to named
//! events; across processes, envelopes flow over per-worker channels with
//! the host classifying each one (reply, relay, broadcast, query, plain) and
//! acting on it.
//!
//! # Core Concepts
//!
//! - **Envelope**: a named event plus opaque payload plus a routing header,
//!   kept apart so user data can never forge control metadata
//! - **Emitter**: per-process pub/sub with idempotent registration and
//!   registration-order synchronous fan-out
//! - **Trap**: the correlation future - allocated before a query goes out,
//!   resolved once the computed number of replies has arrived
//! - **Routers**: the host variant owns every worker channel; the worker
//!   variant talks only to the host and asks it to relay or broadcast
//!
//! Delivery is best-effort: no retries, no timeouts, no persistence. A query
//! whose addressee dies pends forever; callers wanting a deadline wrap the
//! returned trap in `tokio::time::timeout`.
//!
//! # Modules
//!
//! - [`envelope`] - message data unit and classification
//! - [`codec`] - wire encoding (flat JSON with `#`-reserved control keys)
//! - [`emitter`] - in-process publish/subscribe
//! - [`trap`] - reply correlation table and future
//! - [`bus`] - the process-scoped emitter + trap pair
//! - [`router`] - host-side and worker-side routing state machines
//! - [`transport`] - Unix-socket JSON-lines channel implementation
//! - [`config`] - transport configuration

pub mod bus;
pub mod codec;
pub mod config;
pub mod emitter;
pub mod envelope;
pub mod router;
pub mod transport;
pub mod trap;

// Re-export commonly used types
pub use bus::{Bus, create_bus};
pub use codec::{CodecError, decode, encode};
pub use config::BusConfig;
pub use emitter::{Emitter, Filter, Handler, HandlerId};
pub use envelope::{Class, Envelope, Header, TrapId, WorkerId};
pub use router::{HostRouter, WorkerRouter};
pub use transport::{connect_worker, default_socket_path};
pub use trap::{Trap, TrapSet};
