//! Routing state machines for cross-process delivery
//!
//! The host owns every worker channel and is the only process that routes
//! between workers. Workers hold a single channel to the host and express
//! relay and broadcast as requests the host performs on their behalf.
//!
//! Both variants consume raw wire bytes, decode them once, and act on the
//! envelope's [`Class`](crate::envelope::Class) - reply handling always comes
//! first, because a reply envelope may still carry markers left over from the
//! request it answers.

mod host;
mod worker;

pub use host::{HostRouter, WorkerChannel};
pub use worker::WorkerRouter;
