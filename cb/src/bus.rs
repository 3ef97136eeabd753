//! Bus - the process-scoped emitter + trap table pair
//!
//! Each process builds exactly one [`Bus`] at startup and hands it by
//! reference to whatever needs it (routers, transport, application code).
//! There are no module-level globals; ownership is explicit.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use crate::emitter::{Emitter, Filter, Handler};
use crate::envelope::Envelope;
use crate::trap::{Trap, TrapSet};

/// Local pub/sub dispatch plus the live table of correlated queries.
#[derive(Default)]
pub struct Bus {
    emitter: Emitter,
    traps: TrapSet,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            emitter: Emitter::new(),
            traps: TrapSet::new(),
        }
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn traps(&self) -> &TrapSet {
        &self.traps
    }

    pub fn on(&self, name: &str, handler: &Handler) {
        self.emitter.on(name, handler);
    }

    pub fn on_filtered(&self, name: &str, handler: &Handler, filter: Filter) {
        self.emitter.on_filtered(name, handler, filter);
    }

    pub fn once(&self, name: &str, handler: &Handler) {
        self.emitter.once(name, handler);
    }

    pub fn once_filtered(&self, name: &str, handler: &Handler, filter: Filter) {
        self.emitter.once_filtered(name, handler, filter);
    }

    pub fn off(&self, name: &str, handler: &Handler) {
        self.emitter.off(name, handler);
    }

    pub fn handles(&self, name: &str) -> bool {
        self.emitter.handles(name)
    }

    /// Deliver to local subscribers, synchronously.
    pub fn send(&self, envelope: &Envelope) {
        self.emitter.send(envelope);
    }

    /// Query local subscribers; resolves once every matching handler has
    /// replied (immediately, to null, when there are none).
    pub fn query(&self, envelope: Envelope) -> Trap {
        self.emitter.query(envelope, &self.traps)
    }

    /// Answer a correlated envelope. No-op when the envelope carries no trap
    /// id, so handlers may call this unconditionally.
    pub fn reply(&self, envelope: &Envelope, value: Value) {
        match envelope.header.trap {
            Some(id) => self.traps.push_reply(id, value),
            None => debug!(name = %envelope.name, "reply to uncorrelated envelope dropped"),
        }
    }
}

/// Build a bus wrapped in an [`Arc`] for shared ownership.
pub fn create_bus() -> Arc<Bus> {
    Arc::new(Bus::new())
}
