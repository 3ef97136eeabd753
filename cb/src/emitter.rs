//! Emitter - in-process publish/subscribe dispatch
//!
//! Handlers are registered per event name and fired synchronously, in
//! registration order, when an envelope with that name is sent. Registration
//! is idempotent by handler identity: a [`Handler`] carries a process-unique
//! id that its clones share, so registering the same handler twice yields a
//! single dispatch and `off` removes exactly that handler.
//!
//! Dispatch swaps the active thunk list out before iterating and re-adds each
//! surviving thunk before its invocation, so a handler may `on`/`off`/`send`
//! the same event from inside its own invocation without corrupting the
//! in-flight iteration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::envelope::Envelope;
use crate::trap::{Trap, TrapSet};

/// Handler callback. An `Err` is caught and logged by the dispatcher; it
/// never aborts the fan-out or reaches the sender.
pub type HandlerFn = Arc<dyn Fn(&Envelope) -> eyre::Result<()> + Send + Sync>;

/// Predicate gating delivery of an envelope to one handler.
pub type Filter = Arc<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Registration identity for handlers; clones of a [`Handler`] share one id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

fn next_handler_id() -> HandlerId {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    HandlerId(NEXT.fetch_add(1, Ordering::Relaxed))
}

/// A callback with a stable identity, cheap to clone.
#[derive(Clone)]
pub struct Handler {
    id: HandlerId,
    func: HandlerFn,
}

impl Handler {
    pub fn new(func: impl Fn(&Envelope) -> eyre::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            id: next_handler_id(),
            func: Arc::new(func),
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }
}

#[derive(Clone)]
struct Thunk {
    id: HandlerId,
    func: HandlerFn,
    once: bool,
    filter: Option<Filter>,
}

impl Thunk {
    fn matches(&self, envelope: &Envelope) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(envelope))
    }

    fn invoke(&self, envelope: &Envelope) {
        if let Err(error) = (self.func)(envelope) {
            warn!(name = %envelope.name, %error, "handler failed during dispatch");
        }
    }
}

/// Per-process handler registry with synchronous fan-out.
#[derive(Default)]
pub struct Emitter {
    handlers: Mutex<HashMap<String, Vec<Thunk>>>,
    silent: AtomicBool,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for an event name. No-op if this handler is
    /// already registered for that name.
    pub fn on(&self, name: &str, handler: &Handler) {
        self.register(name, handler, false, None);
    }

    /// Like [`on`](Self::on), with a delivery predicate.
    pub fn on_filtered(&self, name: &str, handler: &Handler, filter: Filter) {
        self.register(name, handler, false, Some(filter));
    }

    /// Register a handler that is removed after its first dispatch.
    pub fn once(&self, name: &str, handler: &Handler) {
        self.register(name, handler, true, None);
    }

    /// Like [`once`](Self::once), with a delivery predicate.
    pub fn once_filtered(&self, name: &str, handler: &Handler, filter: Filter) {
        self.register(name, handler, true, Some(filter));
    }

    /// Register one handler for several event names at once.
    pub fn on_each(&self, names: &[&str], handler: &Handler) {
        for name in names {
            self.on(name, handler);
        }
    }

    /// Remove a handler from several event names at once.
    pub fn off_each(&self, names: &[&str], handler: &Handler) {
        for name in names {
            self.off(name, handler);
        }
    }

    /// Remove a handler by identity. No-op if it was not registered.
    pub fn off(&self, name: &str, handler: &Handler) {
        let mut handlers = self.handlers.lock().unwrap();
        if let Some(thunks) = handlers.get_mut(name) {
            thunks.retain(|thunk| thunk.id != handler.id);
        }
    }

    /// Remove every handler for an event name.
    pub fn clear(&self, name: &str) {
        self.handlers.lock().unwrap().remove(name);
    }

    /// Whether any handler is registered for the event name.
    pub fn handles(&self, name: &str) -> bool {
        self.len(name) > 0
    }

    /// Number of handlers registered for the event name.
    pub fn len(&self, name: &str) -> usize {
        self.handlers
            .lock()
            .unwrap()
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Suppress [`send`](Self::send) until [`resume`](Self::resume).
    pub fn silence(&self) {
        self.silent.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.silent.store(false, Ordering::Relaxed);
    }

    /// Synchronous fan-out to every registered handler whose filter accepts
    /// the envelope, in registration order. Handler errors are logged and do
    /// not stop the fan-out.
    pub fn send(&self, envelope: &Envelope) {
        if self.silent.load(Ordering::Relaxed) {
            return;
        }
        let thunks = self.swap_out(&envelope.name);
        for thunk in &thunks {
            self.restore(&envelope.name, thunk);
            if thunk.matches(envelope) {
                thunk.invoke(envelope);
            }
        }
    }

    /// Dispatch a query: allocate a trap, stamp its id onto the envelope,
    /// record the number of matching handlers as the expected reply count
    /// *before* any handler runs, then fan out. Zero matching handlers
    /// resolves the trap immediately.
    ///
    /// Handlers answer by pushing a reply for the envelope's trap id, either
    /// synchronously during dispatch or later from a spawned task.
    pub fn query(&self, mut envelope: Envelope, traps: &TrapSet) -> Trap {
        let trap = traps.allocate();
        envelope.header.trap = Some(trap.id());

        let thunks = self.swap_out(&envelope.name);
        let mut selected = Vec::with_capacity(thunks.len());
        for thunk in &thunks {
            self.restore(&envelope.name, thunk);
            if thunk.matches(&envelope) {
                selected.push(thunk);
            }
        }

        debug!(name = %envelope.name, trap_id = %trap.id(), expected = selected.len(), "local query");
        if selected.is_empty() {
            traps.resolve_now(trap.id());
            return trap;
        }
        traps.set_expected(trap.id(), selected.len());
        for thunk in selected {
            thunk.invoke(&envelope);
        }
        trap
    }

    fn register(&self, name: &str, handler: &Handler, once: bool, filter: Option<Filter>) {
        let mut handlers = self.handlers.lock().unwrap();
        let thunks = handlers.entry(name.to_string()).or_default();
        if thunks.iter().any(|thunk| thunk.id == handler.id) {
            return;
        }
        thunks.push(Thunk {
            id: handler.id,
            func: Arc::clone(&handler.func),
            once,
            filter,
        });
    }

    /// Take the active thunk list for an event, leaving an empty slot that
    /// re-entrant registrations append to.
    fn swap_out(&self, name: &str) -> Vec<Thunk> {
        let mut handlers = self.handlers.lock().unwrap();
        handlers.get_mut(name).map(std::mem::take).unwrap_or_default()
    }

    /// Put a non-once thunk back before invoking it, unless the handler
    /// re-registered itself in the meantime.
    fn restore(&self, name: &str, thunk: &Thunk) {
        if thunk.once {
            return;
        }
        let mut handlers = self.handlers.lock().unwrap();
        let thunks = handlers.entry(name.to_string()).or_default();
        if !thunks.iter().any(|t| t.id == thunk.id) {
            thunks.push(thunk.clone());
        }
    }
}
