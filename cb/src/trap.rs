//! Trap - cross-process reply correlation
//!
//! A trap is allocated before a query goes out, told how many replies to
//! expect, and resolves exactly once that many replies have arrived. The
//! caller awaits the [`Trap`] future; replies are pushed by whichever router
//! receives them. A reply for an id that is no longer live is silently
//! dropped - late or duplicate replies must never crash the router.
//!
//! There is deliberately no timeout in this table: a trap whose expected
//! count is never reached (the addressed worker died) pends forever. Callers
//! that want a deadline wrap the future in `tokio::time::timeout`.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::envelope::TrapId;

struct TrapState {
    /// Set once by the sender before any reply can arrive
    expected: Option<usize>,
    /// Accumulates in arrival order
    replies: Vec<Value>,
    tx: oneshot::Sender<Value>,
}

/// Process-scoped table of live traps.
///
/// Built once per process (inside the [`Bus`](crate::Bus)) and shared by
/// reference; every mutation is a single locked step, so the sender's
/// allocate-then-set-expected sequence cannot race an arriving reply.
pub struct TrapSet {
    next_id: AtomicU64,
    table: Mutex<HashMap<TrapId, TrapState>>,
}

impl Default for TrapSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapSet {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Allocate the next trap id and return its pending future.
    pub fn allocate(&self) -> Trap {
        let id = TrapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let state = TrapState {
            expected: None,
            replies: Vec::new(),
            tx,
        };
        self.table.lock().unwrap().insert(id, state);
        debug!(trap_id = %id, "allocated trap");
        Trap { id, rx }
    }

    /// Record how many replies resolve the trap. A second call, or a call
    /// after resolution, is a no-op. Zero resolves immediately - there is
    /// nothing to wait for.
    pub fn set_expected(&self, id: TrapId, expected: usize) {
        let mut table = self.table.lock().unwrap();
        let Some(state) = table.get_mut(&id) else {
            return;
        };
        if state.expected.is_some() {
            return;
        }
        state.expected = Some(expected);
        if state.replies.len() >= expected {
            Self::resolve(&mut table, id);
        }
    }

    /// Append a reply. Unknown ids are ignored: the query already resolved
    /// or was never sent. Resolves the trap once the expected count is met.
    pub fn push_reply(&self, id: TrapId, reply: Value) {
        let mut table = self.table.lock().unwrap();
        let Some(state) = table.get_mut(&id) else {
            debug!(trap_id = %id, "dropping reply for unknown trap");
            return;
        };
        state.replies.push(reply);
        if state.expected == Some(state.replies.len()) {
            Self::resolve(&mut table, id);
        }
    }

    /// Resolve immediately with whatever replies have arrived. Used when a
    /// query finds no recipients at all.
    pub fn resolve_now(&self, id: TrapId) {
        let mut table = self.table.lock().unwrap();
        Self::resolve(&mut table, id);
    }

    /// Whether the trap is still live (unresolved).
    pub fn contains(&self, id: TrapId) -> bool {
        self.table.lock().unwrap().contains_key(&id)
    }

    /// Number of live traps.
    pub fn len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn resolve(table: &mut HashMap<TrapId, TrapState>, id: TrapId) {
        if let Some(state) = table.remove(&id) {
            debug!(trap_id = %id, replies = state.replies.len(), "trap resolved");
            // The receiver may already be gone; nothing to do then.
            let _ = state.tx.send(resolution(state.replies));
        }
    }
}

/// One reply resolves to the bare value, several to the ordered sequence,
/// none (defensively) to null.
fn resolution(mut replies: Vec<Value>) -> Value {
    match replies.len() {
        0 => Value::Null,
        1 => replies.pop().unwrap_or(Value::Null),
        _ => Value::Array(replies),
    }
}

/// Pending resolution of a correlated query.
///
/// Resolves to the value described on [`TrapSet`]; pends forever if the
/// expected reply count is never reached.
pub struct Trap {
    id: TrapId,
    rx: oneshot::Receiver<Value>,
}

impl Trap {
    /// The correlation id stamped onto the outgoing envelope.
    pub fn id(&self) -> TrapId {
        self.id
    }
}

impl Future for Trap {
    type Output = Value;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The sender lives in the trap table for the life of the process;
        // a dropped sender means the whole bus went away.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Value::Null))
    }
}
