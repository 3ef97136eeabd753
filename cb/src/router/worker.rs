//! Worker-side router
//!
//! A worker holds exactly one channel, to the host. Talking to another
//! worker or to the whole pool is expressed as a request the host performs
//! on this worker's behalf: a relay marker for one peer, a broadcast marker
//! for everyone else. Every outbound envelope is stamped with this worker's
//! id so the host knows where an eventual reply belongs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::codec;
use crate::envelope::{Class, Envelope, WorkerId};
use crate::trap::Trap;

struct WorkerInner {
    id: WorkerId,
    bus: Arc<Bus>,
    to_host: mpsc::UnboundedSender<Vec<u8>>,
}

/// Router for one worker process. Cheap to clone.
#[derive(Clone)]
pub struct WorkerRouter {
    inner: Arc<WorkerInner>,
}

impl WorkerRouter {
    pub fn new(id: WorkerId, bus: Arc<Bus>, to_host: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            inner: Arc::new(WorkerInner { id, bus, to_host }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.inner.bus
    }

    /// Deliver to this worker's own subscribers.
    pub fn send_local(&self, envelope: &Envelope) {
        self.inner.bus.send(envelope);
    }

    /// Query this worker's own subscribers.
    pub fn query_local(&self, envelope: Envelope) -> Trap {
        self.inner.bus.query(envelope)
    }

    /// One-way send to the host.
    pub fn send_primary(&self, mut envelope: Envelope) {
        envelope.header.origin = Some(self.inner.id);
        self.write(&envelope);
    }

    /// Query the host; resolves with its single reply.
    pub fn query_primary(&self, mut envelope: Envelope) -> Trap {
        let trap = self.allocate_single();
        envelope.header.trap = Some(trap.id());
        envelope.header.query = true;
        envelope.header.origin = Some(self.inner.id);
        debug!(trap_id = %trap.id(), name = %envelope.name, "query primary");
        self.write(&envelope);
        trap
    }

    /// Query another worker through the host; resolves with that worker's
    /// reply.
    pub fn query_worker(&self, target: WorkerId, mut envelope: Envelope) -> Trap {
        let trap = self.allocate_single();
        envelope.header.trap = Some(trap.id());
        envelope.header.query = true;
        envelope.header.origin = Some(self.inner.id);
        envelope.header.relay = Some(target);
        debug!(target = %target, trap_id = %trap.id(), name = %envelope.name, "query worker via host");
        self.write(&envelope);
        trap
    }

    /// One-way send to another worker, forwarded by the host.
    pub fn send_worker(&self, target: WorkerId, mut envelope: Envelope) {
        envelope.header.origin = Some(self.inner.id);
        envelope.header.relay = Some(target);
        self.write(&envelope);
    }

    /// One-way send to every other worker, fanned out by the host. No
    /// replies are expected or collected.
    pub fn send_all_workers(&self, mut envelope: Envelope) {
        envelope.header.origin = Some(self.inner.id);
        envelope.header.broadcast = true;
        self.write(&envelope);
    }

    /// Classify and act on one inbound wire message from the host.
    pub fn on_primary_message(&self, bytes: &[u8]) {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(worker_id = %self.inner.id, %error, "dropping malformed wire message");
                return;
            }
        };

        match envelope.classify() {
            Class::Reply => {
                let Some(trap) = envelope.header.trap else {
                    warn!(worker_id = %self.inner.id, name = %envelope.name, "reply without a trap id");
                    return;
                };
                self.inner.bus.traps().push_reply(trap, envelope.reply_value());
            }
            Class::Query => {
                // The host is querying this worker. The local query allocates
                // its own trap id; the reply must carry the host's.
                let Some(host_trap) = envelope.header.trap else {
                    return;
                };
                let router = self.clone();
                tokio::spawn(async move {
                    let value = router.query_local(envelope.bare()).await;
                    let mut reply = Envelope::reply_to(&envelope, host_trap, value);
                    reply.header.origin = Some(router.inner.id);
                    router.write(&reply);
                });
            }
            // Forwarded broadcasts and relays still carry their markers;
            // from this side they are plain deliveries.
            _ => self.send_local(&envelope),
        }
    }

    fn allocate_single(&self) -> Trap {
        let trap = self.inner.bus.traps().allocate();
        self.inner.bus.traps().set_expected(trap.id(), 1);
        trap
    }

    fn write(&self, envelope: &Envelope) {
        match codec::encode(envelope) {
            Ok(bytes) => {
                if self.inner.to_host.send(bytes).is_err() {
                    warn!(worker_id = %self.inner.id, "host channel closed, message dropped");
                }
            }
            Err(error) => {
                warn!(worker_id = %self.inner.id, name = %envelope.name, %error, "encode failed");
            }
        }
    }
}
