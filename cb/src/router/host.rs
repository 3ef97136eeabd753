//! Host-side router
//!
//! Owns the table of live worker channels. The table is mutated only by the
//! process-lifecycle hooks ([`add_worker`](HostRouter::add_worker) /
//! [`remove_worker`](HostRouter::remove_worker)); routing only reads it.
//!
//! One-way sends are non-blocking enqueue-and-return. Query and relay
//! continuations run in spawned tasks so the inbound path never blocks on a
//! worker's answer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::bus::Bus;
use crate::codec;
use crate::envelope::{Class, Envelope, WorkerId};
use crate::trap::Trap;

/// Outbound half of one worker's channel. The transport pumps the receiving
/// half into the actual process pipe.
pub type WorkerChannel = mpsc::UnboundedSender<Vec<u8>>;

struct HostInner {
    bus: Arc<Bus>,
    workers: Mutex<HashMap<WorkerId, WorkerChannel>>,
}

/// Router for the coordinating process. Cheap to clone.
#[derive(Clone)]
pub struct HostRouter {
    inner: Arc<HostInner>,
}

impl HostRouter {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self {
            inner: Arc::new(HostInner {
                bus,
                workers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.inner.bus
    }

    /// Register a worker as it comes online. Replaces any stale channel
    /// held under the same id.
    pub fn add_worker(&self, id: WorkerId, channel: WorkerChannel) {
        info!(worker_id = %id, "worker online");
        self.inner.workers.lock().unwrap().insert(id, channel);
    }

    /// Drop a worker's channel as it exits. Traps still waiting on that
    /// worker are left pending; that is the documented cost of a lost peer.
    pub fn remove_worker(&self, id: WorkerId) {
        info!(worker_id = %id, "worker offline");
        self.inner.workers.lock().unwrap().remove(&id);
    }

    pub fn worker_count(&self) -> usize {
        self.inner.workers.lock().unwrap().len()
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.inner.workers.lock().unwrap().keys().copied().collect();
        ids.sort();
        ids
    }

    /// Deliver to the host's own subscribers.
    pub fn send_local(&self, envelope: &Envelope) {
        self.inner.bus.send(envelope);
    }

    /// One-way send to a single worker.
    pub fn send_worker(&self, id: WorkerId, envelope: &Envelope) {
        match codec::encode(envelope) {
            Ok(bytes) => self.write(id, bytes),
            Err(error) => warn!(worker_id = %id, name = %envelope.name, %error, "encode failed"),
        }
    }

    /// One-way send to every worker.
    pub fn send_all_workers(&self, envelope: &Envelope) {
        let bytes = match codec::encode(envelope) {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(name = %envelope.name, %error, "encode failed");
                return;
            }
        };
        for (id, channel) in self.channels() {
            if channel.send(bytes.clone()).is_err() {
                warn!(worker_id = %id, "worker channel closed, message dropped");
            }
        }
    }

    /// One-way send to the host's own subscribers and every worker.
    pub fn send_host(&self, envelope: &Envelope) {
        self.send_local(envelope);
        self.send_all_workers(envelope);
    }

    /// Query the host's own subscribers.
    pub fn query_local(&self, envelope: Envelope) -> Trap {
        self.inner.bus.query(envelope)
    }

    /// Query the host's own subscribers and every worker in one call.
    /// Resolves to the pair `[local answer, workers aggregate]`.
    pub async fn query_host(&self, envelope: Envelope) -> Value {
        let local = self.query_local(envelope.clone()).await;
        let workers = self.query_all_workers(envelope).await;
        Value::Array(vec![local, workers])
    }

    /// Query one worker; resolves with its single reply.
    pub fn query_worker(&self, id: WorkerId, mut envelope: Envelope) -> Trap {
        let trap = self.inner.bus.traps().allocate();
        self.inner.bus.traps().set_expected(trap.id(), 1);
        envelope.header.trap = Some(trap.id());
        envelope.header.query = true;
        debug!(worker_id = %id, trap_id = %trap.id(), name = %envelope.name, "query worker");
        self.send_worker(id, &envelope);
        trap
    }

    /// Query every live worker at once; resolves with the arrival-ordered
    /// sequence of replies once all of them have answered. An empty pool
    /// resolves immediately to null.
    pub fn query_all_workers(&self, mut envelope: Envelope) -> Trap {
        let channels = self.channels();
        let trap = self.inner.bus.traps().allocate();
        self.inner.bus.traps().set_expected(trap.id(), channels.len());
        envelope.header.trap = Some(trap.id());
        envelope.header.query = true;
        debug!(trap_id = %trap.id(), workers = channels.len(), name = %envelope.name, "query all workers");

        match codec::encode(&envelope) {
            Ok(bytes) => {
                for (id, channel) in channels {
                    if channel.send(bytes.clone()).is_err() {
                        warn!(worker_id = %id, "worker channel closed, query dropped");
                    }
                }
            }
            Err(error) => warn!(name = %envelope.name, %error, "encode failed"),
        }
        trap
    }

    /// Classify and act on one inbound wire message from a worker.
    pub fn on_worker_message(&self, from: WorkerId, bytes: &[u8]) {
        let envelope = match codec::decode(bytes) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(worker_id = %from, %error, "dropping malformed wire message");
                return;
            }
        };

        match envelope.classify() {
            Class::Reply => {
                let Some(trap) = envelope.header.trap else {
                    warn!(worker_id = %from, name = %envelope.name, "reply without a trap id");
                    return;
                };
                self.inner.bus.traps().push_reply(trap, envelope.reply_value());
            }
            Class::RelayQuery(target) => {
                let Some(trap) = envelope.header.trap else {
                    return;
                };
                let requester = envelope.header.origin.unwrap_or(from);
                debug!(
                    worker_id = %requester,
                    target = %target,
                    trap_id = %trap,
                    "relaying query"
                );
                let router = self.clone();
                tokio::spawn(async move {
                    let value = router.query_worker(target, envelope.bare()).await;
                    let reply = Envelope::reply_to(&envelope, trap, value);
                    router.send_worker(requester, &reply);
                });
            }
            Class::Broadcast => {
                let origin = envelope.header.origin.unwrap_or(from);
                for (id, channel) in self.channels() {
                    if id == origin {
                        continue;
                    }
                    if channel.send(bytes.to_vec()).is_err() {
                        warn!(worker_id = %id, "worker channel closed, broadcast dropped");
                    }
                }
            }
            Class::Relay(target) => {
                // One-way forward, unchanged.
                self.write(target, bytes.to_vec());
            }
            Class::Query => {
                // The worker is querying the host itself.
                let Some(trap) = envelope.header.trap else {
                    return;
                };
                let requester = envelope.header.origin.unwrap_or(from);
                let router = self.clone();
                tokio::spawn(async move {
                    let value = router.query_local(envelope.bare()).await;
                    let reply = Envelope::reply_to(&envelope, trap, value);
                    router.send_worker(requester, &reply);
                });
            }
            Class::Plain => self.send_local(&envelope),
        }
    }

    fn channels(&self) -> Vec<(WorkerId, WorkerChannel)> {
        self.inner
            .workers
            .lock()
            .unwrap()
            .iter()
            .map(|(id, channel)| (*id, channel.clone()))
            .collect()
    }

    fn write(&self, id: WorkerId, bytes: Vec<u8>) {
        let channel = self.inner.workers.lock().unwrap().get(&id).cloned();
        match channel {
            Some(channel) => {
                if channel.send(bytes).is_err() {
                    warn!(worker_id = %id, "worker channel closed, message dropped");
                }
            }
            None => warn!(worker_id = %id, "no such worker, message dropped"),
        }
    }
}
