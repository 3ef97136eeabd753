//! Envelope - the unit of communication on the bus
//!
//! An envelope is a named event plus arbitrary caller fields, with a routing
//! header kept separate from the payload so user data can never collide with
//! control metadata. Routers never branch on optional fields directly; they
//! classify an inbound envelope once into a [`Class`] and match on that.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifies one worker process within the cluster.
///
/// Worker ids are assigned by the host when it spawns the pool; the bus only
/// routes on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        WorkerId(id)
    }
}

/// Correlation id linking replies to the query that expects them.
///
/// Ids are monotonically assigned per process starting at 1 and are never
/// reused while a query is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrapId(pub u64);

impl fmt::Display for TrapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routing control fields, never visible to handlers as payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    /// Present iff this envelope is part of a query/reply exchange
    pub trap: Option<TrapId>,
    /// Sender expects exactly one reply per addressed recipient
    pub query: bool,
    /// `fields["reply"]` carries the correlated answer
    pub reply: bool,
    /// Originating worker, stamped by a worker before transmission
    pub origin: Option<WorkerId>,
    /// Host should forward this envelope to the named worker
    pub relay: Option<WorkerId>,
    /// Host should fan this envelope out to every other worker
    pub broadcast: bool,
}

/// Exhaustive classification of an inbound envelope.
///
/// Precedence is fixed: reply detection comes first because a reply may still
/// carry reserved fields left over from the request it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Correlated answer; push into the trap table, no further routing
    Reply,
    /// Worker asks the host to query another worker on its behalf
    RelayQuery(WorkerId),
    /// Fan out to every worker except the origin, no replies collected
    Broadcast,
    /// One-way forward to another worker
    Relay(WorkerId),
    /// Query addressed to the receiving process itself
    Query,
    /// Plain one-way message, deliver locally
    Plain,
}

/// Key under which a correlated answer travels in the user fields.
pub const REPLY_FIELD: &str = "reply";

/// A named event plus caller payload plus routing header.
///
/// Envelopes are immutable once dispatched: routers clone when fanning out or
/// relaying rather than mutating an in-flight instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    /// Event name; selects handlers on the receiving side
    pub name: String,
    /// Arbitrary caller payload, opaque to the bus
    pub fields: Map<String, Value>,
    /// Routing control
    pub header: Header,
}

impl Envelope {
    /// Create an envelope for the given event name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty(), "envelope requires an event name");
        Self {
            name,
            fields: Map::new(),
            header: Header::default(),
        }
    }

    /// Builder-style payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Look up a payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The correlated answer carried by a reply envelope, `Null` if absent.
    pub fn reply_value(&self) -> Value {
        self.fields.get(REPLY_FIELD).cloned().unwrap_or(Value::Null)
    }

    /// Classify for routing. The header invariant (a query always carries a
    /// trap id) is checked here because every router path funnels through
    /// classification.
    pub fn classify(&self) -> Class {
        debug_assert!(
            !self.header.query || self.header.trap.is_some(),
            "query envelope without a trap id"
        );
        let h = &self.header;
        if h.reply {
            Class::Reply
        } else if let Some(target) = h.relay {
            if h.query {
                Class::RelayQuery(target)
            } else {
                Class::Relay(target)
            }
        } else if h.broadcast {
            Class::Broadcast
        } else if h.query {
            Class::Query
        } else {
            Class::Plain
        }
    }

    /// Copy of this envelope with all routing markers cleared, for handing a
    /// forwarded request to a local query as if it were freshly built.
    pub fn bare(&self) -> Envelope {
        Envelope {
            name: self.name.clone(),
            fields: self.fields.clone(),
            header: Header::default(),
        }
    }

    /// Build the reply to a request: same name and fields, answer under
    /// [`REPLY_FIELD`], reply marker set, and the requester's trap id.
    pub fn reply_to(request: &Envelope, trap: TrapId, value: Value) -> Envelope {
        let mut fields = request.fields.clone();
        fields.insert(REPLY_FIELD.to_string(), value);
        Envelope {
            name: request.name.clone(),
            fields,
            header: Header {
                trap: Some(trap),
                reply: true,
                ..Header::default()
            },
        }
    }
}
