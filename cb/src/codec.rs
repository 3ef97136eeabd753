//! Wire codec for envelopes
//!
//! One JSON object per message: user fields flattened beside `#`-prefixed
//! reserved control keys. The codec is the only place that touches the wire
//! shape; everything above it works with the structured [`Envelope`].
//!
//! Reserved keys are authoritative here: a user field that tries to smuggle a
//! `#` key is dropped on encode, and an unknown `#` key coming off the wire is
//! stripped on decode, so payload data can never forge routing metadata.

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::envelope::{Envelope, Header, TrapId, WorkerId};

/// Reserved wire keys carrying the routing header.
pub mod keys {
    /// Correlation id (`u64`), present iff part of a query/reply exchange
    pub const TRAP: &str = "#Trap";
    /// Origin worker id (`u32`), worker-to-host direction
    pub const WORKER: &str = "#Worker";
    /// Sender expects a reply
    pub const QUERY: &str = "#IpcQuery";
    /// This envelope is the reply; the answer rides in `fields["reply"]`
    pub const REPLY: &str = "#IpcReply";
    /// Host should forward to this worker id (`u32`)
    pub const RELAY: &str = "#Relay";
    /// Host should fan out to all other workers
    pub const BROADCAST: &str = "#Broadcast";
}

/// Key holding the event name on the wire.
const NAME_KEY: &str = "name";

/// Errors from envelope encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("wire message is not a JSON object")]
    NotAnObject,

    #[error("wire message has no event name")]
    MissingName,

    #[error("control field {key} has the wrong type")]
    BadControlField { key: &'static str },

    #[error("query envelope carries no {}", keys::TRAP)]
    QueryWithoutTrap,
}

/// Serialize an envelope to its wire bytes (no trailing newline).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    debug_assert!(
        !envelope.header.query || envelope.header.trap.is_some(),
        "query envelope without a trap id"
    );

    let mut obj = Map::with_capacity(envelope.fields.len() + 7);
    obj.insert(NAME_KEY.to_string(), Value::String(envelope.name.clone()));

    for (key, value) in &envelope.fields {
        if key.starts_with('#') {
            warn!(%key, name = %envelope.name, "dropping payload field with reserved prefix");
            continue;
        }
        if key == NAME_KEY {
            continue;
        }
        obj.insert(key.clone(), value.clone());
    }

    let h = &envelope.header;
    if let Some(trap) = h.trap {
        obj.insert(keys::TRAP.to_string(), Value::from(trap.0));
    }
    if let Some(origin) = h.origin {
        obj.insert(keys::WORKER.to_string(), Value::from(origin.0));
    }
    if h.query {
        obj.insert(keys::QUERY.to_string(), Value::Bool(true));
    }
    if h.reply {
        obj.insert(keys::REPLY.to_string(), Value::Bool(true));
    }
    if let Some(relay) = h.relay {
        obj.insert(keys::RELAY.to_string(), Value::from(relay.0));
    }
    if h.broadcast {
        obj.insert(keys::BROADCAST.to_string(), Value::Bool(true));
    }

    Ok(serde_json::to_vec(&Value::Object(obj))?)
}

/// Parse wire bytes back into an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, CodecError> {
    let value: Value = serde_json::from_slice(bytes)?;
    let Value::Object(mut obj) = value else {
        return Err(CodecError::NotAnObject);
    };

    let name = match obj.remove(NAME_KEY) {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => return Err(CodecError::MissingName),
    };

    let header = Header {
        trap: take_id(&mut obj, keys::TRAP)?.map(TrapId),
        origin: take_worker(&mut obj, keys::WORKER)?,
        query: take_flag(&mut obj, keys::QUERY)?,
        reply: take_flag(&mut obj, keys::REPLY)?,
        relay: take_worker(&mut obj, keys::RELAY)?,
        broadcast: take_flag(&mut obj, keys::BROADCAST)?,
    };

    if header.query && header.trap.is_none() {
        return Err(CodecError::QueryWithoutTrap);
    }

    // Anything else with the reserved prefix is forged or from a newer peer;
    // strip it rather than passing it through as payload.
    obj.retain(|key, _| {
        let keep = !key.starts_with('#');
        if !keep {
            warn!(%key, %name, "stripping unknown reserved key from wire message");
        }
        keep
    });

    Ok(Envelope {
        name,
        fields: obj,
        header,
    })
}

fn take_id(obj: &mut Map<String, Value>, key: &'static str) -> Result<Option<u64>, CodecError> {
    match obj.remove(key) {
        None => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or(CodecError::BadControlField { key }),
    }
}

fn take_worker(
    obj: &mut Map<String, Value>,
    key: &'static str,
) -> Result<Option<WorkerId>, CodecError> {
    match take_id(obj, key)? {
        None => Ok(None),
        Some(id) => u32::try_from(id)
            .map(|id| Some(WorkerId(id)))
            .map_err(|_| CodecError::BadControlField { key }),
    }
}

fn take_flag(obj: &mut Map<String, Value>, key: &'static str) -> Result<bool, CodecError> {
    match obj.remove(key) {
        None => Ok(false),
        Some(Value::Bool(flag)) => Ok(flag),
        Some(_) => Err(CodecError::BadControlField { key }),
    }
}
