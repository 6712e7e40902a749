//! The broadcast bus for long-lived peers.
//!
//! Events travel through a fixed-capacity ring: publishing never blocks,
//! each consumer reads at its own cursor, and a consumer that falls more
//! than the capacity behind observes a gap and re-syncs at the tail.
//! `tokio::sync::broadcast` provides exactly these semantics; this module
//! wraps it with the event carrier and its memoized encodings.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::params::MediaType;
use crate::response::encode_value;

/// Ring capacity of the bus.
pub const BUS_CAPACITY: usize = 256;

/// One broadcast event: origin, topic, payload.
///
/// Encodings are computed lazily and memoized so every subscriber on the
/// same format shares a single serialization.
#[derive(Debug)]
pub struct BusEvent {
    topic: String,
    payload: Value,
    origin: Option<String>,
    json: OnceLock<Option<Bytes>>,
    cbor: OnceLock<Option<Bytes>>,
}

impl BusEvent {
    /// Create an event for a topic. The origin is the request id of the
    /// publishing context, carried for tracing.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Value, origin: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            payload,
            origin,
            json: OnceLock::new(),
            cbor: OnceLock::new(),
        }
    }

    /// The topic subscribers filter on. `*` reaches everyone.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// The payload written to matching subscribers.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// The request id of the publishing context, if known.
    #[must_use]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// The payload encoded in the given media type, memoized per format.
    #[must_use]
    pub fn encoded(&self, media_type: MediaType) -> Option<Bytes> {
        let slot = match media_type {
            MediaType::Json => &self.json,
            MediaType::Cbor => &self.cbor,
        };
        slot.get_or_init(|| encode_value(&self.payload, media_type, false).ok())
            .clone()
    }
}

/// The ring-buffered event queue.
pub struct Bus {
    tx: broadcast::Sender<Arc<BusEvent>>,
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus {
    /// Create a bus with the standard capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(BUS_CAPACITY)
    }

    /// Create a bus with a custom capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Enqueue an event. Never blocks; returns the number of subscribers
    /// that will observe it.
    pub fn publish(&self, event: BusEvent) -> usize {
        self.tx.send(Arc::new(event)).unwrap_or(0)
    }

    /// Open a cursor at the current tail.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<BusEvent>> {
        self.tx.subscribe()
    }
}
