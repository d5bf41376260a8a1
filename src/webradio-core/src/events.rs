//! Event payloads distributed to consumers.
//!
//! Events serialize as `{"type": <tag>, "value": <payload>}`, which is the
//! shape web and CLI consumers receive.

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A single immutable notification from a producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Event {
    /// Playback (re)started; carries the loaded resource.
    Play(String),
    /// Playback paused; carries the loaded resource.
    Pause(String),
    /// Playback of `name` ended, either naturally or through `stop`.
    Eof {
        name: String,
        /// Whether the consumer should advance to the next item.
        #[serde(rename = "last")]
        advance_on_end: bool,
    },
    VolSet(u8),
    /// Stream title announced by an ICY stream.
    IcyMeta(String),
    /// Station name announced by an ICY stream.
    IcyName(String),
    /// Position snapshot as a fraction of the total length.
    Sample { elapsed: f64, paused: bool },
    /// Application version announced at start-up.
    Version(String),
    /// Periodic heartbeat carrying the wall-clock time as text.
    KeepAlive(String),
}

impl Event {
    /// Wire tag of the event, as found in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Play(_) => "play",
            Event::Pause(_) => "pause",
            Event::Eof { .. } => "eof",
            Event::VolSet(_) => "vol_set",
            Event::IcyMeta(_) => "icy_meta",
            Event::IcyName(_) => "icy_name",
            Event::Sample { .. } => "sample",
            Event::Version(_) => "version",
            Event::KeepAlive(_) => "keep_alive",
        }
    }
}

/// What a consumer queue carries: shared events, then one terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    Event(Arc<Event>),
    Terminated,
}

impl BusMessage {
    pub fn event(&self) -> Option<&Event> {
        match self {
            BusMessage::Event(event) => Some(event),
            BusMessage::Terminated => None,
        }
    }
}

/// Cheap, cloneable producer handle onto an ingress queue.
///
/// Publishing never blocks and never fails; events pushed after the
/// receiving side is gone are dropped.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: Sender<Event>,
}

impl EventPublisher {
    pub fn new(tx: Sender<Event>) -> Self {
        Self { tx }
    }

    pub fn publish(&self, event: Event) {
        let kind = event.kind();
        if self.tx.send(event).is_err() {
            tracing::debug!(kind, "event dropped; ingress queue is closed");
        }
    }
}
