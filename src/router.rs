// MIT License - Copyright (c) 2026 Peter Wright
// Inbound frame classification: pending-call replies vs unsolicited events

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::dispatcher::CallDispatcher;
use crate::domain::Domain;
use crate::event::{RealtimeEvent, Source};
use crate::protocol::Frame;

/// Input to the state reconciler.
#[derive(Debug, Clone)]
pub enum ReconcilerInput {
    Event(RealtimeEvent),
    /// Unsolicited frame with no entity data (late replies, unknown pushes)
    Unrouted(Frame),
}

pub type ReconcilerSender = mpsc::UnboundedSender<ReconcilerInput>;
pub type ReconcilerReceiver = mpsc::UnboundedReceiver<ReconcilerInput>;

/// What the router did with a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Resolved a pending call
    Reply,
    /// Forwarded this many domain events to the reconciler
    Events(usize),
    /// Forwarded to the reconciler's default handling
    Unrouted,
    /// Malformed or failed CRC
    Dropped,
}

/// Classifies every inbound frame, in arrival order.
pub struct EventRouter {
    dispatcher: Arc<CallDispatcher>,
    reconciler: ReconcilerSender,
    seq: AtomicU64,
    verify_crc: bool,
    sender: String,
}

impl EventRouter {
    pub fn new(
        dispatcher: Arc<CallDispatcher>,
        reconciler: ReconcilerSender,
        verify_crc: bool,
        sender: impl Into<String>,
    ) -> Self {
        Self {
            dispatcher,
            reconciler,
            seq: AtomicU64::new(0),
            verify_crc,
            sender: sender.into(),
        }
    }

    /// Sequence number of the most recently routed frame.
    pub fn current_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Route one inbound text frame. Never blocks.
    pub fn route(&self, text: &str) -> Routed {
        let mut frame = match Frame::parse(text, self.verify_crc) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping inbound frame: {}", e);
                trace!("dropped frame: {}", text);
                return Routed::Dropped;
            }
        };
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        frame.seq = seq;

        let Some(frame) = self.dispatcher.resolve(frame) else {
            return Routed::Reply;
        };

        let source = if frame.cmd == "REALTIME" {
            Source::Realtime
        } else {
            Source::StaticRead
        };
        let events = split_events(&frame, &self.sender, seq, Utc::now(), source, false);
        if events.is_empty() {
            debug!("unsolicited {} frame without entity data", frame.cmd);
            self.forward(ReconcilerInput::Unrouted(frame));
            return Routed::Unrouted;
        }

        let count = events.len();
        for event in events {
            self.forward(ReconcilerInput::Event(event));
        }
        Routed::Events(count)
    }

    fn forward(&self, input: ReconcilerInput) {
        if self.reconciler.send(input).is_err() {
            warn!("state reconciler is gone, dropping event");
        }
    }
}

/// The object holding domain sections: the payload root, or the receiver
/// object realtime pushes are wrapped in.
fn sections<'a>(payload: &'a Value, sender: &str) -> Option<&'a Map<String, Value>> {
    let root = payload.as_object()?;
    if root.keys().any(|k| Domain::from_payload_key(k).is_some()) {
        return Some(root);
    }
    root.get(sender)
        .or_else(|| root.values().next())
        .and_then(Value::as_object)
}

/// Split a frame's payload into one event per domain section.
pub fn split_events(
    frame: &Frame,
    sender: &str,
    seq: u64,
    received_at: DateTime<Utc>,
    source: Source,
    baseline: bool,
) -> Vec<RealtimeEvent> {
    let Some(sections) = sections(&frame.payload, sender) else {
        return Vec::new();
    };
    sections
        .iter()
        .filter(|(key, _)| !(key.as_str() == "PARTITIONS" && sections.contains_key("STATUS_PARTITIONS")))
        .filter_map(|(key, value)| {
            let domain = Domain::from_payload_key(key)?;
            Some(RealtimeEvent {
                domain,
                entries: value.clone(),
                received_at,
                seq,
                source,
                baseline,
            })
        })
        .collect()
}
