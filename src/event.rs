// MIT License - Copyright (c) 2026 Peter Wright
// Change notifications and session events

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::warn;

use crate::domain::Domain;
use crate::session::SessionState;

/// Where the data behind a record's last_seen came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Unsolicited push from the panel
    Realtime,
    /// Reply to a READ (resync or poller)
    StaticRead,
    /// Loaded from the last-seen store at startup
    Persisted,
}

/// A domain-tagged batch of raw entity fields, as it came off the wire.
#[derive(Debug, Clone)]
pub struct RealtimeEvent {
    pub domain: Domain,
    /// Object or list of objects, each carrying an `ID`
    pub entries: Value,
    pub received_at: DateTime<Utc>,
    /// Router sequence number of the frame this came from
    pub seq: u64,
    pub source: Source,
    /// Resync data: merge silently, never advance last_seen
    pub baseline: bool,
}

/// Emitted when an entity's meaningful fields change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNotification {
    pub domain: Domain,
    pub id: String,
    /// Names of the meaningful fields that changed
    pub changed: Vec<String>,
    /// Full record after the merge
    pub fields: Map<String, Value>,
    pub last_seen: DateTime<Utc>,
    pub source: Source,
}

/// Session-level events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Login accepted; carries the panel's ID_LOGIN
    Ready { login_id: String },
    /// Static configuration and realtime registration done after Ready
    Resynced,
    /// Panel reply to SYSTEM_VERSION
    SystemVersion(Value),
    /// New event-log entries, oldest first
    Logs(Vec<Value>),
}

pub type NotificationSender = broadcast::Sender<ChangeNotification>;
pub type SessionEventSender = broadcast::Sender<SessionEvent>;
pub type SessionEventReceiver = broadcast::Receiver<SessionEvent>;

/// An independent cursor over one domain's change notifications.
///
/// Each subscriber sees every notification published after it subscribed,
/// regardless of how fast other subscribers read.
#[derive(Debug)]
pub struct Subscription {
    domain: Domain,
    rx: broadcast::Receiver<ChangeNotification>,
}

impl Subscription {
    pub(crate) fn new(domain: Domain, rx: broadcast::Receiver<ChangeNotification>) -> Self {
        Self { domain, rx }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Next notification, or `None` once the manager is gone.
    ///
    /// A subscriber that falls behind skips the oldest notifications and
    /// carries on from the oldest one still buffered.
    pub async fn next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("{} subscriber lagged, skipped {} notifications", self.domain, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`next`](Self::next).
    pub fn try_next(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.try_recv() {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!("{} subscriber lagged, skipped {} notifications", self.domain, skipped);
                }
                Err(_) => return None,
            }
        }
    }
}

/// Create a session event channel with the given capacity.
pub fn session_event_channel(capacity: usize) -> SessionEventSender {
    broadcast::channel(capacity).0
}
