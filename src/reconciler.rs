// MIT License - Copyright (c) 2026 Peter Wright
// Canonical entity snapshot and the single task that mutates it

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::{RwLock, broadcast, watch};
use tracing::{debug, trace, warn};

use crate::domain::{Domain, normalize_id};
use crate::event::{ChangeNotification, NotificationSender, RealtimeEvent, Source, Subscription};
use crate::last_seen::LastSeenStore;
use crate::router::{ReconcilerInput, ReconcilerReceiver};

/// When an entity last produced a meaningful change, and how we learned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastSeen {
    pub at: DateTime<Utc>,
    pub source: Source,
}

/// Current reconciled state of one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    pub id: String,
    pub domain: Domain,
    pub fields: Map<String, Value>,
    pub last_seen: Option<LastSeen>,
    /// Fields changed silently since the last notification
    pub dirty: bool,
    /// Sequence number of the newest frame merged into this record
    pub seq: u64,
}

impl EntityRecord {
    fn new(domain: Domain, id: String) -> Self {
        Self {
            id,
            domain,
            fields: Map::new(),
            last_seen: None,
            dirty: false,
            seq: 0,
        }
    }
}

/// Immutable copy of one domain, taken at a single snapshot version.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainSnapshot {
    pub domain: Domain,
    pub version: u64,
    pub records: BTreeMap<String, EntityRecord>,
}

impl DomainSnapshot {
    pub fn get(&self, id: &str) -> Option<&EntityRecord> {
        self.records.get(id)
    }
}

/// All known entities, keyed by domain then normalized id.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
    domains: HashMap<Domain, BTreeMap<String, EntityRecord>>,
    version: u64,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn domain(&self, domain: Domain) -> DomainSnapshot {
        DomainSnapshot {
            domain,
            version: self.version,
            records: self.domains.get(&domain).cloned().unwrap_or_default(),
        }
    }

    pub fn get(&self, domain: Domain, id: &str) -> Option<&EntityRecord> {
        self.domains.get(&domain)?.get(id)
    }

    /// Seed a persisted last_seen, before any event is applied.
    ///
    /// Never moves an existing last_seen backwards.
    pub fn seed(&mut self, domain: Domain, id: &str, at: DateTime<Utc>) {
        let Some(id) = normalize_id(&Value::String(id.to_string())) else {
            return;
        };
        let record = self
            .domains
            .entry(domain)
            .or_default()
            .entry(id.clone())
            .or_insert_with(|| EntityRecord::new(domain, id));
        if record.last_seen.is_none_or(|seen| seen.at < at) {
            record.last_seen = Some(LastSeen {
                at,
                source: Source::Persisted,
            });
        }
    }

    /// Merge one event, returning a notification per meaningful change.
    pub fn apply(&mut self, event: &RealtimeEvent) -> Vec<ChangeNotification> {
        let items: Vec<&Map<String, Value>> = match &event.entries {
            Value::Object(obj) => vec![obj],
            Value::Array(list) => list.iter().filter_map(Value::as_object).collect(),
            Value::Null => Vec::new(),
            other => {
                warn!("{}: ignoring non-object payload {}", event.domain, other);
                return Vec::new();
            }
        };
        let single = items.len() == 1;

        let mut notifications = Vec::new();
        let mut touched = false;
        for item in items {
            let id = match item.get("ID").and_then(normalize_id) {
                Some(id) => id,
                // Singleton sections (e.g. STATUS_CONNECTION) carry no ID
                None if single && !item.contains_key("ID") => "0".to_string(),
                None => {
                    debug!("{}: entry without usable ID skipped", event.domain);
                    continue;
                }
            };
            let (changed, notification) = self.merge(event, id, item);
            touched |= changed;
            notifications.extend(notification);
        }
        if touched {
            self.version += 1;
        }
        notifications
    }

    fn merge(
        &mut self,
        event: &RealtimeEvent,
        id: String,
        item: &Map<String, Value>,
    ) -> (bool, Option<ChangeNotification>) {
        let domain = event.domain;
        let record = self
            .domains
            .entry(domain)
            .or_default()
            .entry(id.clone())
            .or_insert_with(|| EntityRecord::new(domain, id));

        // Older than what we already hold: only fill gaps
        if event.seq < record.seq {
            let mut filled = false;
            for (key, value) in item {
                if !record.fields.contains_key(key) {
                    record.fields.insert(key.clone(), value.clone());
                    filled = true;
                }
            }
            if filled {
                record.dirty = true;
                trace!("{}/{}: stale data filled missing fields", domain, record.id);
            }
            return (filled, None);
        }

        let mut any_change = false;
        let mut meaningful = Vec::new();
        for (key, value) in item {
            if record.fields.get(key) == Some(value) {
                continue;
            }
            any_change = true;
            if key != "ID" && domain.is_meaningful(key) {
                meaningful.push(key.clone());
            }
            record.fields.insert(key.clone(), value.clone());
        }
        record.seq = record.seq.max(event.seq);

        if event.baseline || meaningful.is_empty() {
            if any_change {
                record.dirty = true;
            }
            return (any_change, None);
        }

        let at = match record.last_seen {
            Some(seen) if seen.at > event.received_at => seen.at,
            _ => event.received_at,
        };
        record.last_seen = Some(LastSeen {
            at,
            source: event.source,
        });
        record.dirty = false;

        let notification = ChangeNotification {
            domain,
            id: record.id.clone(),
            changed: meaningful,
            fields: record.fields.clone(),
            last_seen: at,
            source: event.source,
        };
        (true, Some(notification))
    }
}

/// Per-domain broadcast channels for change notifications.
#[derive(Debug)]
pub struct NotificationHub {
    channels: HashMap<Domain, NotificationSender>,
}

impl NotificationHub {
    pub fn new(capacity: usize) -> Self {
        let channels = Domain::ALL
            .iter()
            .map(|d| (*d, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { channels }
    }

    pub fn subscribe(&self, domain: Domain) -> Subscription {
        let rx = match self.channels.get(&domain) {
            Some(tx) => tx.subscribe(),
            // every domain has a channel; keep the type total anyway
            None => broadcast::channel(1).1,
        };
        Subscription::new(domain, rx)
    }

    fn publish(&self, notification: ChangeNotification) {
        if let Some(tx) = self.channels.get(&notification.domain) {
            // No subscribers is fine
            let _ = tx.send(notification);
        }
    }
}

/// The only writer of the snapshot.
pub struct StateReconciler {
    snapshot: Arc<RwLock<Snapshot>>,
    hub: Arc<NotificationHub>,
    last_seen: Option<Arc<LastSeenStore>>,
}

impl StateReconciler {
    pub fn new(
        snapshot: Arc<RwLock<Snapshot>>,
        hub: Arc<NotificationHub>,
        last_seen: Option<Arc<LastSeenStore>>,
    ) -> Self {
        Self {
            snapshot,
            hub,
            last_seen,
        }
    }

    /// Apply one event and fan out its notifications.
    pub async fn apply(&self, event: &RealtimeEvent) -> Vec<ChangeNotification> {
        let notifications = self.snapshot.write().await.apply(event);
        for notification in &notifications {
            debug!(
                "{}/{} changed: {:?}",
                notification.domain, notification.id, notification.changed
            );
            if let Some(store) = &self.last_seen {
                store.mark_dirty(notification.domain, &notification.id, notification.last_seen);
            }
            self.hub.publish(notification.clone());
        }
        notifications
    }

    fn handle_unrouted(&self, frame: &crate::protocol::Frame) {
        debug!(
            "unhandled {} frame (ID {:?}, type {:?})",
            frame.cmd, frame.id, frame.payload_type
        );
    }

    /// Consume routed input until `stop` flips, then drain what is queued.
    pub async fn run(self, mut input: ReconcilerReceiver, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                item = input.recv() => match item {
                    Some(ReconcilerInput::Event(event)) => {
                        self.apply(&event).await;
                    }
                    Some(ReconcilerInput::Unrouted(frame)) => self.handle_unrouted(&frame),
                    None => break,
                },
                _ = stopped(&mut stop) => {
                    while let Ok(item) = input.try_recv() {
                        match item {
                            ReconcilerInput::Event(event) => {
                                self.apply(&event).await;
                            }
                            ReconcilerInput::Unrouted(frame) => self.handle_unrouted(&frame),
                        }
                    }
                    break;
                }
            }
        }
        debug!("state reconciler stopped");
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn event(domain: Domain, entries: Value, seq: u64, at: DateTime<Utc>) -> RealtimeEvent {
        RealtimeEvent {
            domain,
            entries,
            received_at: at,
            seq,
            source: Source::Realtime,
            baseline: false,
        }
    }

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_padded_and_plain_ids_collapse() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Zones, json!([{"ID": "007", "STA": "R"}]), 1, ts(0)));
        snap.apply(&event(Domain::Zones, json!([{"ID": 7, "BYP": "NO"}]), 2, ts(1)));

        let zones = snap.domain(Domain::Zones);
        assert_eq!(zones.records.len(), 1);
        let zone = zones.get("7").unwrap();
        assert_eq!(zone.fields["STA"], "R");
        assert_eq!(zone.fields["BYP"], "NO");
    }

    #[test]
    fn test_repeated_event_notifies_once() {
        let mut snap = Snapshot::default();
        let ev = event(Domain::Outputs, json!([{"ID": "1", "STA": "ON"}]), 1, ts(0));
        assert_eq!(snap.apply(&ev).len(), 1);

        let again = event(Domain::Outputs, json!([{"ID": "1", "STA": "ON"}]), 2, ts(10));
        assert!(snap.apply(&again).is_empty());
        assert_eq!(snap.get(Domain::Outputs, "1").unwrap().last_seen.unwrap().at, ts(0));
    }

    #[test]
    fn test_single_object_same_as_list() {
        let mut a = Snapshot::default();
        let mut b = Snapshot::default();
        let na = a.apply(&event(Domain::Zones, json!({"ID": "3", "STA": "A"}), 1, ts(0)));
        let nb = b.apply(&event(Domain::Zones, json!([{"ID": "3", "STA": "A"}]), 1, ts(0)));
        assert_eq!(na, nb);
        assert_eq!(a.domain(Domain::Zones).records, b.domain(Domain::Zones).records);
    }

    #[test]
    fn test_partial_update_preserves_fields() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "R", "DES": "Door"}]), 1, ts(0)));
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "A"}]), 2, ts(1)));
        let zone = snap.get(Domain::Zones, "1").unwrap();
        assert_eq!(zone.fields["STA"], "A");
        assert_eq!(zone.fields["DES"], "Door");
    }

    #[test]
    fn test_non_meaningful_change_is_silent() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "R"}]), 1, ts(0)));
        let notes = snap.apply(&event(Domain::Zones, json!([{"ID": "1", "DES": "Hall"}]), 2, ts(5)));
        assert!(notes.is_empty());
        let zone = snap.get(Domain::Zones, "1").unwrap();
        assert_eq!(zone.fields["DES"], "Hall");
        assert!(zone.dirty);
        assert_eq!(zone.last_seen.unwrap().at, ts(0));
    }

    #[test]
    fn test_last_seen_never_regresses_below_seed() {
        let mut snap = Snapshot::default();
        snap.seed(Domain::Zones, "01", ts(100));
        let notes = snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "A"}]), 1, ts(50)));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].last_seen, ts(100));
        let seen = snap.get(Domain::Zones, "1").unwrap().last_seen.unwrap();
        assert_eq!(seen.at, ts(100));
        assert_eq!(seen.source, Source::Realtime);

        let later = snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "R"}]), 2, ts(200)));
        assert_eq!(later[0].last_seen, ts(200));
    }

    #[test]
    fn test_baseline_merges_without_last_seen() {
        let mut snap = Snapshot::default();
        let mut ev = event(Domain::Partitions, json!([{"ID": "1", "ARM": "D"}]), 1, ts(0));
        ev.baseline = true;
        ev.source = Source::StaticRead;
        assert!(snap.apply(&ev).is_empty());
        let part = snap.get(Domain::Partitions, "1").unwrap();
        assert_eq!(part.fields["ARM"], "D");
        assert!(part.last_seen.is_none());
    }

    #[test]
    fn test_stale_data_only_fills_missing_fields() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "A"}]), 5, ts(1)));
        let mut stale = event(Domain::Zones, json!([{"ID": "1", "STA": "R", "DES": "Door"}]), 3, ts(0));
        stale.baseline = true;
        assert!(snap.apply(&stale).is_empty());
        let zone = snap.get(Domain::Zones, "1").unwrap();
        assert_eq!(zone.fields["STA"], "A");
        assert_eq!(zone.fields["DES"], "Door");
    }

    #[test]
    fn test_every_field_meaningful_for_unlisted_domains() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Connection, json!({"INET": "OK"}), 1, ts(0)));
        let notes = snap.apply(&event(Domain::Connection, json!({"INET": "KO"}), 2, ts(1)));
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].id, "0");
        assert_eq!(notes[0].changed, vec!["INET".to_string()]);
    }

    #[test]
    fn test_version_and_copy_on_read() {
        let mut snap = Snapshot::default();
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "R"}]), 1, ts(0)));
        let before = snap.domain(Domain::Zones);
        snap.apply(&event(Domain::Zones, json!([{"ID": "1", "STA": "A"}]), 2, ts(1)));
        assert_eq!(before.get("1").unwrap().fields["STA"], "R");
        assert!(snap.version() > before.version);
    }

    #[test]
    fn test_entries_without_id_in_lists_skipped() {
        let mut snap = Snapshot::default();
        let notes = snap.apply(&event(Domain::Zones, json!([{"STA": "A"}, {"ID": "2", "STA": "A"}]), 1, ts(0)));
        assert_eq!(notes.len(), 1);
        assert_eq!(snap.domain(Domain::Zones).records.len(), 1);
    }

    #[tokio::test]
    async fn test_reconciler_publishes_to_subscribers() {
        let hub = Arc::new(NotificationHub::new(8));
        let mut zones = hub.subscribe(Domain::Zones);
        let mut outputs = hub.subscribe(Domain::Outputs);
        let reconciler = StateReconciler::new(Arc::new(RwLock::new(Snapshot::default())), hub.clone(), None);

        reconciler
            .apply(&event(Domain::Zones, json!([{"ID": "4", "STA": "A"}]), 1, ts(0)))
            .await;
        assert_eq!(zones.try_next().unwrap().id, "4");
        assert!(outputs.try_next().is_none());
    }

    #[tokio::test]
    async fn test_run_drains_queue_on_stop() {
        let hub = Arc::new(NotificationHub::new(8));
        let snapshot = Arc::new(RwLock::new(Snapshot::default()));
        let reconciler = StateReconciler::new(snapshot.clone(), hub, None);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        for seq in 1..=3 {
            tx.send(ReconcilerInput::Event(event(
                Domain::Zones,
                json!([{"ID": seq.to_string(), "STA": "A"}]),
                seq,
                ts(0),
            )))
            .unwrap();
        }
        stop_tx.send_replace(true);
        reconciler.run(rx, stop_rx).await;
        assert_eq!(snapshot.read().await.domain(Domain::Zones).records.len(), 3);
    }
}
