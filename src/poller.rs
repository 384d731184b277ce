// MIT License - Copyright (c) 2026 Peter Wright
// Post-login resync and periodic static reads

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use crate::dispatcher::CallDispatcher;
use crate::error::{BridgeError, Result};
use crate::event::{SessionEvent, SessionEventSender, Source};
use crate::protocol::{READ_TYPES, REALTIME_TYPES, Request, check_result, value_to_string};
use crate::router::{ReconcilerInput, ReconcilerSender, split_events};
use crate::session::SessionState;

/// What the resync task and the pollers need to talk to the panel.
#[derive(Clone)]
pub(crate) struct PollContext {
    pub dispatcher: Arc<CallDispatcher>,
    pub reconciler: ReconcilerSender,
    pub events: SessionEventSender,
    pub pin: String,
}

impl PollContext {
    /// Issue a read and feed its reply to the reconciler as static-read data.
    ///
    /// Returns the number of domain events forwarded.
    pub async fn read_into_snapshot(&self, request: &Request, baseline: bool) -> Result<usize> {
        let reply = self.dispatcher.call(request).await?;
        check_result(request, &reply, self.dispatcher.sender())?;
        // The reply's own sequence number orders it against realtime pushes
        let events = split_events(
            &reply,
            self.dispatcher.sender(),
            reply.seq,
            Utc::now(),
            Source::StaticRead,
            baseline,
        );
        let count = events.len();
        for event in events {
            self.reconciler
                .send(ReconcilerInput::Event(event))
                .map_err(|_| BridgeError::ChannelClosed)?;
        }
        Ok(count)
    }

    pub async fn system_version(&self) -> Result<Value> {
        let request = Request::system_version();
        let reply = self.dispatcher.call(&request).await?;
        check_result(&request, &reply, self.dispatcher.sender())?;
        Ok(reply.payload)
    }

    /// Re-read everything after a (re)login and register for pushes.
    pub async fn resync(&self) -> Result<()> {
        match self.system_version().await {
            Ok(version) => {
                let _ = self.events.send(SessionEvent::SystemVersion(version));
            }
            Err(e) if e.is_call_outcome() => warn!("SYSTEM_VERSION failed: {}", e),
            Err(e) => return Err(e),
        }

        let read = self.read_into_snapshot(&Request::read_multi(READ_TYPES), true).await?;
        // Registration replies with the current status of every type
        let registered = self
            .read_into_snapshot(&Request::realtime_register(REALTIME_TYPES), true)
            .await?;
        info!("resync complete ({} static sections, {} status sections)", read, registered);
        let _ = self.events.send(SessionEvent::Resynced);
        Ok(())
    }
}

/// Runs a resync every time the session becomes Ready.
pub(crate) async fn run_resync(
    ctx: PollContext,
    mut session_events: broadcast::Receiver<SessionEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let event = tokio::select! {
            event = session_events.recv() => event,
            _ = wait_shutdown(&mut shutdown) => break,
        };
        match event {
            Ok(SessionEvent::Ready { .. }) => {}
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Cannot tell whether a Ready was among them
                warn!("resync lagged {} session events, resyncing", skipped);
                if ctx.dispatcher.state() != SessionState::Ready {
                    continue;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }

        tokio::select! {
            result = ctx.resync() => {
                if let Err(e) = result {
                    warn!("resync failed: {}", e);
                }
            }
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }
    debug!("resync task stopped");
}

/// One kind of periodic read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollJob {
    Zones,
    Schedulers,
    Thermostats,
    Logs { window: u32 },
}

impl PollJob {
    fn name(&self) -> &'static str {
        match self {
            PollJob::Zones => "zones",
            PollJob::Schedulers => "schedulers",
            PollJob::Thermostats => "thermostats",
            PollJob::Logs { .. } => "logs",
        }
    }

    async fn run_once(&self, ctx: &PollContext, cursor: &mut LogCursor) -> Result<()> {
        match self {
            PollJob::Zones => {
                ctx.read_into_snapshot(&Request::read_multi(&["ZONES"]), false).await?;
            }
            PollJob::Schedulers => {
                ctx.read_into_snapshot(
                    &Request::read_multi(&["CFG_SCHEDULER_TIMERS", "CFG_HOLIDAYS"]),
                    false,
                )
                .await?;
            }
            PollJob::Thermostats => {
                ctx.read_into_snapshot(&Request::read_thermostat_config(Some(&ctx.pin)), false)
                    .await?;
            }
            PollJob::Logs { window } => {
                let entries = fetch_logs(&ctx.dispatcher, *window).await?;
                let fresh = cursor.advance(&entries, *window);
                if !fresh.is_empty() {
                    debug!("{} new log entries", fresh.len());
                    let _ = ctx.events.send(SessionEvent::Logs(fresh));
                }
            }
        }
        Ok(())
    }
}

/// Fetch the last `items` event-log entries.
pub(crate) async fn fetch_logs(dispatcher: &CallDispatcher, items: u32) -> Result<Vec<Value>> {
    let request = Request::last_logs(items);
    let reply = dispatcher.call(&request).await?;
    check_result(&request, &reply, dispatcher.sender())?;
    Ok(match reply.payload.get("LOGS") {
        Some(Value::Array(list)) => list.clone(),
        _ => Vec::new(),
    })
}

fn log_id(entry: &Value) -> Option<u64> {
    value_to_string(entry.get("ID")?).trim().parse().ok()
}

/// Highest log ID already emitted.
#[derive(Debug, Default)]
pub(crate) struct LogCursor {
    last_id: Option<u64>,
}

impl LogCursor {
    /// Entries newer than the cursor, oldest first. Moves the cursor.
    pub fn advance(&mut self, entries: &[Value], window: u32) -> Vec<Value> {
        let ids: Vec<u64> = entries.iter().filter_map(log_id).collect();
        let (Some(min), Some(max)) = (ids.iter().min().copied(), ids.iter().max().copied()) else {
            return Vec::new();
        };
        if let Some(last) = self.last_id
            && last < min
            && max - last >= u64::from(window)
        {
            warn!(
                "log window too small: last seen {}, fetched {}..{} ({} items), entries may be missed",
                last, min, max, window
            );
        }

        let mut fresh: Vec<(u64, Value)> = entries
            .iter()
            .filter_map(|e| log_id(e).map(|id| (id, e)))
            .filter(|(id, _)| self.last_id.is_none_or(|last| *id > last))
            .map(|(id, e)| (id, e.clone()))
            .collect();
        fresh.sort_by_key(|(id, _)| *id);
        self.last_id = Some(self.last_id.map_or(max, |last| last.max(max)));
        fresh.into_iter().map(|(_, e)| e).collect()
    }
}

/// Run `job` every `interval` while the session is Ready.
pub(crate) async fn run_poller(
    ctx: PollContext,
    job: PollJob,
    interval: Duration,
    mut state: watch::Receiver<SessionState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut cursor = LogCursor::default();
    loop {
        let ready = tokio::select! {
            ready = until_ready(&mut state) => ready,
            _ = wait_shutdown(&mut shutdown) => break,
        };
        if !ready {
            break;
        }

        let outcome = tokio::select! {
            outcome = job.run_once(&ctx, &mut cursor) => outcome,
            _ = wait_shutdown(&mut shutdown) => break,
        };
        match outcome {
            Ok(()) => {}
            Err(BridgeError::ConnectionLost) => debug!("{} poll skipped: session lost", job.name()),
            Err(e) => warn!("{} poll failed: {}", job.name(), e),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = wait_shutdown(&mut shutdown) => break,
        }
    }
    debug!("{} poller stopped", job.name());
}

async fn until_ready(state: &mut watch::Receiver<SessionState>) -> bool {
    state.wait_for(|s| *s == SessionState::Ready).await.is_ok()
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::protocol::Frame;
    use crate::router::EventRouter;
    use crate::session::SessionLink;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn logs(ids: &[u64]) -> Vec<Value> {
        ids.iter().map(|id| json!({"ID": id.to_string(), "TYPE": "ZALARM"})).collect()
    }

    #[test]
    fn test_log_cursor_emits_only_new_ids() {
        let mut cursor = LogCursor::default();
        let first = cursor.advance(&logs(&[3, 1, 2]), 500);
        let ids: Vec<u64> = first.iter().filter_map(log_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        let second = cursor.advance(&logs(&[2, 3, 4, 5]), 500);
        let ids: Vec<u64> = second.iter().filter_map(log_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert!(cursor.advance(&logs(&[4, 5]), 500).is_empty());
    }

    #[test]
    fn test_log_cursor_ignores_entries_without_id() {
        let mut cursor = LogCursor::default();
        let entries = vec![json!({"TYPE": "X"}), json!({"ID": "x"}), json!({"ID": 7})];
        assert_eq!(cursor.advance(&entries, 10).len(), 1);
        assert!(cursor.advance(&[], 10).is_empty());
    }

    #[tokio::test]
    async fn test_read_into_snapshot_uses_reply_seq() {
        let (link, mut harness) = SessionLink::harness(SessionState::Ready);
        let dispatcher = Arc::new(CallDispatcher::new(link, "HomeAssistant", Duration::from_secs(5), true));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let router = EventRouter::new(dispatcher.clone(), tx.clone(), false, "HomeAssistant");
        let ctx = PollContext {
            dispatcher,
            reconciler: tx,
            events: crate::event::session_event_channel(8),
            pin: "1234".to_string(),
        };

        let read = tokio::spawn(async move {
            ctx.read_into_snapshot(&Request::read_multi(&["ZONES"]), true).await
        });
        let sent = Frame::parse(&harness.next_sent().await, false).unwrap();
        router.route(r#"{"CMD":"REALTIME","PAYLOAD":{"STATUS_ZONES":[{"ID":"1","STA":"A"}]}}"#);
        let reply = json!({
            "CMD": "READ_RES",
            "ID": sent.id.unwrap(),
            "PAYLOAD": {"RESULT": "OK", "ZONES": [{"ID": "1", "DES": "Door"}]}
        });
        router.route(&reply.to_string());
        assert_eq!(read.await.unwrap().unwrap(), 1);

        let mut seen = Vec::new();
        while let Ok(ReconcilerInput::Event(ev)) = rx.try_recv() {
            seen.push((ev.domain, ev.seq, ev.baseline));
        }
        assert_eq!(seen, vec![(Domain::Zones, 1, false), (Domain::Zones, 2, true)]);
    }

    #[tokio::test]
    async fn test_poller_idles_until_ready_and_stops_on_shutdown() {
        let (link, mut harness) = SessionLink::harness(SessionState::Connecting);
        let dispatcher = Arc::new(CallDispatcher::new(link, "HA", Duration::from_secs(5), true));
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = PollContext {
            dispatcher: dispatcher.clone(),
            reconciler: tx,
            events: crate::event::session_event_channel(8),
            pin: String::new(),
        };
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(run_poller(ctx, PollJob::Zones, Duration::from_secs(5), state_rx, stop_rx));

        tokio::task::yield_now().await;
        assert_eq!(dispatcher.pending_count(), 0);

        harness.set_state(SessionState::Ready);
        state_tx.send_replace(SessionState::Ready);
        let sent = Frame::parse(&harness.next_sent().await, false).unwrap();
        assert_eq!(sent.payload["TYPES"], json!(["ZONES"]));

        stop_tx.send_replace(true);
        poller.await.unwrap();
    }
}
