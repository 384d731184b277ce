// MIT License - Copyright (c) 2026 Peter Wright
// Public facade: one panel session, calls, snapshots and subscriptions

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::dispatcher::{CallDispatcher, ReplyMatcher};
use crate::domain::{Domain, normalize_id};
use crate::error::{BridgeError, RejectReason, Result};
use crate::event::{
    RealtimeEvent, SessionEventReceiver, SessionEventSender, Source, Subscription,
    session_event_channel,
};
use crate::last_seen::LastSeenStore;
use crate::poller::{PollContext, PollJob, fetch_logs, run_poller, run_resync};
use crate::protocol::{
    BypassMode, Frame, OutputCommand, PartitionMode, Request, check_result,
    thermostat_write_entry, value_to_string,
};
use crate::reconciler::{DomainSnapshot, EntityRecord, NotificationHub, Snapshot, StateReconciler};
use crate::router::{EventRouter, ReconcilerInput, ReconcilerReceiver, ReconcilerSender};
use crate::session::{ConnectionSupervisor, SessionInfo, SessionLink, SessionState, session_link};
use crate::transport::{Connector, WebSocketConnector};

#[derive(Default)]
struct Tasks {
    workers: Vec<JoinHandle<()>>,
    reconciler: Option<JoinHandle<()>>,
    flusher: Option<JoinHandle<()>>,
}

/// The main public API: owns the panel session and everything fed by it.
///
/// # Example
///
/// ```no_run
/// use lares_bridge::{Domain, SessionConfig, SessionManager};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = SessionConfig::builder()
///         .host("192.168.0.100")
///         .pin("123456")
///         .last_seen_path("/var/lib/lares-bridge/last_seen.json")
///         .build();
///
///     let manager = SessionManager::connect(config)?;
///
///     // Follow zone changes
///     let mut zones = manager.subscribe(Domain::Zones);
///     tokio::spawn(async move {
///         while let Some(change) = zones.next().await {
///             println!("zone {} changed: {:?}", change.id, change.changed);
///         }
///     });
///
///     manager.wait_ready(std::time::Duration::from_secs(30)).await?;
///     manager.arm_partition("1").await?;
///
///     tokio::signal::ctrl_c().await?;
///     manager.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct SessionManager {
    config: SessionConfig,
    link: SessionLink,
    supervisor: Arc<ConnectionSupervisor>,
    dispatcher: Arc<CallDispatcher>,
    snapshot: Arc<RwLock<Snapshot>>,
    hub: Arc<NotificationHub>,
    events: SessionEventSender,
    last_seen: Option<Arc<LastSeenStore>>,
    reconciler_tx: ReconcilerSender,
    reconciler_rx: Mutex<Option<ReconcilerReceiver>>,
    stop_workers: watch::Sender<bool>,
    stop_reconciler: watch::Sender<bool>,
    stop_flusher: watch::Sender<bool>,
    tasks: Mutex<Tasks>,
}

impl SessionManager {
    /// Build a manager over `connector`. Nothing runs until [`start`](Self::start).
    ///
    /// The last-seen store, if configured, is loaded and seeded into the
    /// snapshot here, before any event can be applied.
    pub fn new(config: SessionConfig, connector: Arc<dyn Connector>) -> Self {
        let last_seen = config
            .last_seen_path
            .as_deref()
            .map(|path| Arc::new(load_store(path)));

        let mut snapshot = Snapshot::default();
        if let Some(store) = &last_seen {
            let entries = store.entries();
            debug!("seeding {} last-seen entries", entries.len());
            for (domain, id, at) in entries {
                snapshot.seed(domain, &id, at);
            }
        }

        let (link, control) = session_link();
        let dispatcher = Arc::new(CallDispatcher::new(
            link.clone(),
            config.sender.clone(),
            config.call_timeout,
            config.tolerate_id_mismatch,
        ));
        let (reconciler_tx, reconciler_rx) = mpsc::unbounded_channel();
        let router = Arc::new(EventRouter::new(
            dispatcher.clone(),
            reconciler_tx.clone(),
            config.verify_crc,
            config.sender.clone(),
        ));
        let events = session_event_channel(config.notification_capacity);
        let supervisor = Arc::new(ConnectionSupervisor::new(
            config.clone(),
            connector,
            dispatcher.clone(),
            router,
            control,
            events.clone(),
        ));

        Self {
            hub: Arc::new(NotificationHub::new(config.notification_capacity)),
            config,
            link,
            supervisor,
            dispatcher,
            snapshot: Arc::new(RwLock::new(snapshot)),
            events,
            last_seen,
            reconciler_tx,
            reconciler_rx: Mutex::new(Some(reconciler_rx)),
            stop_workers: watch::channel(false).0,
            stop_reconciler: watch::channel(false).0,
            stop_flusher: watch::channel(false).0,
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Build a manager on the panel websocket and start it.
    pub fn connect(config: SessionConfig) -> Result<Self> {
        let connector = Arc::new(WebSocketConnector::from_config(&config));
        let manager = Self::new(config, connector);
        manager.start()?;
        Ok(manager)
    }

    /// Spawn the background tasks and begin connecting.
    ///
    /// Calling it again is a no-op; after [`shutdown`](Self::shutdown) it fails.
    pub fn start(&self) -> Result<()> {
        if *self.stop_workers.borrow() {
            return Err(BridgeError::Shutdown);
        }
        let receiver = self.reconciler_rx.lock().take();
        if let Some(receiver) = receiver {
            let mut tasks = self.tasks.lock();
            let reconciler = StateReconciler::new(
                self.snapshot.clone(),
                self.hub.clone(),
                self.last_seen.clone(),
            );
            tasks.reconciler = Some(tokio::spawn(
                reconciler.run(receiver, self.stop_reconciler.subscribe()),
            ));

            // Subscribe before the supervisor can report Ready
            let ctx = self.poll_context();
            tasks.workers.push(tokio::spawn(run_resync(
                ctx.clone(),
                self.events.subscribe(),
                self.stop_workers.subscribe(),
            )));

            let pollers = &self.config.pollers;
            let jobs = [
                (PollJob::Zones, pollers.zones),
                (PollJob::Schedulers, pollers.schedulers),
                (PollJob::Thermostats, pollers.thermostats),
                (
                    PollJob::Logs {
                        window: pollers.log_window,
                    },
                    pollers.logs,
                ),
            ];
            for (job, interval) in jobs {
                let Some(interval) = interval else { continue };
                tasks.workers.push(tokio::spawn(run_poller(
                    ctx.clone(),
                    job,
                    interval,
                    self.link.state(),
                    self.stop_workers.subscribe(),
                )));
            }

            if let Some(store) = &self.last_seen {
                tasks.flusher = Some(tokio::spawn(store.clone().run_flusher(
                    self.config.last_seen_flush_interval,
                    self.stop_flusher.subscribe(),
                )));
            }
        }
        self.supervisor.start()
    }

    /// Close the session, stop every task and flush the last-seen store.
    ///
    /// Terminal: the manager never reconnects afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down session manager");
        self.supervisor.shutdown().await;

        let (workers, reconciler, flusher) = {
            let mut tasks = self.tasks.lock();
            (
                std::mem::take(&mut tasks.workers),
                tasks.reconciler.take(),
                tasks.flusher.take(),
            )
        };

        // Producers first, then the reconciler drains, then the final flush
        self.stop_workers.send_replace(true);
        for worker in workers {
            join_logged(worker, "worker").await;
        }
        self.stop_reconciler.send_replace(true);
        if let Some(reconciler) = reconciler {
            join_logged(reconciler, "reconciler").await;
        }
        self.stop_flusher.send_replace(true);
        match (flusher, &self.last_seen) {
            (Some(flusher), _) => join_logged(flusher, "flusher").await,
            (None, Some(store)) => {
                if let Err(e) = store.flush().await {
                    error!("final last-seen flush failed: {}", e);
                }
            }
            (None, None) => {}
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.supervisor.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.supervisor.info()
    }

    /// Wait until the session is Ready.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let mut state = self.link.state();
        match tokio::time::timeout(timeout, until_ready(&mut state)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BridgeError::Shutdown),
            Err(_) => Err(BridgeError::CallTimeout {
                kind: "READY".to_string(),
                timeout,
            }),
        }
    }

    /// Session lifecycle events.
    pub fn events(&self) -> SessionEventReceiver {
        self.events.subscribe()
    }

    /// An independent cursor over `domain`'s change notifications.
    pub fn subscribe(&self, domain: Domain) -> Subscription {
        self.hub.subscribe(domain)
    }

    /// Point-in-time copy of one domain.
    pub async fn snapshot(&self, domain: Domain) -> DomainSnapshot {
        self.snapshot.read().await.domain(domain)
    }

    /// Current record for one entity. Accepts padded ids.
    pub async fn entity(&self, domain: Domain, id: &str) -> Option<EntityRecord> {
        let id = normalize_id(&Value::String(id.to_string()))?;
        self.snapshot.read().await.get(domain, &id).cloned()
    }

    pub fn last_seen_store(&self) -> Option<&Arc<LastSeenStore>> {
        self.last_seen.as_ref()
    }

    /// Send a request and wait for the reply picked by `matcher`.
    pub async fn issue(
        &self,
        request: &Request,
        matcher: ReplyMatcher,
        timeout: Duration,
    ) -> Result<Frame> {
        self.dispatcher.issue(request, matcher, timeout).await
    }

    /// Correlated call with the configured default timeout.
    pub async fn call(&self, request: &Request) -> Result<Frame> {
        self.dispatcher.call(request).await
    }

    /// Call and require a successful RESULT.
    async fn command(&self, request: &Request) -> Result<Frame> {
        let reply = self.dispatcher.call(request).await?;
        check_result(request, &reply, &self.config.sender)?;
        Ok(reply)
    }

    pub async fn set_output(&self, id: &str, command: OutputCommand) -> Result<()> {
        let pin = &self.config.pin;
        let request = Request::set_output(pin, id, &command.wire_value());
        let result = self.command(&request).await;
        let refused = matches!(
            result,
            Err(BridgeError::Rejected(_) | BridgeError::CallTimeout { .. })
        );
        if refused && command == OutputCommand::Off && self.is_light(id).await {
            // Some dimmers only accept a level
            warn!("OFF failed for light {}, retrying with level 0", id);
            let retry = Request::set_output(pin, id, &OutputCommand::Level(0).wire_value());
            return self.command(&retry).await.map(|_| ());
        }
        result.map(|_| ())
    }

    async fn is_light(&self, id: &str) -> bool {
        self.entity(Domain::Outputs, id)
            .await
            .and_then(|record| record.fields.get("CAT").map(value_to_string))
            .is_some_and(|cat| cat.trim().eq_ignore_ascii_case("LIGHT"))
    }

    pub async fn execute_scenario(&self, id: &str) -> Result<()> {
        self.command(&Request::execute_scenario(&self.config.pin, id))
            .await
            .map(|_| ())
    }

    /// Arm or disarm a partition, trying each MOD value the mode allows.
    pub async fn set_partition_mode(&self, id: &str, mode: PartitionMode) -> Result<()> {
        let mut last = BridgeError::Rejected(RejectReason::MissingResult);
        for candidate in mode.candidates() {
            let request = Request::arm_partition(&self.config.pin, id, candidate);
            match self.command(&request).await {
                Ok(_) => {
                    info!("partition {} set to {}", id, candidate);
                    return Ok(());
                }
                Err(e @ BridgeError::Rejected(_)) => {
                    debug!("partition {} refused MOD={}: {}", id, candidate, e);
                    last = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last)
    }

    pub async fn arm_partition(&self, id: &str) -> Result<()> {
        self.set_partition_mode(id, PartitionMode::Away).await
    }

    pub async fn arm_partition_instant(&self, id: &str) -> Result<()> {
        self.set_partition_mode(id, PartitionMode::Instant).await
    }

    pub async fn disarm_partition(&self, id: &str) -> Result<()> {
        self.set_partition_mode(id, PartitionMode::Disarm).await
    }

    pub async fn set_zone_bypass(&self, id: &str, mode: BypassMode) -> Result<()> {
        self.command(&Request::bypass_zone(&self.config.pin, id, mode))
            .await
            .map(|_| ())
    }

    /// Patch one scheduler timer (e.g. `EN`, `H`, `M`, `SCE`).
    pub async fn update_scheduler(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let entry = config_entry(id, patch)?;
        let request = Request::write_config(
            "CFG_ALL",
            json_map("CFG_SCHEDULER_TIMERS", entry.clone()),
            None,
        );
        let reply = self.command(&request).await?;
        self.apply_write(Domain::Schedulers, entry, reply.seq);
        Ok(())
    }

    /// Enable or disable a user account (`DACC` F/T).
    pub async fn set_account_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut patch = Map::new();
        patch.insert("DACC".to_string(), json!(if enabled { "F" } else { "T" }));
        let entry = config_entry(id, patch)?;
        let request = Request::write_config(
            "CFG_ALL",
            json_map("CFG_ACCOUNTS", entry.clone()),
            Some(&self.config.pin),
        );
        let reply = self.command(&request).await?;
        self.apply_write(Domain::Accounts, entry, reply.seq);
        Ok(())
    }

    /// Change a thermostat's configuration (`ACT_MODE`, `ACT_SEA`,
    /// `MAN_HRS`, `TOF`, season thresholds).
    ///
    /// The write is built from the current record plus `patch`; afterwards the
    /// thermostat configuration is read back so the snapshot holds what the
    /// panel applied.
    pub async fn update_thermostat(&self, id: &str, patch: Map<String, Value>) -> Result<()> {
        let id = entity_id(id)?;
        let base = self.entity(Domain::Thermostats, &id).await.map(|r| r.fields);
        let entry = thermostat_write_entry(&id, base.as_ref(), &patch);
        let pin = &self.config.pin;
        let request =
            Request::write_config("CFG_ALL", json_map("CFG_THERMOSTATS", entry), Some(pin));
        self.command(&request).await?;

        let reread = Request::read_thermostat_config(Some(pin));
        if let Err(e) = self.poll_context().read_into_snapshot(&reread, false).await {
            warn!("thermostat {} written but re-read failed: {}", id, e);
        }
        Ok(())
    }

    /// CLEAR a panel memory, e.g. `CYCLES_OR_MEMORIES` or `FAULTS_MEMORY`.
    pub async fn clear(&self, payload_type: &str) -> Result<()> {
        let request = Request::clear(payload_type, &self.config.pin)?;
        self.command(&request).await.map(|_| ())
    }

    /// The last `items` event-log entries as the panel returned them.
    pub async fn fetch_logs(&self, items: u32) -> Result<Vec<Value>> {
        fetch_logs(&self.dispatcher, items).await
    }

    pub async fn system_version(&self) -> Result<Value> {
        self.poll_context().system_version().await
    }

    /// Re-read the static configuration and re-register for pushes.
    pub async fn resync(&self) -> Result<()> {
        self.poll_context().resync().await
    }

    /// Drop the live session and log in again.
    pub fn force_reconnect(&self) {
        self.supervisor.force_reconnect();
    }

    fn poll_context(&self) -> PollContext {
        PollContext {
            dispatcher: self.dispatcher.clone(),
            reconciler: self.reconciler_tx.clone(),
            events: self.events.clone(),
            pin: self.config.pin.clone(),
        }
    }

    /// Reflect an accepted config write in the snapshot.
    fn apply_write(&self, domain: Domain, entry: Map<String, Value>, seq: u64) {
        let event = RealtimeEvent {
            domain,
            entries: Value::Array(vec![Value::Object(entry)]),
            received_at: Utc::now(),
            seq,
            source: Source::StaticRead,
            baseline: false,
        };
        if self.reconciler_tx.send(ReconcilerInput::Event(event)).is_err() {
            warn!("state reconciler is gone, {} write not reflected", domain);
        }
    }
}

fn load_store(path: &Path) -> LastSeenStore {
    match LastSeenStore::load(path) {
        Ok(store) => store,
        Err(e) => {
            error!("{}; starting with an empty last-seen store", e);
            LastSeenStore::empty(path)
        }
    }
}

fn entity_id(id: &str) -> Result<String> {
    normalize_id(&Value::String(id.to_string())).ok_or_else(|| BridgeError::InvalidArgument {
        details: format!("bad entity id {:?}", id),
    })
}

fn config_entry(id: &str, mut patch: Map<String, Value>) -> Result<Map<String, Value>> {
    patch.insert("ID".to_string(), Value::String(entity_id(id)?));
    Ok(patch)
}

/// `{ key: [entry] }`
fn json_map(key: &str, entry: Map<String, Value>) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(key.to_string(), Value::Array(vec![Value::Object(entry)]));
    map
}

async fn until_ready(state: &mut watch::Receiver<SessionState>) -> bool {
    state.wait_for(|s| *s == SessionState::Ready).await.is_ok()
}

async fn join_logged(task: JoinHandle<()>, name: &str) {
    if let Err(e) = task.await {
        error!("{} task failed: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_entry_normalizes_id() {
        let mut patch = Map::new();
        patch.insert("EN".to_string(), json!("T"));
        let entry = config_entry("003", patch).unwrap();
        assert_eq!(entry["ID"], json!("3"));
        assert_eq!(entry["EN"], json!("T"));
        assert!(config_entry("", Map::new()).is_err());
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails() {
        let config = SessionConfig::builder()
            .pollers(crate::config::PollerConfig::disabled())
            .build();
        let connector = Arc::new(WebSocketConnector::new(
            "ws://127.0.0.1:9/KseniaWsock",
            "KS_WSOCK",
            Duration::from_millis(10),
        ));
        let manager = SessionManager::new(config, connector);
        manager.shutdown().await;
        assert!(matches!(manager.start(), Err(BridgeError::Shutdown)));
        assert_eq!(manager.state(), SessionState::Disconnected);
    }
}
