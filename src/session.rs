// MIT License - Copyright (c) 2026 Peter Wright
// Connection supervisor: session lifecycle, reconnect state machine, link task

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{RetryCounterReset, SessionConfig};
use crate::dispatcher::{CallDispatcher, ReplyMatcher};
use crate::error::{BridgeError, Result};
use crate::event::{SessionEvent, SessionEventSender};
use crate::protocol::{Request, extract_result, value_to_string};
use crate::router::EventRouter;
use crate::transport::{Connector, Inbound, Transport};

/// Close code we use for our own closes.
const NORMAL_CLOSE: u16 = 1000;

/// Lifecycle state of the panel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Closing,
    Cooldown,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Closing => "closing",
            SessionState::Cooldown => "cooldown",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the session bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub state: SessionState,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_close_code: Option<u16>,
    pub last_close_reason: Option<String>,
}

impl Default for SessionInfo {
    fn default() -> Self {
        Self {
            state: SessionState::Disconnected,
            retry_count: 0,
            next_retry_at: None,
            cooldown_until: None,
            last_close_code: None,
            last_close_reason: None,
        }
    }
}

/// Work handed to the link task, the only owner of the transport.
#[derive(Debug)]
pub(crate) enum LinkCommand {
    Send {
        text: String,
        ack: oneshot::Sender<Result<()>>,
    },
    Close {
        code: u16,
        reason: String,
    },
}

type OutboundSlot = Arc<Mutex<Option<mpsc::Sender<LinkCommand>>>>;

/// Read access to the session plus the one sanctioned way to send.
#[derive(Debug, Clone)]
pub struct SessionLink {
    state: watch::Receiver<SessionState>,
    outbound: OutboundSlot,
    login_id: Arc<RwLock<Option<String>>>,
}

/// The writer side of a [`SessionLink`], held by the supervisor.
#[derive(Debug)]
pub(crate) struct LinkControl {
    state_tx: watch::Sender<SessionState>,
    outbound: OutboundSlot,
    login_id: Arc<RwLock<Option<String>>>,
}

/// Create a linked reader/writer pair, starting Disconnected.
pub(crate) fn session_link() -> (SessionLink, LinkControl) {
    let (state_tx, state) = watch::channel(SessionState::Disconnected);
    let outbound: OutboundSlot = Arc::new(Mutex::new(None));
    let login_id = Arc::new(RwLock::new(None));
    (
        SessionLink {
            state,
            outbound: outbound.clone(),
            login_id: login_id.clone(),
        },
        LinkControl {
            state_tx,
            outbound,
            login_id,
        },
    )
}

impl SessionLink {
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    /// ID_LOGIN of the live session.
    pub fn login_id(&self) -> Option<String> {
        self.login_id.read().clone()
    }

    /// Queue a frame on the live transport and wait until it is written.
    pub async fn send(&self, text: String) -> Result<()> {
        let tx = self
            .outbound
            .lock()
            .clone()
            .ok_or(BridgeError::ConnectionLost)?;
        let (ack, done) = oneshot::channel();
        tx.send(LinkCommand::Send { text, ack })
            .await
            .map_err(|_| BridgeError::ConnectionLost)?;
        done.await.map_err(|_| BridgeError::ConnectionLost)?
    }
}

/// Why a link task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum LinkExit {
    /// Peer sent a close frame (or the stream ended)
    Peer { code: u16, reason: String },
    /// We closed it
    Local,
    /// Transport error or keepalive failure
    Failed(String),
}

/// Owns the transport: writes queued frames, feeds every inbound frame to the
/// router in arrival order and keeps the connection alive.
async fn run_link(
    mut transport: Box<dyn Transport>,
    mut commands: mpsc::Receiver<LinkCommand>,
    router: Arc<EventRouter>,
    keepalive_idle: Duration,
    ping_timeout: Duration,
) -> LinkExit {
    let mut idle_deadline = Instant::now() + keepalive_idle;
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let wake = pong_deadline.unwrap_or(idle_deadline);
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(LinkCommand::Send { text, ack }) => {
                    let result = transport.send(text).await;
                    let failure = result.as_ref().err().map(|e| e.to_string());
                    let _ = ack.send(result);
                    if let Some(reason) = failure {
                        warn!("send failed: {}", reason);
                        return LinkExit::Failed(reason);
                    }
                }
                Some(LinkCommand::Close { code, reason }) => {
                    debug!("closing link ({} {})", code, reason);
                    if let Err(e) = transport.close(code, &reason).await {
                        debug!("close failed: {}", e);
                    }
                    return LinkExit::Local;
                }
                None => {
                    if let Err(e) = transport.close(NORMAL_CLOSE, "session closed").await {
                        debug!("close failed: {}", e);
                    }
                    return LinkExit::Local;
                }
            },

            inbound = transport.receive() => {
                idle_deadline = Instant::now() + keepalive_idle;
                pong_deadline = None;
                match inbound {
                    Ok(Inbound::Text(text)) => {
                        router.route(&text);
                    }
                    Ok(Inbound::Pong) => debug!("keepalive: pong"),
                    Ok(Inbound::Closed { code, reason }) => {
                        info!("panel closed connection ({} {})", code, reason);
                        return LinkExit::Peer { code, reason };
                    }
                    Err(e) => {
                        warn!("receive failed: {}", e);
                        return LinkExit::Failed(e.to_string());
                    }
                }
            },

            _ = tokio::time::sleep_until(wake) => {
                if pong_deadline.is_some() {
                    warn!("no traffic {:?} after keepalive ping, dropping link", ping_timeout);
                    let _ = transport.close(NORMAL_CLOSE, "keepalive timeout").await;
                    return LinkExit::Failed("keepalive timeout".to_string());
                }
                debug!("keepalive: ping after {:?} idle", keepalive_idle);
                if let Err(e) = transport.ping().await {
                    warn!("keepalive ping failed: {}", e);
                    return LinkExit::Failed(e.to_string());
                }
                pong_deadline = Some(Instant::now() + ping_timeout);
            }
        }
    }
}

/// How one connect attempt ended.
#[derive(Debug)]
enum Attempt {
    /// Never reached Ready
    Failed { graceful: bool },
    /// A Ready session was lost
    Lost { graceful: bool },
    /// `force_reconnect()` asked for a fresh session
    Restart,
    Shutdown,
}

/// Owns the single panel connection and keeps it alive.
pub struct ConnectionSupervisor {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    dispatcher: Arc<CallDispatcher>,
    router: Arc<EventRouter>,
    control: LinkControl,
    events: SessionEventSender,
    info: Mutex<SessionInfo>,
    shutdown_tx: watch::Sender<bool>,
    reconnect: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<CallDispatcher>,
        router: Arc<EventRouter>,
        control: LinkControl,
        events: SessionEventSender,
    ) -> Self {
        Self {
            config,
            connector,
            dispatcher,
            router,
            control,
            events,
            info: Mutex::new(SessionInfo::default()),
            shutdown_tx: watch::channel(false).0,
            reconnect: Notify::new(),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.control.state_tx.borrow()
    }

    pub fn info(&self) -> SessionInfo {
        self.info.lock().clone()
    }

    /// Begin connecting. Fails once `shutdown()` has been called.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BridgeError::Shutdown);
        }
        let mut task = self.task.lock();
        if task.is_some() {
            debug!("supervisor already started");
            return Ok(());
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move { this.run().await }));
        Ok(())
    }

    /// Close the session and stop reconnecting. Terminal.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("supervisor task failed: {}", e);
        }
        self.set_state(SessionState::Disconnected);
    }

    /// Drop the current session and connect again straight away.
    ///
    /// Ignored unless the session is Ready.
    pub fn force_reconnect(&self) {
        self.reconnect.notify_waiters();
    }

    fn set_state(&self, state: SessionState) {
        self.info.lock().state = state;
        let previous = self.control.state_tx.send_replace(state);
        if previous != state {
            debug!("session {} -> {}", previous, state);
            let _ = self.events.send(SessionEvent::StateChanged(state));
        }
    }

    async fn run(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut retry: u32 = 0;
        let mut new_cycle = true;

        loop {
            if *shutdown.borrow() {
                break;
            }
            if new_cycle && self.config.retry_reset == RetryCounterReset::PerCycle {
                retry = 0;
            }
            new_cycle = false;

            let delay = self.config.backoff_delay(retry);
            if !delay.is_zero() {
                {
                    let mut info = self.info.lock();
                    info.next_retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .map(|d| Utc::now() + d);
                }
                info!("reconnecting in {:?} (retry {})", delay, retry);
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
            }
            retry = retry.saturating_add(1);
            {
                let mut info = self.info.lock();
                info.retry_count = retry;
                info.next_retry_at = None;
            }

            let graceful = match self.attempt(&mut shutdown, &mut retry).await {
                Attempt::Shutdown => break,
                Attempt::Restart => {
                    new_cycle = true;
                    continue;
                }
                Attempt::Failed { graceful } => graceful,
                Attempt::Lost { graceful } => {
                    new_cycle = true;
                    graceful
                }
            };

            if graceful {
                let cooldown = self.config.reconnect_cooldown;
                self.info.lock().cooldown_until = chrono::Duration::from_std(cooldown)
                    .ok()
                    .map(|d| Utc::now() + d);
                self.set_state(SessionState::Cooldown);
                info!("panel closed the session gracefully, cooling down for {:?}", cooldown);
                if sleep_or_shutdown(cooldown, &mut shutdown).await {
                    break;
                }
                self.info.lock().cooldown_until = None;
                new_cycle = true;
            } else {
                self.set_state(SessionState::Disconnected);
            }
        }

        self.set_state(SessionState::Disconnected);
        info!("supervisor stopped");
    }

    /// One connect, authenticate, serve cycle.
    async fn attempt(&self, shutdown: &mut watch::Receiver<bool>, retry: &mut u32) -> Attempt {
        self.set_state(SessionState::Connecting);
        let transport = tokio::select! {
            result = self.connector.connect() => result,
            _ = wait_shutdown(shutdown) => return Attempt::Shutdown,
        };
        let transport = match transport {
            Ok(transport) => transport,
            Err(e) => {
                warn!("connect failed: {}", e);
                return Attempt::Failed { graceful: false };
            }
        };

        let (tx, rx) = mpsc::channel(64);
        let mut link = tokio::spawn(run_link(
            transport,
            rx,
            self.router.clone(),
            self.config.keepalive_idle,
            self.config.ping_timeout,
        ));
        *self.control.outbound.lock() = Some(tx);
        self.set_state(SessionState::Authenticating);

        let login = tokio::select! {
            result = self.login() => result,
            exit = &mut link => {
                let exit = exit.unwrap_or_else(|e| LinkExit::Failed(e.to_string()));
                let graceful = self.finish(exit);
                return Attempt::Failed { graceful };
            }
            _ = wait_shutdown(shutdown) => {
                self.teardown(link, "shutdown").await;
                return Attempt::Shutdown;
            }
        };
        match login {
            Ok(login_id) => {
                info!("logged in, session ready (ID_LOGIN {})", login_id);
                *self.control.login_id.write() = Some(login_id.clone());
            }
            Err(e) => {
                warn!("login failed: {}", e);
                let exit = self.teardown(link, "login failed").await;
                return Attempt::Failed {
                    graceful: self.is_graceful(&exit),
                };
            }
        }

        if self.config.retry_reset == RetryCounterReset::OnReady {
            *retry = 0;
            self.info.lock().retry_count = 0;
        }
        self.set_state(SessionState::Ready);
        let login_id = self.control.login_id.read().clone().unwrap_or_default();
        let _ = self.events.send(SessionEvent::Ready { login_id });

        tokio::select! {
            exit = &mut link => {
                let exit = exit.unwrap_or_else(|e| LinkExit::Failed(e.to_string()));
                let graceful = self.finish(exit);
                Attempt::Lost { graceful }
            }
            _ = self.reconnect.notified() => {
                info!("reconnect requested");
                self.teardown(link, "reconnect").await;
                Attempt::Restart
            }
            _ = wait_shutdown(shutdown) => {
                self.teardown(link, "shutdown").await;
                Attempt::Shutdown
            }
        }
    }

    async fn login(&self) -> Result<String> {
        let request = Request::login(&self.config.pin);
        let reply = self
            .dispatcher
            .issue_in(
                &request,
                ReplyMatcher::Correlated,
                self.config.login_timeout,
                &[SessionState::Authenticating],
            )
            .await
            .map_err(|e| match e {
                BridgeError::CallTimeout { .. } => BridgeError::Authentication {
                    reason: "no reply to LOGIN".to_string(),
                },
                other => other,
            })?;

        match extract_result(&reply.payload, self.dispatcher.sender()) {
            Some(result) if result.eq_ignore_ascii_case("OK") => {
                let login_id = reply
                    .payload
                    .get("ID_LOGIN")
                    .map(value_to_string)
                    .unwrap_or_default();
                if login_id.is_empty() {
                    return Err(BridgeError::Authentication {
                        reason: "LOGIN_RES without ID_LOGIN".to_string(),
                    });
                }
                Ok(login_id)
            }
            Some(result) => Err(BridgeError::Authentication {
                reason: format!("RESULT={}", result),
            }),
            None => Err(BridgeError::Authentication {
                reason: "LOGIN_RES without RESULT".to_string(),
            }),
        }
    }

    /// Close the live link and wait until the transport is gone.
    async fn teardown(&self, link: JoinHandle<LinkExit>, reason: &str) -> LinkExit {
        self.set_state(SessionState::Closing);
        let tx = self.control.outbound.lock().take();
        if let Some(tx) = tx {
            let _ = tx
                .send(LinkCommand::Close {
                    code: NORMAL_CLOSE,
                    reason: reason.to_string(),
                })
                .await;
        }
        let exit = link
            .await
            .unwrap_or_else(|e| LinkExit::Failed(e.to_string()));
        self.finish(exit.clone());
        exit
    }

    /// Bookkeeping once the link task has ended. Returns whether the panel
    /// closed gracefully.
    fn finish(&self, exit: LinkExit) -> bool {
        self.set_state(SessionState::Closing);
        self.control.outbound.lock().take();
        *self.control.login_id.write() = None;
        self.dispatcher.fail_all();

        let graceful = self.is_graceful(&exit);
        let mut info = self.info.lock();
        match exit {
            LinkExit::Peer { code, reason } => {
                info.last_close_code = Some(code);
                info.last_close_reason = Some(reason);
            }
            LinkExit::Failed(reason) => {
                info.last_close_code = None;
                info.last_close_reason = Some(reason);
            }
            LinkExit::Local => {}
        }
        graceful
    }

    fn is_graceful(&self, exit: &LinkExit) -> bool {
        matches!(exit, LinkExit::Peer { code, .. } if *code == self.config.graceful_close_code)
    }
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the supervisor itself is gone
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Sleep, returning true if shutdown was requested meanwhile.
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => *shutdown.borrow(),
        _ = wait_shutdown(shutdown) => true,
    }
}

#[cfg(test)]
pub(crate) struct LinkHarness {
    control: LinkControl,
    commands: mpsc::Receiver<LinkCommand>,
}

#[cfg(test)]
impl SessionLink {
    /// A link in a fixed state whose sends land in the returned harness.
    pub(crate) fn harness(state: SessionState) -> (SessionLink, LinkHarness) {
        let (link, control) = session_link();
        control.state_tx.send_replace(state);
        let (tx, commands) = mpsc::channel(16);
        *control.outbound.lock() = Some(tx);
        (link, LinkHarness { control, commands })
    }
}

#[cfg(test)]
impl LinkHarness {
    pub(crate) async fn next_sent(&mut self) -> String {
        loop {
            match self.commands.recv().await {
                Some(LinkCommand::Send { text, ack }) => {
                    let _ = ack.send(Ok(()));
                    return text;
                }
                Some(LinkCommand::Close { .. }) => continue,
                None => panic!("link closed"),
            }
        }
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.control.state_tx.send_replace(state);
    }

    pub(crate) fn set_login_id(&self, login_id: &str) {
        *self.control.login_id.write() = Some(login_id.to_string());
    }
}
