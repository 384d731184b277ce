// MIT License - Copyright (c) 2026 Peter Wright
// Request/response calls multiplexed over the panel session

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};
use crate::protocol::{Frame, Request};
use crate::session::{SessionLink, SessionState};

/// Remember this many retired call IDs for the tolerant matcher.
const RETIRED_CAPACITY: usize = 256;

/// How a pending call recognizes its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyMatcher {
    /// `<CMD>_RES` carrying the request's own ID
    Correlated,
    /// Any frame with this CMD, oldest pending call first
    Kind(String),
}

#[derive(Debug)]
struct PendingCall {
    call_id: u64,
    kind: String,
    /// Expected reply ID; `None` matches on kind alone
    correlation: Option<String>,
    created: Instant,
    slot: oneshot::Sender<Frame>,
}

#[derive(Debug, Default)]
struct Registry {
    /// Pending calls in issue order
    pending: VecDeque<PendingCall>,
    retired: VecDeque<String>,
    retired_set: HashSet<String>,
}

impl Registry {
    fn retire(&mut self, id: Option<String>) {
        let Some(id) = id else { return };
        if !self.retired_set.insert(id.clone()) {
            return;
        }
        self.retired.push_back(id);
        while self.retired.len() > RETIRED_CAPACITY {
            if let Some(old) = self.retired.pop_front() {
                self.retired_set.remove(&old);
            }
        }
    }

    fn remove(&mut self, call_id: u64) -> Option<PendingCall> {
        let pos = self.pending.iter().position(|c| c.call_id == call_id)?;
        let call = self.pending.remove(pos)?;
        self.retire(call.correlation.clone());
        Some(call)
    }

    fn find(&self, frame: &Frame, tolerate_mismatch: bool) -> Option<usize> {
        let id = frame.id.as_deref();
        let by_id = self.pending.iter().position(|c| {
            c.kind == frame.cmd && c.correlation.is_some() && c.correlation.as_deref() == id
        });
        if by_id.is_some() {
            return by_id;
        }
        let by_kind = self
            .pending
            .iter()
            .position(|c| c.kind == frame.cmd && c.correlation.is_none());
        if by_kind.is_some() || !tolerate_mismatch {
            return by_kind;
        }
        // Some panels echo the wrong ID. Give the reply to the oldest call of
        // that kind, unless it belongs to a call that is already finished.
        if id.is_some_and(|id| self.retired_set.contains(id)) {
            return None;
        }
        let pos = self.pending.iter().position(|c| c.kind == frame.cmd)?;
        warn!(
            "{} id mismatch (got {:?}, pending {:?}) - accepting reply",
            frame.cmd, frame.id, self.pending[pos].correlation
        );
        Some(pos)
    }
}

async fn session_left(state_rx: &mut watch::Receiver<SessionState>, allowed: &[SessionState]) {
    // A closed channel also means the session is gone
    let _ = state_rx.wait_for(|s| !allowed.contains(s)).await;
}

/// Deregisters a call when the issuing future is dropped early.
struct PendingGuard {
    registry: Arc<Mutex<Registry>>,
    call_id: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.armed && self.registry.lock().remove(self.call_id).is_some() {
            debug!("call {} cancelled", self.call_id);
        }
    }
}

/// Issues calls over the current session and resolves them exactly once.
pub struct CallDispatcher {
    link: SessionLink,
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    sender: String,
    default_timeout: Duration,
    tolerate_mismatch: bool,
}

impl CallDispatcher {
    pub fn new(
        link: SessionLink,
        sender: impl Into<String>,
        default_timeout: Duration,
        tolerate_mismatch: bool,
    ) -> Self {
        Self {
            link,
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: AtomicU64::new(1),
            sender: sender.into(),
            default_timeout,
            tolerate_mismatch,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn state(&self) -> SessionState {
        self.link.current()
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.registry.lock().pending.len()
    }

    /// Send a request and wait for its reply.
    ///
    /// Fails with `CallTimeout` if no reply arrives in time and with
    /// `ConnectionLost` if the session is not Ready or drops while waiting.
    pub async fn issue(
        &self,
        request: &Request,
        matcher: ReplyMatcher,
        timeout: Duration,
    ) -> Result<Frame> {
        self.issue_in(request, matcher, timeout, &[SessionState::Ready])
            .await
    }

    /// Correlated call with the default timeout.
    pub async fn call(&self, request: &Request) -> Result<Frame> {
        self.issue(request, ReplyMatcher::Correlated, self.default_timeout)
            .await
    }

    /// Like [`issue`](Self::issue), allowed while the session is in any of
    /// `allowed` states.
    pub(crate) async fn issue_in(
        &self,
        request: &Request,
        matcher: ReplyMatcher,
        timeout: Duration,
        allowed: &[SessionState],
    ) -> Result<Frame> {
        let mut state_rx = self.link.state();
        if !allowed.contains(&*state_rx.borrow_and_update()) {
            return Err(BridgeError::ConnectionLost);
        }

        let call_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let wire_id = call_id.to_string();
        let login_id = self.link.login_id();
        let frame = request.to_frame(
            &self.sender,
            &wire_id,
            login_id.as_deref(),
            chrono::Utc::now().timestamp(),
        );
        let text = frame.encode()?;

        let (kind, correlation) = match matcher {
            ReplyMatcher::Correlated => (request.reply_kind(), Some(wire_id.clone())),
            ReplyMatcher::Kind(kind) => (kind, None),
        };

        // Register before sending so the reply can never arrive first
        let (tx, mut rx) = oneshot::channel();
        self.registry.lock().pending.push_back(PendingCall {
            call_id,
            kind: kind.clone(),
            correlation,
            created: Instant::now(),
            slot: tx,
        });
        let mut guard = PendingGuard {
            registry: self.registry.clone(),
            call_id,
            armed: true,
        };

        debug!("call {} -> {} {}", wire_id, request.cmd, request.payload_type);
        self.link.send(text).await?;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        // A reply already handed over wins over a timeout or state change
        let result = tokio::select! {
            biased;
            reply = &mut rx => reply.map_err(|_| BridgeError::ConnectionLost),
            _ = &mut deadline => {
                let removed = self.registry.lock().remove(call_id);
                match removed {
                    Some(_) => {
                        warn!("call {} ({}) timed out after {:?}", wire_id, kind, timeout);
                        Err(BridgeError::CallTimeout { kind: kind.clone(), timeout })
                    }
                    // Resolved in the same instant the timer fired
                    None => rx.try_recv().map_err(|_| BridgeError::ConnectionLost),
                }
            }
            _ = session_left(&mut state_rx, allowed) => Err(BridgeError::ConnectionLost),
        };
        guard.armed = result.is_err();
        result
    }

    /// Offer an inbound frame to the pending calls.
    ///
    /// Returns the frame back if no call claimed it.
    pub fn resolve(&self, frame: Frame) -> Option<Frame> {
        let mut registry = self.registry.lock();
        let Some(pos) = registry.find(&frame, self.tolerate_mismatch) else {
            return Some(frame);
        };
        let Some(call) = registry.pending.remove(pos) else {
            return Some(frame);
        };
        registry.retire(call.correlation.clone());
        drop(registry);

        debug!(
            "call {} resolved by {} after {:?}",
            call.call_id,
            frame.cmd,
            call.created.elapsed()
        );
        // The caller may have just been dropped; the frame then falls through
        call.slot.send(frame).err()
    }

    /// Fail every pending call with `ConnectionLost`.
    pub fn fail_all(&self) {
        let mut registry = self.registry.lock();
        let drained: Vec<PendingCall> = registry.pending.drain(..).collect();
        for call in &drained {
            registry.retire(call.correlation.clone());
        }
        drop(registry);
        if !drained.is_empty() {
            debug!("failing {} pending calls", drained.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionLink;
    use serde_json::json;

    fn reply(cmd: &str, id: &str) -> Frame {
        Frame {
            sender: String::new(),
            receiver: String::new(),
            cmd: cmd.to_string(),
            id: Some(id.to_string()),
            payload_type: None,
            payload: json!({"RESULT": "OK"}),
            timestamp: None,
            crc_16: None,
            seq: 0,
        }
    }

    fn dispatcher(tolerate: bool) -> (Arc<CallDispatcher>, crate::session::LinkHarness) {
        let (link, harness) = SessionLink::harness(SessionState::Ready);
        let d = Arc::new(CallDispatcher::new(link, "HA", Duration::from_secs(5), tolerate));
        (d, harness)
    }

    #[tokio::test]
    async fn test_correlated_call_resolves() {
        let (d, mut harness) = dispatcher(true);
        let d2 = d.clone();
        let task = tokio::spawn(async move { d2.call(&Request::system_version()).await });

        let sent = harness.next_sent().await;
        let frame = Frame::parse(&sent, true).unwrap();
        assert_eq!(frame.cmd, "SYSTEM_VERSION");

        let id = frame.id.unwrap();
        assert!(d.resolve(reply("SYSTEM_VERSION_RES", &id)).is_none());
        let got = task.await.unwrap().unwrap();
        assert_eq!(got.id.as_deref(), Some(id.as_str()));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unrelated_frame_falls_through() {
        let (d, mut harness) = dispatcher(true);
        let d2 = d.clone();
        let _task = tokio::spawn(async move { d2.call(&Request::system_version()).await });
        harness.next_sent().await;

        let push = reply("REALTIME", "1");
        assert_eq!(d.resolve(push.clone()), Some(push));
        assert_eq!(d.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_kind_matching_is_fifo() {
        let (d, mut harness) = dispatcher(false);
        let (d1, d2) = (d.clone(), d.clone());
        let c1 = tokio::spawn(async move {
            d1.issue(&Request::read_multi(&["ZONES"]), ReplyMatcher::Kind("READ_RES".into()), Duration::from_secs(5))
                .await
        });
        harness.next_sent().await;
        let c2 = tokio::spawn(async move {
            d2.issue(&Request::read_multi(&["OUTPUTS"]), ReplyMatcher::Kind("READ_RES".into()), Duration::from_secs(5))
                .await
        });
        harness.next_sent().await;

        assert!(d.resolve(reply("READ_RES", "r1")).is_none());
        assert!(d.resolve(reply("READ_RES", "r2")).is_none());
        assert_eq!(c1.await.unwrap().unwrap().id.as_deref(), Some("r1"));
        assert_eq!(c2.await.unwrap().unwrap().id.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn test_mismatched_id_goes_to_oldest() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let c1 = tokio::spawn(async move { d1.call(&Request::clear("FAULTS_MEMORY", "1").unwrap()).await });
        harness.next_sent().await;

        assert!(d.resolve(reply("CLEAR_RES", "999")).is_none());
        assert_eq!(c1.await.unwrap().unwrap().id.as_deref(), Some("999"));
    }

    #[tokio::test]
    async fn test_mismatch_rejected_when_strict() {
        let (d, mut harness) = dispatcher(false);
        let d1 = d.clone();
        let _c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        harness.next_sent().await;
        assert!(d.resolve(reply("SYSTEM_VERSION_RES", "999")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_deregisters_and_late_reply_falls_through() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let started = Instant::now();
        let c1 = tokio::spawn(async move {
            d1.issue(&Request::system_version(), ReplyMatcher::Correlated, Duration::from_secs(2))
                .await
        });
        let sent = Frame::parse(&harness.next_sent().await, false).unwrap();

        let err = c1.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::CallTimeout { .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(d.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let late = reply("SYSTEM_VERSION_RES", sent.id.as_deref().unwrap());
        assert!(d.resolve(late).is_some());
    }

    #[tokio::test]
    async fn test_retired_id_not_used_for_tolerant_match() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        let first = Frame::parse(&harness.next_sent().await, false).unwrap();
        let first_id = first.id.unwrap();
        assert!(d.resolve(reply("SYSTEM_VERSION_RES", &first_id)).is_none());
        c1.await.unwrap().unwrap();

        let d2 = d.clone();
        let _c2 = tokio::spawn(async move { d2.call(&Request::system_version()).await });
        harness.next_sent().await;
        // Duplicate of the first reply must not satisfy the second call
        assert!(d.resolve(reply("SYSTEM_VERSION_RES", &first_id)).is_some());
        assert_eq!(d.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_not_ready_fails_fast() {
        let (link, _harness) = SessionLink::harness(SessionState::Connecting);
        let d = CallDispatcher::new(link, "HA", Duration::from_secs(5), true);
        let err = d.call(&Request::system_version()).await.unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionLost));
    }

    #[tokio::test]
    async fn test_session_loss_fails_pending() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        harness.next_sent().await;

        harness.set_state(SessionState::Closing);
        let err = c1.await.unwrap().unwrap_err();
        assert!(matches!(err, BridgeError::ConnectionLost));
        assert_eq!(d.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_claimed_reply_survives_session_exit() {
        for _ in 0..50 {
            let (d, mut harness) = dispatcher(true);
            let d1 = d.clone();
            let c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
            let sent = Frame::parse(&harness.next_sent().await, false).unwrap();

            let id = sent.id.unwrap();
            assert!(d.resolve(reply("SYSTEM_VERSION_RES", &id)).is_none());
            harness.set_state(SessionState::Closing);
            let got = c1.await.unwrap().unwrap();
            assert_eq!(got.id.as_deref(), Some(id.as_str()));
        }
    }

    #[tokio::test]
    async fn test_login_id_stamped_on_requests() {
        let (d, mut harness) = dispatcher(true);
        harness.set_login_id("77");
        let d1 = d.clone();
        let _c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        let sent = Frame::parse(&harness.next_sent().await, true).unwrap();
        assert_eq!(sent.payload["ID_LOGIN"], "77");
    }

    #[tokio::test]
    async fn test_fail_all() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        harness.next_sent().await;
        d.fail_all();
        assert!(matches!(c1.await.unwrap(), Err(BridgeError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_cancelled_call_deregisters() {
        let (d, mut harness) = dispatcher(true);
        let d1 = d.clone();
        let c1 = tokio::spawn(async move { d1.call(&Request::system_version()).await });
        let sent = Frame::parse(&harness.next_sent().await, false).unwrap();
        c1.abort();
        let _ = c1.await;
        assert_eq!(d.pending_count(), 0);
        assert!(d.resolve(reply("SYSTEM_VERSION_RES", sent.id.as_deref().unwrap())).is_some());
    }
}
