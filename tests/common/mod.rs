// MIT License - Copyright (c) 2026 Peter Wright
// In-memory panel used by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use lares_bridge::protocol::Frame;
use lares_bridge::{
    BridgeError, Connector, Inbound, PollerConfig, Result, SessionConfig, Transport,
};

pub const SENDER: &str = "HomeAssistant";
pub const LOGIN_ID: &str = "42";

/// Test config: no pollers, no store.
pub fn config() -> SessionConfig {
    SessionConfig::builder()
        .pin("123456")
        .pollers(PollerConfig::disabled())
        .build()
}

/// Hands every accepted connection to the test as a [`PanelSide`].
pub struct MockConnector {
    sessions: mpsc::UnboundedSender<PanelSide>,
    fail_next: AtomicU32,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PanelSide>) {
        let (sessions, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions,
            fail_next: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BridgeError::Transport {
                details: "connection refused".to_string(),
            });
        }

        let (to_panel, from_client) = mpsc::unbounded_channel();
        let (to_client, inbound) = mpsc::unbounded_channel();
        let closed = Arc::new(Mutex::new(None));
        let panel = PanelSide {
            from_client,
            to_client: to_client.clone(),
            closed: closed.clone(),
        };
        self.sessions
            .send(panel)
            .map_err(|_| BridgeError::ConnectionLost)?;
        Ok(Box::new(MockTransport {
            to_panel,
            inbound,
            loopback: to_client,
            closed,
        }))
    }
}

struct MockTransport {
    to_panel: mpsc::UnboundedSender<String>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    loopback: mpsc::UnboundedSender<Inbound>,
    closed: Arc<Mutex<Option<u16>>>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.to_panel.send(text).map_err(|_| BridgeError::Transport {
            details: "panel gone".to_string(),
        })
    }

    async fn receive(&mut self) -> Result<Inbound> {
        Ok(self.inbound.recv().await.unwrap_or(Inbound::Closed {
            code: 1006,
            reason: String::new(),
        }))
    }

    async fn ping(&mut self) -> Result<()> {
        let _ = self.loopback.send(Inbound::Pong);
        Ok(())
    }

    async fn close(&mut self, code: u16, _reason: &str) -> Result<()> {
        *self.closed.lock() = Some(code);
        Ok(())
    }
}

/// The panel's end of one connection.
pub struct PanelSide {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Inbound>,
    closed: Arc<Mutex<Option<u16>>>,
}

impl PanelSide {
    /// Next frame the client wrote, CRC checked.
    pub async fn next_frame(&mut self) -> Frame {
        let text = tokio::time::timeout(Duration::from_secs(30), self.from_client.recv())
            .await
            .expect("no frame from client")
            .expect("client transport dropped");
        Frame::parse(&text, true).expect("client sent a bad frame")
    }

    /// Next frame, which must be `cmd`.
    pub async fn expect(&mut self, cmd: &str) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.cmd, cmd, "unexpected frame {:?}", frame);
        frame
    }

    pub fn send_json(&self, frame: Value) {
        self.send_raw(&frame.to_string());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(Inbound::Text(text.to_string()));
    }

    /// Reply to `request` with its own ID.
    pub fn reply(&self, request: &Frame, payload: Value) {
        self.send_json(json!({
            "SENDER": "Lares",
            "RECEIVER": SENDER,
            "CMD": format!("{}_RES", request.cmd),
            "ID": request.id,
            "PAYLOAD_TYPE": request.payload_type,
            "PAYLOAD": payload,
            "TIMESTAMP": "1700000000",
            "CRC_16": "0x0000",
        }));
    }

    /// Unsolicited realtime push wrapped in the receiver object.
    pub fn push(&self, sections: Value) {
        self.send_json(json!({
            "SENDER": "Lares",
            "RECEIVER": SENDER,
            "CMD": "REALTIME",
            "ID": "1",
            "PAYLOAD_TYPE": "CHANGES",
            "PAYLOAD": { SENDER: sections },
            "TIMESTAMP": "1700000000",
            "CRC_16": "0x0000",
        }));
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.to_client.send(Inbound::Closed {
            code,
            reason: reason.to_string(),
        });
    }

    /// Close code the client used, if it closed.
    pub fn closed_with(&self) -> Option<u16> {
        *self.closed.lock()
    }

    pub async fn accept_login(&mut self) {
        let login = self.expect("LOGIN").await;
        assert_eq!(login.payload["PIN"], "123456");
        self.reply(&login, json!({"RESULT": "OK", "ID_LOGIN": LOGIN_ID}));
    }

    /// Answer the post-login reads with `read` as the READ_RES payload.
    pub async fn serve_resync(&mut self, read: Value, status: Value) {
        let version = self.expect("SYSTEM_VERSION").await;
        self.reply(&version, json!({"RESULT": "OK", "VER_LITE": {"FW": "1.2.3"}}));

        let read_req = self.expect("READ").await;
        assert_eq!(read_req.payload["ID_LOGIN"], LOGIN_ID);
        let mut payload = read;
        payload["RESULT"] = json!("OK");
        self.reply(&read_req, payload);

        let register = self.expect("REALTIME").await;
        let mut payload = status;
        payload["RESULT"] = json!("OK");
        self.reply(&register, payload);
    }

    /// Login plus an empty resync.
    pub async fn bring_up(&mut self) {
        self.accept_login().await;
        self.serve_resync(json!({}), json!({})).await;
    }
}
