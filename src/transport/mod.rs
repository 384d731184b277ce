// MIT License - Copyright (c) 2026 Peter Wright
// Transport abstraction

pub mod websocket;

use async_trait::async_trait;

use crate::error::Result;

pub use websocket::WebSocketConnector;

/// Close code reported when the stream ends without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

/// One item read from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame
    Text(String),
    /// Answer to a keepalive ping
    Pong,
    /// The peer closed the connection (or the stream ended)
    Closed { code: u16, reason: String },
}

/// A live duplex connection to the panel.
///
/// Owned by exactly one task at a time; nothing else sends on it or closes it.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> Result<()>;

    /// Wait for the next inbound item.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses no
    /// frame.
    async fn receive(&mut self) -> Result<Inbound>;

    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self, code: u16, reason: &str) -> Result<()>;
}

/// Opens new transports.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Box<dyn Transport>>;
}
