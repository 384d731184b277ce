// MIT License - Copyright (c) 2026 Peter Wright
// Session manager for Ksenia Lares alarm panels
//
//! # lares-bridge
//!
//! Keeps one websocket session open to a Ksenia Lares panel and shares it
//! between many callers.
//!
//! - Concurrent request/response calls are multiplexed over the session and
//!   each resolves exactly once (reply, timeout or connection loss).
//! - Every unsolicited push is merged into a per-domain snapshot with
//!   normalized ids and "last seen" bookkeeping that survives restarts.
//! - Subscribers get a change notification per meaningful field change.
//! - The session reconnects on its own: exponential backoff after failures,
//!   a fixed cooldown after the panel closes it gracefully.
//!
//! ## Quick Start
//!
//! ```no_run
//! use lares_bridge::{Domain, OutputCommand, SessionConfig, SessionManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig::builder()
//!         .host("192.168.0.100")
//!         .pin("123456")
//!         .build();
//!
//!     let manager = SessionManager::connect(config)?;
//!
//!     let mut outputs = manager.subscribe(Domain::Outputs);
//!     tokio::spawn(async move {
//!         while let Some(change) = outputs.next().await {
//!             println!("output {}: {:?}", change.id, change.fields.get("STA"));
//!         }
//!     });
//!
//!     manager.wait_ready(std::time::Duration::from_secs(30)).await?;
//!     manager.set_output("1", OutputCommand::On).await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod event;
pub mod last_seen;
pub mod manager;
mod poller;
pub mod protocol;
pub mod reconciler;
pub mod router;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use config::{PollerConfig, RetryCounterReset, SessionConfig, SessionConfigBuilder};
pub use dispatcher::ReplyMatcher;
pub use domain::{Domain, normalize_id};
pub use error::{BridgeError, RejectReason, Result};
pub use event::{ChangeNotification, SessionEvent, SessionEventReceiver, Source, Subscription};
pub use last_seen::LastSeenStore;
pub use manager::SessionManager;
pub use protocol::{BypassMode, Frame, OutputCommand, PartitionMode, Request};
pub use reconciler::{DomainSnapshot, EntityRecord, LastSeen};
pub use session::{SessionInfo, SessionState};
pub use transport::{Connector, Inbound, Transport, WebSocketConnector};
