// MIT License - Copyright (c) 2026 Peter Wright
// Error taxonomy

use std::fmt;
use std::time::Duration;

/// Outcome reported by the panel in the `RESULT` field of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// The panel answered with a RESULT other than `OK`.
    Result(String),
    /// A security command was acknowledged without any RESULT field.
    MissingResult,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Result(r) => write!(f, "RESULT={r}"),
            Self::MissingResult => write!(f, "no RESULT in reply"),
        }
    }
}

/// All errors that can occur in the lares-bridge library.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {details}")]
    Transport { details: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Call timeout after {timeout:?}: {kind}")]
    CallTimeout { kind: String, timeout: Duration },

    #[error("Protocol error: {details}")]
    Protocol { details: String },

    #[error("Authentication failed: {reason}")]
    Authentication { reason: String },

    #[error("Command rejected: {0}")]
    Rejected(RejectReason),

    #[error("Persistence error: {details}")]
    Persistence { details: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown domain: {name}")]
    InvalidDomain { name: String },

    #[error("Invalid argument: {details}")]
    InvalidArgument { details: String },

    #[error("Session manager shut down")]
    Shutdown,

    #[error("Channel closed")]
    ChannelClosed,
}

impl BridgeError {
    /// Whether the supervisor should retry after this error.
    ///
    /// Authentication failures are retried too: the controller rejects
    /// logins while it is busy reloading its configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Io(_)
                | BridgeError::Transport { .. }
                | BridgeError::WebSocket(_)
                | BridgeError::ConnectionLost
                | BridgeError::CallTimeout { .. }
                | BridgeError::Authentication { .. }
                | BridgeError::ChannelClosed
        )
    }

    /// Whether this failure is specific to one call rather than the session.
    pub fn is_call_outcome(&self) -> bool {
        matches!(
            self,
            BridgeError::CallTimeout { .. } | BridgeError::ConnectionLost | BridgeError::Rejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(BridgeError::ConnectionLost.is_retryable());
        assert!(
            BridgeError::Authentication {
                reason: "busy".to_string()
            }
            .is_retryable()
        );
        assert!(!BridgeError::Shutdown.is_retryable());
        assert!(
            !BridgeError::Persistence {
                details: "disk full".to_string()
            }
            .is_retryable()
        );
    }

    #[test]
    fn test_call_outcomes() {
        let timeout = BridgeError::CallTimeout {
            kind: "READ_RES".to_string(),
            timeout: Duration::from_secs(2),
        };
        assert!(timeout.is_call_outcome());
        assert!(BridgeError::Rejected(RejectReason::MissingResult).is_call_outcome());
        assert!(!BridgeError::Protocol { details: "x".into() }.is_call_outcome());
    }

    #[test]
    fn test_display() {
        let e = BridgeError::Rejected(RejectReason::Result("KO".to_string()));
        assert_eq!(e.to_string(), "Command rejected: RESULT=KO");
    }
}
