// MIT License - Copyright (c) 2026 Peter Wright
// Session configuration

use std::path::PathBuf;
use std::time::Duration;

/// When the reconnect retry counter goes back to zero.
///
/// A reconnect cycle begins at `start()`, whenever a Ready session is lost,
/// and whenever a cooldown wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryCounterReset {
    /// Reset at the start of every reconnect cycle, whether or not the
    /// previous cycle reached Ready. Backoff after a cooldown starts over.
    #[default]
    PerCycle,
    /// Reset only once a session reaches Ready. Failed cycles separated by
    /// cooldowns keep growing the backoff.
    OnReady,
}

/// Intervals for the periodic background reads.
///
/// `None` disables the corresponding poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// READ ZONES (some panels don't push BYP/tamper in realtime)
    pub zones: Option<Duration>,
    /// READ CFG_SCHEDULER_TIMERS + CFG_HOLIDAYS
    pub schedulers: Option<Duration>,
    /// READ CFG_THERMOSTATS (never pushed in realtime)
    pub thermostats: Option<Duration>,
    /// LOGS GET_LAST_LOGS
    pub logs: Option<Duration>,
    /// Number of log entries requested per poll
    pub log_window: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            zones: Some(Duration::from_secs(5)),
            schedulers: Some(Duration::from_secs(30)),
            thermostats: Some(Duration::from_secs(15)),
            logs: Some(Duration::from_secs(5)),
            log_window: 500,
        }
    }
}

impl PollerConfig {
    /// All pollers off.
    pub fn disabled() -> Self {
        Self {
            zones: None,
            schedulers: None,
            thermostats: None,
            logs: None,
            log_window: 500,
        }
    }
}

/// Configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Panel host name or IP address
    pub host: String,
    /// Panel websocket port (default: 80)
    pub port: u16,
    /// Websocket path (default: /KseniaWsock)
    pub path: String,
    /// Websocket subprotocol (default: KS_WSOCK)
    pub subprotocol: String,
    /// User PIN used for LOGIN and for commands that require one
    pub pin: String,
    /// SENDER field stamped on every outbound frame
    pub sender: String,
    /// Timeout for opening the websocket
    pub connect_timeout: Duration,
    /// Wait after a graceful "session superseded" close before reconnecting
    pub reconnect_cooldown: Duration,
    /// Close code the controller uses for a graceful disconnect
    pub graceful_close_code: u16,
    /// First non-immediate reconnect delay
    pub backoff_base: Duration,
    /// Backoff ceiling
    pub backoff_max: Duration,
    /// Retry counter reset policy
    pub retry_reset: RetryCounterReset,
    /// Timeout applied to calls that don't specify one
    pub call_timeout: Duration,
    /// Timeout for the LOGIN call during authentication
    pub login_timeout: Duration,
    /// Ping the panel after this much inbound silence
    pub keepalive_idle: Duration,
    /// Treat the link as dead if nothing arrives this long after a ping
    pub ping_timeout: Duration,
    /// Verify CRC_16 on inbound frames (mismatches are dropped)
    pub verify_crc: bool,
    /// Accept replies whose ID doesn't match any pending call
    pub tolerate_id_mismatch: bool,
    /// Broadcast capacity per domain and for session events
    pub notification_capacity: usize,
    /// Background pollers
    pub pollers: PollerConfig,
    /// Durable last-seen file (`None` keeps last-seen in memory only)
    pub last_seen_path: Option<PathBuf>,
    /// Flush interval for the last-seen store
    pub last_seen_flush_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: "192.168.0.100".to_string(),
            port: 80,
            path: "/KseniaWsock".to_string(),
            subprotocol: "KS_WSOCK".to_string(),
            pin: String::new(),
            sender: "HomeAssistant".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_cooldown: Duration::from_secs(8),
            graceful_close_code: 1000,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(60),
            retry_reset: RetryCounterReset::PerCycle,
            call_timeout: Duration::from_secs(10),
            login_timeout: Duration::from_secs(10),
            keepalive_idle: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(5),
            verify_crc: false,
            tolerate_id_mismatch: true,
            notification_capacity: 256,
            pollers: PollerConfig::default(),
            last_seen_path: None,
            last_seen_flush_interval: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Create a new config builder starting from defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// The websocket URL of the panel.
    pub fn url(&self) -> String {
        format!("ws://{}:{}{}", self.host, self.port, self.path)
    }

    /// Reconnect delay for the given retry count.
    ///
    /// Retry 0 is immediate; retry n waits `base * 2^(n-1)`, capped at
    /// `backoff_max`.
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (retry_count - 1).min(16);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }
}

/// Builder for SessionConfig.
#[derive(Debug, Clone, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.config.path = path.into();
        self
    }

    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.config.subprotocol = subprotocol.into();
        self
    }

    pub fn pin(mut self, pin: impl Into<String>) -> Self {
        self.config.pin = pin.into();
        self
    }

    pub fn sender(mut self, sender: impl Into<String>) -> Self {
        self.config.sender = sender.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn reconnect_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.reconnect_cooldown = cooldown;
        self
    }

    pub fn graceful_close_code(mut self, code: u16) -> Self {
        self.config.graceful_close_code = code;
        self
    }

    pub fn backoff_base(mut self, base: Duration) -> Self {
        self.config.backoff_base = base;
        self
    }

    pub fn backoff_max(mut self, max: Duration) -> Self {
        self.config.backoff_max = max;
        self
    }

    pub fn retry_reset(mut self, policy: RetryCounterReset) -> Self {
        self.config.retry_reset = policy;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    pub fn login_timeout(mut self, timeout: Duration) -> Self {
        self.config.login_timeout = timeout;
        self
    }

    pub fn keepalive_idle(mut self, idle: Duration) -> Self {
        self.config.keepalive_idle = idle;
        self
    }

    pub fn ping_timeout(mut self, timeout: Duration) -> Self {
        self.config.ping_timeout = timeout;
        self
    }

    pub fn verify_crc(mut self, verify: bool) -> Self {
        self.config.verify_crc = verify;
        self
    }

    pub fn tolerate_id_mismatch(mut self, tolerate: bool) -> Self {
        self.config.tolerate_id_mismatch = tolerate;
        self
    }

    pub fn notification_capacity(mut self, capacity: usize) -> Self {
        self.config.notification_capacity = capacity.max(1);
        self
    }

    pub fn pollers(mut self, pollers: PollerConfig) -> Self {
        self.config.pollers = pollers;
        self
    }

    pub fn last_seen_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.last_seen_path = Some(path.into());
        self
    }

    pub fn last_seen_flush_interval(mut self, interval: Duration) -> Self {
        self.config.last_seen_flush_interval = interval;
        self
    }

    pub fn build(self) -> SessionConfig {
        self.config
    }
}
