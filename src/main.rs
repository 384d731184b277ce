// MIT License - Copyright (c) 2026 Peter Wright
// Session daemon: keeps the panel session up and logs every change

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{info, warn};

use lares_bridge::{
    Domain, PollerConfig, RetryCounterReset, SessionConfig, SessionEvent, SessionManager,
};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(name = "lares-bridge")]
#[command(about = "Keeps a session open to a Ksenia Lares panel and tracks its entities")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Config {
    panel: PanelToml,
    #[serde(default)]
    session: SessionToml,
    #[serde(default)]
    pollers: PollersToml,
    #[serde(default)]
    store: StoreToml,
    /// Domains whose changes are logged; empty means all
    #[serde(default)]
    log_domains: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PanelToml {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    pin: String,
    #[serde(default = "default_sender")]
    sender: String,
    #[serde(default)]
    verify_crc: bool,
}

fn default_port() -> u16 {
    80
}
fn default_path() -> String {
    "/KseniaWsock".to_string()
}
fn default_sender() -> String {
    "HomeAssistant".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SessionToml {
    connect_timeout_secs: u64,
    reconnect_cooldown_secs: u64,
    graceful_close_code: u16,
    backoff_base_secs: u64,
    backoff_max_secs: u64,
    /// "per_cycle" or "on_ready"
    retry_reset: String,
    call_timeout_secs: u64,
    keepalive_idle_secs: u64,
    ping_timeout_secs: u64,
    tolerate_id_mismatch: bool,
}

impl Default for SessionToml {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            reconnect_cooldown_secs: 8,
            graceful_close_code: 1000,
            backoff_base_secs: 2,
            backoff_max_secs: 60,
            retry_reset: "per_cycle".to_string(),
            call_timeout_secs: 10,
            keepalive_idle_secs: 20,
            ping_timeout_secs: 5,
            tolerate_id_mismatch: true,
        }
    }
}

/// Poll intervals in seconds; 0 turns a poller off.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct PollersToml {
    zones_secs: u64,
    schedulers_secs: u64,
    thermostats_secs: u64,
    logs_secs: u64,
    log_window: u32,
}

impl Default for PollersToml {
    fn default() -> Self {
        Self {
            zones_secs: 5,
            schedulers_secs: 30,
            thermostats_secs: 15,
            logs_secs: 5,
            log_window: 500,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct StoreToml {
    last_seen_path: Option<String>,
    flush_interval_secs: u64,
}

impl Default for StoreToml {
    fn default() -> Self {
        Self {
            last_seen_path: None,
            flush_interval_secs: 5,
        }
    }
}

fn parse_retry_reset(s: &str) -> Result<RetryCounterReset> {
    match s.to_lowercase().as_str() {
        "per_cycle" | "cycle" => Ok(RetryCounterReset::PerCycle),
        "on_ready" | "ready" => Ok(RetryCounterReset::OnReady),
        other => anyhow::bail!("Unknown retry_reset policy: {other}"),
    }
}

fn interval(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn build_session_config(config: &Config) -> Result<SessionConfig> {
    let panel = &config.panel;
    let session = &config.session;
    let pollers = PollerConfig {
        zones: interval(config.pollers.zones_secs),
        schedulers: interval(config.pollers.schedulers_secs),
        thermostats: interval(config.pollers.thermostats_secs),
        logs: interval(config.pollers.logs_secs),
        log_window: config.pollers.log_window.max(1),
    };
    let mut builder = SessionConfig::builder()
        .host(&panel.host)
        .port(panel.port)
        .path(&panel.path)
        .pin(&panel.pin)
        .sender(&panel.sender)
        .verify_crc(panel.verify_crc)
        .connect_timeout(Duration::from_secs(session.connect_timeout_secs))
        .reconnect_cooldown(Duration::from_secs(session.reconnect_cooldown_secs))
        .graceful_close_code(session.graceful_close_code)
        .backoff_base(Duration::from_secs(session.backoff_base_secs))
        .backoff_max(Duration::from_secs(session.backoff_max_secs))
        .retry_reset(parse_retry_reset(&session.retry_reset)?)
        .call_timeout(Duration::from_secs(session.call_timeout_secs))
        .login_timeout(Duration::from_secs(session.call_timeout_secs))
        .keepalive_idle(Duration::from_secs(session.keepalive_idle_secs))
        .ping_timeout(Duration::from_secs(session.ping_timeout_secs))
        .tolerate_id_mismatch(session.tolerate_id_mismatch)
        .pollers(pollers)
        .last_seen_flush_interval(Duration::from_secs(config.store.flush_interval_secs.max(1)));
    if let Some(path) = &config.store.last_seen_path {
        builder = builder.last_seen_path(path);
    }
    Ok(builder.build())
}

fn log_domains(config: &Config) -> Result<Vec<Domain>> {
    if config.log_domains.is_empty() {
        return Ok(Domain::ALL.to_vec());
    }
    config
        .log_domains
        .iter()
        .map(|name| name.parse::<Domain>().context("Invalid entry in log_domains"))
        .collect()
}

fn load_config(path: &str) -> Result<(SessionConfig, Vec<Domain>)> {
    let text = std::fs::read_to_string(path).context("Failed to read config file")?;
    let config: Config = toml::from_str(&text).context("Failed to parse config file")?;
    Ok((build_session_config(&config)?, log_domains(&config)?))
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

fn spawn_listeners(manager: &SessionManager, domains: &[Domain]) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    for domain in domains {
        let mut changes = manager.subscribe(*domain);
        handles.push(tokio::spawn(async move {
            while let Some(change) = changes.next().await {
                let fields: Vec<String> = change
                    .changed
                    .iter()
                    .map(|k| format!("{}={}", k, change.fields.get(k).cloned().unwrap_or_default()))
                    .collect();
                info!("{} {}: {}", change.domain, change.id, fields.join(" "));
            }
        }));
    }

    let mut events = manager.events();
    handles.push(tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => info!("Session {state}"),
                Ok(SessionEvent::Ready { login_id }) => info!("Logged in (ID_LOGIN {login_id})"),
                Ok(SessionEvent::Resynced) => info!("Panel state resynchronized"),
                Ok(SessionEvent::SystemVersion(version)) => info!("Panel version: {version}"),
                Ok(SessionEvent::Logs(entries)) => {
                    for entry in entries {
                        info!("Panel log: {entry}");
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Session event receiver lagged, missed {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }));
    handles
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity (e.g. RUST_LOG=debug or RUST_LOG=lares_bridge=trace).
    // Default: info.
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    // systemd journal already adds timestamps, so omit them when running under systemd
    if std::env::var_os("JOURNAL_STREAM").is_some() {
        tracing_subscriber::fmt().without_time().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let cli = Cli::parse();
    let (mut session_config, mut domains) = load_config(&cli.config)?;

    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        info!("Connecting to Lares panel at {}", session_config.url());
        let manager = SessionManager::connect(session_config.clone())
            .context("Failed to start session manager")?;
        let listeners = spawn_listeners(&manager, &domains);

        info!("Bridge running. Send SIGHUP to reload, SIGINT/SIGTERM to stop.");
        let restart = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down...");
                false
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                false
            }
            _ = sighup.recv() => {
                info!("Received SIGHUP, reloading config and restarting the session...");
                true
            }
        };

        // Closes the session and flushes the last-seen store
        manager.shutdown().await;
        for handle in listeners {
            handle.abort();
        }

        if !restart {
            break;
        }

        // Reload config from disk; keep previous config on failure
        info!("Reloading config from {}", cli.config);
        match load_config(&cli.config) {
            Ok((new_config, new_domains)) => {
                session_config = new_config;
                domains = new_domains;
                info!("Config reloaded successfully");
            }
            Err(e) => warn!("Failed to reload config, keeping previous: {e:#}"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}
