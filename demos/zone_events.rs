//! Example: Subscribe to zone changes and print them.

use lares_bridge::{Domain, SessionConfig, SessionEvent, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig::builder()
        .host("192.168.0.100")
        .pin("123456")
        .last_seen_path("last_seen.json")
        .build();

    let manager = SessionManager::connect(config)?;
    let mut zones = manager.subscribe(Domain::Zones);
    let mut events = manager.events();

    println!("Listening for zone events (Ctrl+C to stop)...\n");

    loop {
        tokio::select! {
            change = zones.next() => {
                let Some(change) = change else { break };
                println!("Zone {} changed ({:?}):", change.id, change.source);
                for key in &change.changed {
                    println!("  {} = {}", key, change.fields.get(key).cloned().unwrap_or_default());
                }
                println!("  last seen {}", change.last_seen);
            }
            event = events.recv() => {
                match event {
                    Ok(SessionEvent::StateChanged(state)) => println!("Session {}", state),
                    Ok(SessionEvent::Resynced) => println!("Resynchronized with panel"),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        println!("Missed {} session events", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
        }
    }

    manager.shutdown().await;
    Ok(())
}
