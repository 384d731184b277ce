//! Example: Connect to a Lares panel and print what it reports.

use std::time::Duration;

use lares_bridge::{Domain, SessionConfig, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig::builder()
        .host("192.168.0.100")
        .port(80)
        .pin("123456")
        .build();

    println!("Connecting to panel...");
    let manager = SessionManager::connect(config)?;
    manager.wait_ready(Duration::from_secs(30)).await?;

    match manager.system_version().await {
        Ok(version) => println!("Panel version: {}", version),
        Err(e) => println!("SYSTEM_VERSION failed: {}", e),
    }

    // Give the post-login resync a moment to land
    tokio::time::sleep(Duration::from_secs(2)).await;

    for domain in [Domain::Zones, Domain::Partitions, Domain::Outputs, Domain::Scenarios] {
        let snapshot = manager.snapshot(domain).await;
        println!("\n--- {} ({}) ---", domain, snapshot.records.len());
        for (id, record) in &snapshot.records {
            let label = record
                .fields
                .get("DES")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let status = record
                .fields
                .get("STA")
                .map(|v| v.to_string())
                .unwrap_or_default();
            println!("  {:>4}: {:24} {}", id, label, status);
        }
    }

    let info = manager.info();
    println!("\nSession: {} (retries {})", info.state, info.retry_count);

    println!("\nPress Ctrl+C to disconnect...");
    tokio::signal::ctrl_c().await?;
    manager.shutdown().await;
    println!("Disconnected.");

    Ok(())
}
