//! Example: Arm and disarm a partition.

use std::time::Duration;

use lares_bridge::{BridgeError, Domain, SessionConfig, SessionManager};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = SessionConfig::builder()
        .host("192.168.0.100")
        .pin("123456")
        .build();

    let manager = SessionManager::connect(config)?;
    manager.wait_ready(Duration::from_secs(30)).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    // Show current partition states
    for (id, part) in &manager.snapshot(Domain::Partitions).await.records {
        println!(
            "Partition {}: {} (ARM={}, AST={})",
            id,
            part.fields.get("DES").and_then(|v| v.as_str()).unwrap_or("?"),
            part.fields.get("ARM").map(|v| v.to_string()).unwrap_or_default(),
            part.fields.get("AST").map(|v| v.to_string()).unwrap_or_default(),
        );
    }

    println!("\nArming partition 1...");
    match manager.arm_partition("1").await {
        Ok(()) => println!("Partition 1 armed"),
        Err(BridgeError::Rejected(reason)) => println!("Panel refused: {}", reason),
        Err(e) => println!("Error arming partition 1: {}", e),
    }

    tokio::time::sleep(Duration::from_secs(5)).await;

    println!("\nDisarming partition 1...");
    match manager.disarm_partition("1").await {
        Ok(()) => println!("Partition 1 disarmed"),
        Err(BridgeError::Rejected(reason)) => println!("Panel refused: {}", reason),
        Err(e) => println!("Error disarming partition 1: {}", e),
    }

    manager.shutdown().await;
    Ok(())
}
