//! Central role: find a chat peripheral and read its message
//!
//! Scans for devices advertising the chat service, connects to the
//! nearest one, reads the message characteristic and the link's signal
//! strength.
//!
//! Run with: cargo run --example central_chat
//!
//! To connect to a specific device:
//!   cargo run --example central_chat -- --device <ID>

use ble_chat_session::{CentralManager, DeviceId, Error, Result, SessionUpdate};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_chat_session=debug".parse().unwrap()),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let target = args
        .iter()
        .position(|arg| arg == "--device")
        .and_then(|i| args.get(i + 1))
        .map(|s| DeviceId::new(s.as_str()));

    let manager = CentralManager::new().await?;

    let _handle = manager.on_update(|update| match update {
        SessionUpdate::DeviceDiscovered(id) => println!("Discovered {}", id),
        SessionUpdate::ConnectionStateChanged { id, state } => println!("{}: {}", id, state),
        SessionUpdate::MessageRead { id, message } => println!("{} says: {}", id, message),
        SessionUpdate::RssiRead { id, rssi, tier } => {
            println!("{}: {} dBm {} {}", id, rssi, tier.symbol(), tier)
        }
        _ => {}
    });

    // Give the adapter a moment to report its power state
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("Bluetooth is {}", manager.status().adapter_state);

    manager.start_scanning().await?;
    println!("Scanning for chat peripherals...\n");
    tokio::time::sleep(Duration::from_secs(5)).await;

    let device = match &target {
        Some(id) => manager.device(id),
        None => manager.nearest_device(),
    };
    let Some(device) = device else {
        println!("No chat peripheral found");
        manager.shutdown().await?;
        return Ok(());
    };

    println!("\nConnecting to {}...", device.label());
    match manager
        .connect_with_deadline(&device.id, Duration::from_secs(20))
        .await
    {
        Ok(()) => {}
        Err(Error::Timeout) => {
            println!("Timed out connecting to {}", device.label());
            manager.shutdown().await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    }

    manager.read_value(&device.id).await?;
    manager.read_signal_strength(&device.id).await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let status = manager.status();
    println!("\nStatus: {}", status.status);
    println!("Peripheral: {}", status.peripheral_output);
    if !status.error.is_empty() {
        println!("Last error: {}", status.error);
    }

    manager.disconnect(&device.id).await?;
    manager.shutdown().await?;
    Ok(())
}
