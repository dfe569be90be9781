//! Peripheral role: publish and advertise a chat message
//!
//! Runs the Peripheral role on the in-process loopback radio, then plays
//! a remote Central that scans the advertisement and reads the message
//! before and after an update.
//!
//! Run with: cargo run --example peripheral_chat
//!
//! To publish a custom message:
//!   cargo run --example peripheral_chat -- --message hello

use ble_chat_session::{decode_message, AdvertiserConfig, PeripheralManager, Result, MESSAGE_CHARACTERISTIC_UUID};

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
    let message = args
        .iter()
        .position(|arg| arg == "--message")
        .and_then(|i| args.get(i + 1))
        .cloned()
        .unwrap_or_else(|| "hello from the peripheral".to_string());

    let (manager, remote) = PeripheralManager::loopback(AdvertiserConfig::default());

    let _handle = manager.on_status_changed(|status| {
        println!(
            "[status] {} (advertising: {}, value: {:?})",
            status.status, status.is_advertising, status.value
        );
    });

    manager.register_service_tree("test").await?;
    manager.start_advertising().await?;

    if let Some(payload) = remote.advertisement() {
        println!(
            "Central sees {:?} offering {:?}",
            payload.local_name(),
            payload.service_uuids()
        );
    }

    let read = |label: &'static str| {
        let reply = remote.read("demo-central", MESSAGE_CHARACTERISTIC_UUID, 0);
        async move {
            match reply.await {
                Ok(Ok(value)) => println!("{}: {:?}", label, decode_message(&value).text),
                Ok(Err(e)) => println!("{}: ATT error {:?}", label, e),
                Err(_) => println!("{}: no response", label),
            }
        }
    };

    read("Before update").await;
    manager.update_value(message).await?;
    read("After update").await;

    manager.shutdown().await?;
    Ok(())
}
