// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # ble-chat-session
//!
//! Bluetooth Low Energy session state machines for a minimal GATT "chat"
//! service, in both roles.
//!
//! - **Central**: scan for devices advertising the chat service, connect,
//!   discover the service and its `message` characteristic, read the
//!   message and the link's signal strength.
//! - **Peripheral**: publish a one-service GATT tree holding a message and
//!   advertise it under a fixed local name.
//!
//! ## Features
//!
//! - **Race-free sessions**: radio callbacks and caller commands are
//!   processed one at a time on a single task
//! - **Explicit connection lifecycle**: Disconnected, Connecting, Connected,
//!   DiscoveringServices, DiscoveringCharacteristics, Ready, Failed
//! - **Signal tiers**: RSSI readings classified from Unusable to Excellent
//! - **Testable core**: the state machines are sans-IO and run against any
//!   [`CentralRadio`] or [`PeripheralRadio`]
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ble_chat_session::{CentralManager, Result};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let manager = CentralManager::new().await?;
//!     manager.start_scanning().await?;
//!
//!     // Wait for devices to be discovered
//!     tokio::time::sleep(Duration::from_secs(5)).await;
//!
//!     if let Some(device) = manager.nearest_device() {
//!         println!("Connecting to {} ({:?} dBm)", device.label(), device.last_rssi);
//!         manager
//!             .connect_with_deadline(&device.id, Duration::from_secs(15))
//!             .await?;
//!         manager.read_value(&device.id).await?;
//!     }
//!
//!     tokio::time::sleep(Duration::from_secs(1)).await;
//!     println!("Message: {:?}", manager.status().last_message);
//!
//!     manager.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! The Central role uses btleplug and needs the usual platform setup:
//! a Bluetooth usage description on macOS, BlueZ on Linux, Windows 10 or
//! later on Windows. btleplug has no Peripheral support, so the Peripheral
//! role ships with [`LoopbackPeripheral`], an in-process radio.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod central_manager;
pub mod error;
pub mod peripheral_manager;
pub mod session;
pub mod utils;

// Re-exports for convenience
pub use central_manager::{CallbackHandle, CentralManager};
pub use error::{Error, Result};
pub use peripheral_manager::PeripheralManager;
pub use session::{CentralConfig, CentralSession, SessionSnapshot, SessionStatus, SessionUpdate};
pub use utils::{decode_message, encode_message, DecodedText};

// Re-export commonly used types from submodules
pub use ble::{
    AdapterState, Advertiser, AdvertiserConfig, AdvertiserStatus, BtleplugCentral, CentralEvent, CentralRadio,
    CommandOutcome, ConnectOptions, ConnectionState, DeviceId, DeviceRecord, LoopbackHandle, LoopbackPeripheral,
    PeripheralEvent, PeripheralRadio, SignalTier, ADVERTISED_LOCAL_NAME, CHAT_SERVICE_UUID,
    MESSAGE_CHARACTERISTIC_UUID,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<CentralManager>();
        let _ = std::any::TypeId::of::<PeripheralManager>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<SessionSnapshot>();
        let _ = std::any::TypeId::of::<DeviceRecord>();
        let _ = std::any::TypeId::of::<SignalTier>();
    }
}

