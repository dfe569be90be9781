//! BLE building blocks.
//!
//! State machines and data types for both roles, the radio abstractions
//! they drive, and the btleplug and loopback radios.

pub mod adapter;
pub mod advertising;
pub mod connection;
pub mod gatt;
pub mod loopback;
pub mod platform;
pub mod radio;
pub mod registry;
pub mod rssi;
pub mod uuids;

pub use adapter::{AdapterMonitor, AdapterState, CommandOutcome};
pub use advertising::{
    AdvertisementData, AdvertisementSpec, Advertiser, AdvertiserConfig, AdvertiserStatus, AttError,
    GattServiceTree, PeripheralEvent, PeripheralRadio, RequestId,
};
pub use connection::{ConnectOptions, ConnectionAction, ConnectionController, ConnectionState, Transition};
pub use gatt::{CharacteristicDescriptor, CharacteristicHandle, CharacteristicProperties, GattCache, ServiceDescriptor};
pub use loopback::{LoopbackHandle, LoopbackPeripheral};
pub use platform::BtleplugCentral;
pub use radio::{CentralEvent, CentralRadio};
pub use registry::{AdvertisementPayload, AdvertisementValue, DeviceId, DeviceRecord, DeviceRegistry, NamelessDevicePolicy};
pub use rssi::SignalTier;
pub use uuids::*;
