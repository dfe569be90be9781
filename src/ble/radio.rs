//! Radio stack abstraction for the Central role.
//!
//! Commands are fire-and-forget: none of them blocks or returns a result.
//! Whatever the stack does in response comes back later as a
//! [`CentralEvent`] on the session's serialized event queue.

use bytes::Bytes;
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::connection::ConnectOptions;
use crate::ble::gatt::{CharacteristicDescriptor, CharacteristicHandle, ServiceDescriptor};
use crate::ble::registry::{AdvertisementPayload, DeviceId};

/// Requests the Central session issues to the radio stack.
#[cfg_attr(test, mockall::automock)]
pub trait CentralRadio {
    /// Start discovery. An empty `services` list means no filter.
    fn start_scan(&mut self, services: Vec<Uuid>);

    /// Stop discovery.
    fn stop_scan(&mut self);

    /// Open a link to a device.
    fn connect(&mut self, id: &DeviceId, options: &ConnectOptions);

    /// Tear down a link or cancel a pending connect.
    fn cancel_connection(&mut self, id: &DeviceId);

    /// Discover services, restricted to `filter`.
    fn discover_services(&mut self, id: &DeviceId, filter: Vec<Uuid>);

    /// Discover characteristics of one service, restricted to `filter`.
    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, filter: Vec<Uuid>);

    /// Read a characteristic value.
    fn read_value(&mut self, id: &DeviceId, characteristic: &CharacteristicHandle);

    /// Read the link's current signal strength.
    fn read_rssi(&mut self, id: &DeviceId);
}

/// Callbacks delivered by the radio stack, one at a time.
#[derive(Debug, Clone, PartialEq)]
pub enum CentralEvent {
    /// The radio's power state changed.
    AdapterStateChanged(AdapterState),
    /// A scan result arrived.
    DeviceDiscovered {
        /// Platform identifier.
        id: DeviceId,
        /// Broadcast name, if any.
        name: Option<String>,
        /// Signal strength in dBm.
        rssi: Option<i16>,
        /// Advertisement data.
        payload: AdvertisementPayload,
    },
    /// The stack could not start or continue scanning.
    ScanFailed {
        /// Description from the stack.
        reason: String,
    },
    /// A link came up.
    Connected {
        /// The device.
        id: DeviceId,
    },
    /// A connect request failed.
    ConnectFailed {
        /// The device.
        id: DeviceId,
        /// Description from the stack.
        reason: String,
    },
    /// A link went down, requested or not.
    Disconnected {
        /// The device.
        id: DeviceId,
        /// Error reported with the disconnect, if any.
        reason: Option<String>,
    },
    /// Service discovery completed.
    ServicesDiscovered {
        /// The device.
        id: DeviceId,
        /// Services found, already restricted to the requested filter.
        services: Vec<ServiceDescriptor>,
    },
    /// Characteristic discovery for one service completed.
    CharacteristicsDiscovered {
        /// The device.
        id: DeviceId,
        /// The service searched.
        service: Uuid,
        /// Characteristics found.
        characteristics: Vec<CharacteristicDescriptor>,
    },
    /// A characteristic read completed.
    ValueRead {
        /// The device.
        id: DeviceId,
        /// The characteristic read.
        characteristic: Uuid,
        /// Raw value.
        value: Bytes,
    },
    /// A characteristic or RSSI read failed. The link stays up.
    ReadFailed {
        /// The device.
        id: DeviceId,
        /// Description from the stack.
        reason: String,
    },
    /// An RSSI read completed.
    RssiRead {
        /// The device.
        id: DeviceId,
        /// Signal strength in dBm.
        rssi: i16,
    },
    /// The stack reported an error that invalidates the connection.
    StackError {
        /// The device.
        id: DeviceId,
        /// Description from the stack.
        reason: String,
    },
}

impl CentralEvent {
    /// Device the event concerns, if any.
    pub fn device_id(&self) -> Option<&DeviceId> {
        match self {
            Self::AdapterStateChanged(_) | Self::ScanFailed { .. } => None,
            Self::DeviceDiscovered { id, .. }
            | Self::Connected { id }
            | Self::ConnectFailed { id, .. }
            | Self::Disconnected { id, .. }
            | Self::ServicesDiscovered { id, .. }
            | Self::CharacteristicsDiscovered { id, .. }
            | Self::ValueRead { id, .. }
            | Self::ReadFailed { id, .. }
            | Self::RssiRead { id, .. }
            | Self::StackError { id, .. } => Some(id),
        }
    }
}
