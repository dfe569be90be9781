//! GATT descriptors and the per-device characteristic cache.
//!
//! The cache holds the one characteristic handle the Central needs for
//! message reads. An entry exists only while the owning connection is
//! Ready; every other state removes it.

use bytes::Bytes;
use std::collections::HashMap;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::registry::DeviceId;

/// Access flags of a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicProperties {
    /// Value can be read.
    pub read: bool,
    /// Value can be written (with or without response).
    pub write: bool,
    /// Value changes can be pushed (notify or indicate).
    pub notify: bool,
}

impl CharacteristicProperties {
    /// Read-only flags.
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        notify: false,
    };
}

impl From<btleplug::api::CharPropFlags> for CharacteristicProperties {
    fn from(flags: btleplug::api::CharPropFlags) -> Self {
        use btleplug::api::CharPropFlags;

        Self {
            read: flags.contains(CharPropFlags::READ),
            write: flags.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
        }
    }
}

/// A discovered service.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ServiceDescriptor {
    /// Service UUID.
    pub uuid: Uuid,
    /// Whether this is a primary service.
    pub primary: bool,
}

impl ServiceDescriptor {
    /// A primary service.
    pub fn primary(uuid: Uuid) -> Self {
        Self {
            uuid,
            primary: true,
        }
    }
}

/// A discovered characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicDescriptor {
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// UUID of the service this characteristic belongs to.
    pub service_uuid: Uuid,
    /// Access flags.
    pub properties: CharacteristicProperties,
    /// Value last seen for this characteristic, if any.
    pub cached_value: Option<Bytes>,
}

impl CharacteristicDescriptor {
    /// Create a descriptor with no cached value.
    pub fn new(uuid: Uuid, service_uuid: Uuid, properties: CharacteristicProperties) -> Self {
        Self {
            uuid,
            service_uuid,
            properties,
            cached_value: None,
        }
    }

    /// Handle used to address this characteristic in later reads.
    pub fn handle(&self) -> CharacteristicHandle {
        CharacteristicHandle {
            service_uuid: self.service_uuid,
            uuid: self.uuid,
            properties: self.properties,
        }
    }
}

/// Resolved address of a characteristic on a connected device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CharacteristicHandle {
    /// Owning service.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub uuid: Uuid,
    /// Access flags at discovery time.
    pub properties: CharacteristicProperties,
}

/// Resolved message-characteristic handles keyed by device.
#[derive(Debug, Default)]
pub struct GattCache {
    handles: HashMap<DeviceId, CharacteristicHandle>,
}

impl GattCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the resolved handle for a device, replacing any previous one.
    pub fn insert(&mut self, id: DeviceId, handle: CharacteristicHandle) {
        debug!("Caching characteristic {} for {}", handle.uuid, id);
        self.handles.insert(id, handle);
    }

    /// Resolved handle for a device.
    pub fn get(&self, id: &DeviceId) -> Option<&CharacteristicHandle> {
        self.handles.get(id)
    }

    /// Drop the entry for a device. Returns the removed handle.
    pub fn invalidate(&mut self, id: &DeviceId) -> Option<CharacteristicHandle> {
        let removed = self.handles.remove(id);
        if removed.is_some() {
            trace!("Invalidated characteristic cache for {}", id);
        }
        removed
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.handles.clear();
    }

    /// Number of resolved handles.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Check if nothing is resolved.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};

    fn message_handle() -> CharacteristicHandle {
        CharacteristicDescriptor::new(
            MESSAGE_CHARACTERISTIC_UUID,
            CHAT_SERVICE_UUID,
            CharacteristicProperties::READ_ONLY,
        )
        .handle()
    }

    #[test]
    fn test_cache_insert_and_invalidate() {
        let mut cache = GattCache::new();
        let id = DeviceId::new("A");

        cache.insert(id.clone(), message_handle());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&id).unwrap().uuid, MESSAGE_CHARACTERISTIC_UUID);

        assert!(cache.invalidate(&id).is_some());
        assert!(cache.get(&id).is_none());
        assert!(cache.invalidate(&id).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_char_prop_flags_conversion() {
        use btleplug::api::CharPropFlags;

        let props = CharacteristicProperties::from(CharPropFlags::READ | CharPropFlags::INDICATE);
        assert!(props.read);
        assert!(!props.write);
        assert!(props.notify);

        let props = CharacteristicProperties::from(CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert!(props.write);
        assert!(!props.read);
    }
}
