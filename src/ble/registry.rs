//! Discovered-device bookkeeping.
//!
//! Scan results are merged by device id: a second sighting of the same id
//! refreshes its name, signal strength and advertisement payload instead of
//! adding a new record.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ble::connection::{ConnectionController, ConnectionState};
use crate::ble::rssi::SignalTier;
use crate::error::{Error, Result};

/// Opaque identifier of a remote device, stable for a discovery session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a platform identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Key of the local-name entry in an advertisement payload.
pub const LOCAL_NAME_KEY: &str = "local_name";
/// Key of the advertised service UUID list.
pub const SERVICE_UUIDS_KEY: &str = "service_uuids";
/// Key of the advertised transmit power.
pub const TX_POWER_LEVEL_KEY: &str = "tx_power_level";

/// One value inside an advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdvertisementValue {
    /// UTF-8 text.
    Text(String),
    /// A list of UUIDs.
    Uuids(Vec<Uuid>),
    /// Raw bytes (manufacturer or service data).
    Bytes(Bytes),
    /// A signed integer.
    Integer(i64),
}

/// Advertisement data received with a scan result.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementPayload(BTreeMap<String, AdvertisementValue>);

impl AdvertisementPayload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a key.
    pub fn insert(&mut self, key: impl Into<String>, value: AdvertisementValue) {
        self.0.insert(key.into(), value);
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: AdvertisementValue) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up a key.
    pub fn get(&self, key: &str) -> Option<&AdvertisementValue> {
        self.0.get(key)
    }

    /// Advertised local name, if present.
    pub fn local_name(&self) -> Option<&str> {
        match self.0.get(LOCAL_NAME_KEY) {
            Some(AdvertisementValue::Text(name)) => Some(name),
            _ => None,
        }
    }

    /// Advertised service UUIDs; empty when the key is absent.
    pub fn service_uuids(&self) -> &[Uuid] {
        match self.0.get(SERVICE_UUIDS_KEY) {
            Some(AdvertisementValue::Uuids(uuids)) => uuids,
            _ => &[],
        }
    }

    /// Iterate over all entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AdvertisementValue)> {
        self.0.iter()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the payload carries nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// What to do with scan results that carry no broadcast name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NamelessDevicePolicy {
    /// Ignore the result entirely.
    #[default]
    Drop,
    /// Track the device with no display name.
    Track,
}

/// A remote device seen while scanning.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceRecord {
    /// Platform identifier.
    pub id: DeviceId,
    /// Broadcast name, if any.
    pub display_name: Option<String>,
    /// Most recent signal strength in dBm.
    pub last_rssi: Option<i16>,
    /// Most recent advertisement payload.
    pub advertisement_payload: AdvertisementPayload,
    /// Connection state machine for this device.
    pub connection: ConnectionController,
    /// Last message read from the device's message characteristic.
    pub last_message: Option<String>,
    /// When the device was last seen in a scan result.
    pub last_seen: DateTime<Utc>,
}

impl DeviceRecord {
    fn new(
        id: DeviceId,
        display_name: Option<String>,
        rssi: Option<i16>,
        payload: AdvertisementPayload,
        connection: ConnectionController,
    ) -> Self {
        Self {
            id,
            display_name,
            last_rssi: rssi,
            advertisement_payload: payload,
            connection,
            last_message: None,
            last_seen: Utc::now(),
        }
    }

    /// Current connection state.
    pub fn connection_state(&self) -> &ConnectionState {
        self.connection.state()
    }

    /// Signal tier of the last reading.
    pub fn signal_tier(&self) -> Option<SignalTier> {
        self.last_rssi.map(SignalTier::classify)
    }

    /// Name for status messages; falls back to the identifier.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// Result of feeding a scan result into the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new record was created.
    Inserted,
    /// An existing record was refreshed.
    Updated,
    /// The result was dropped by the nameless-device policy.
    Dropped,
}

/// Keyed store of discovered devices.
#[derive(Debug)]
pub struct DeviceRegistry {
    devices: HashMap<DeviceId, DeviceRecord>,
    nameless_policy: NamelessDevicePolicy,
    template: ConnectionController,
}

impl DeviceRegistry {
    /// Create an empty registry. New records get a clone of `template` as
    /// their connection state machine.
    pub fn new(nameless_policy: NamelessDevicePolicy, template: ConnectionController) -> Self {
        Self {
            devices: HashMap::new(),
            nameless_policy,
            template,
        }
    }

    /// Merge a scan result into the registry.
    pub fn on_device_discovered(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        payload: AdvertisementPayload,
    ) -> Upsert {
        if name.is_none() && self.nameless_policy == NamelessDevicePolicy::Drop {
            trace!("Dropping nameless scan result for {}", id);
            return Upsert::Dropped;
        }

        match self.devices.get_mut(&id) {
            Some(record) => {
                if name.is_some() {
                    record.display_name = name;
                }
                if rssi.is_some() {
                    record.last_rssi = rssi;
                }
                record.advertisement_payload = payload;
                record.last_seen = Utc::now();
                trace!("Updated device {} (RSSI: {:?})", id, record.last_rssi);
                Upsert::Updated
            }
            None => {
                info!(
                    "Discovered device {} ({})",
                    name.as_deref().unwrap_or("<unnamed>"),
                    id
                );
                debug!("Advertisement data for {}: {:?}", id, payload);
                let record = DeviceRecord::new(id.clone(), name, rssi, payload, self.template.clone());
                self.devices.insert(id, record);
                Upsert::Inserted
            }
        }
    }

    /// Look up a device.
    pub fn get(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.get(id)
    }

    /// Look up a device mutably.
    pub fn get_mut(&mut self, id: &DeviceId) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(id)
    }

    /// Look up a device, failing with [`Error::UnknownDevice`].
    pub fn require(&self, id: &DeviceId) -> Result<&DeviceRecord> {
        self.devices.get(id).ok_or_else(|| Error::unknown_device(id))
    }

    /// Mutable variant of [`require`](Self::require).
    pub fn require_mut(&mut self, id: &DeviceId) -> Result<&mut DeviceRecord> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| Error::unknown_device(id))
    }

    /// Check if a device is known.
    pub fn contains(&self, id: &DeviceId) -> bool {
        self.devices.contains_key(id)
    }

    /// Start a fresh discovery session. Devices with a live connection are
    /// kept so their state machines are not orphaned.
    pub fn begin_session(&mut self) {
        let before = self.devices.len();
        self.devices.retain(|_, record| record.connection.state().is_active());
        debug!(
            "New scan session: cleared {} device(s), kept {}",
            before - self.devices.len(),
            self.devices.len()
        );
    }

    /// Remove every record.
    pub fn reset(&mut self) {
        self.devices.clear();
    }

    /// Iterate over all records.
    pub fn iter(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.values()
    }

    /// Iterate mutably over all records.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceRecord> {
        self.devices.values_mut()
    }

    /// Records sorted by signal strength, strongest first.
    pub fn by_signal(&self) -> Vec<&DeviceRecord> {
        let mut records: Vec<_> = self.devices.values().collect();
        records.sort_by_key(|r| std::cmp::Reverse(r.last_rssi.unwrap_or(i16::MIN)));
        records
    }

    /// Record with the strongest signal.
    pub fn nearest(&self) -> Option<&DeviceRecord> {
        self.devices
            .values()
            .max_by_key(|r| r.last_rssi.unwrap_or(i16::MIN))
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Change the nameless-device policy.
    pub fn set_nameless_policy(&mut self, policy: NamelessDevicePolicy) {
        self.nameless_policy = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
    use pretty_assertions::assert_eq;

    fn registry(policy: NamelessDevicePolicy) -> DeviceRegistry {
        DeviceRegistry::new(
            policy,
            ConnectionController::new(CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID),
        )
    }

    #[test]
    fn test_upsert_merges_by_id() {
        let mut reg = registry(NamelessDevicePolicy::Drop);
        let id = DeviceId::new("A");

        assert_eq!(
            reg.on_device_discovered(id.clone(), Some("Alpha".into()), Some(-70), AdvertisementPayload::new()),
            Upsert::Inserted
        );
        assert_eq!(
            reg.on_device_discovered(id.clone(), Some("Alpha".into()), Some(-50), AdvertisementPayload::new()),
            Upsert::Updated
        );

        assert_eq!(reg.len(), 1);
        let record = reg.get(&id).unwrap();
        assert_eq!(record.last_rssi, Some(-50));
        assert_eq!(record.signal_tier(), Some(SignalTier::Excellent));
    }

    #[test]
    fn test_update_keeps_previous_rssi_when_missing() {
        let mut reg = registry(NamelessDevicePolicy::Drop);
        let id = DeviceId::new("A");

        reg.on_device_discovered(id.clone(), Some("Alpha".into()), Some(-60), AdvertisementPayload::new());
        reg.on_device_discovered(id.clone(), Some("Alpha 2".into()), None, AdvertisementPayload::new());

        let record = reg.get(&id).unwrap();
        assert_eq!(record.last_rssi, Some(-60));
        assert_eq!(record.display_name.as_deref(), Some("Alpha 2"));
    }

    #[test]
    fn test_nameless_policy() {
        let mut reg = registry(NamelessDevicePolicy::Drop);
        assert_eq!(
            reg.on_device_discovered("B".into(), None, Some(-60), AdvertisementPayload::new()),
            Upsert::Dropped
        );
        assert!(reg.is_empty());

        reg.set_nameless_policy(NamelessDevicePolicy::Track);
        assert_eq!(
            reg.on_device_discovered("B".into(), None, Some(-60), AdvertisementPayload::new()),
            Upsert::Inserted
        );
        assert_eq!(reg.get(&"B".into()).unwrap().label(), "B");
    }

    #[test]
    fn test_require_unknown_device() {
        let reg = registry(NamelessDevicePolicy::Drop);
        let err = reg.require(&"missing".into()).unwrap_err();
        assert!(matches!(err, Error::UnknownDevice { .. }));
    }

    #[test]
    fn test_payload_service_uuids() {
        let payload = AdvertisementPayload::new()
            .with(LOCAL_NAME_KEY, AdvertisementValue::Text("BTDEV".into()))
            .with(SERVICE_UUIDS_KEY, AdvertisementValue::Uuids(vec![CHAT_SERVICE_UUID]));

        assert_eq!(payload.local_name(), Some("BTDEV"));
        assert_eq!(payload.service_uuids(), &[CHAT_SERVICE_UUID]);
        assert!(AdvertisementPayload::new().service_uuids().is_empty());
    }

    #[test]
    fn test_ordering_by_signal() {
        let mut reg = registry(NamelessDevicePolicy::Drop);
        reg.on_device_discovered("far".into(), Some("far".into()), Some(-88), AdvertisementPayload::new());
        reg.on_device_discovered("near".into(), Some("near".into()), Some(-41), AdvertisementPayload::new());
        reg.on_device_discovered("mid".into(), Some("mid".into()), Some(-70), AdvertisementPayload::new());

        let order: Vec<_> = reg.by_signal().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(order, vec!["near", "mid", "far"]);
        assert_eq!(reg.nearest().unwrap().id.as_str(), "near");
    }

    #[test]
    fn test_begin_session_keeps_live_connections() {
        let mut reg = registry(NamelessDevicePolicy::Drop);
        reg.on_device_discovered("idle".into(), Some("idle".into()), Some(-60), AdvertisementPayload::new());
        reg.on_device_discovered("busy".into(), Some("busy".into()), Some(-60), AdvertisementPayload::new());
        reg.get_mut(&"busy".into()).unwrap().connection.connect();

        reg.begin_session();

        assert_eq!(reg.len(), 1);
        assert!(reg.contains(&"busy".into()));
    }
}
