//! Peripheral role: local GATT tree and advertising.
//!
//! The [`Advertiser`] builds a one-service, one-characteristic GATT tree
//! holding the chat message, registers it with a [`PeripheralRadio`] and
//! advertises it under a fixed local name. The tree is never edited in
//! place: changing the value removes every service and registers a fresh
//! tree.

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterMonitor, AdapterState, CommandOutcome};
use crate::ble::gatt::{CharacteristicDescriptor, CharacteristicProperties, ServiceDescriptor};
use crate::ble::registry::{AdvertisementPayload, AdvertisementValue, DeviceId, LOCAL_NAME_KEY, SERVICE_UUIDS_KEY};
use crate::ble::uuids::{ADVERTISED_LOCAL_NAME, CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
use crate::utils::{decode_message, encode_message};

/// Default value of the message characteristic.
pub const DEFAULT_MESSAGE: &str = "test";

/// Configuration for the Peripheral role.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertiserConfig {
    /// Local name placed in the advertisement.
    pub local_name: String,
    /// Service registered in the GATT tree.
    pub service_uuid: Uuid,
    /// Characteristic holding the message.
    pub characteristic_uuid: Uuid,
}

impl Default for AdvertiserConfig {
    fn default() -> Self {
        Self {
            local_name: ADVERTISED_LOCAL_NAME.to_string(),
            service_uuid: CHAT_SERVICE_UUID,
            characteristic_uuid: MESSAGE_CHARACTERISTIC_UUID,
        }
    }
}

impl AdvertiserConfig {
    /// Set the advertised local name.
    pub fn with_local_name(mut self, name: impl Into<String>) -> Self {
        self.local_name = name.into();
        self
    }

    /// Set the service and characteristic UUIDs.
    pub fn with_uuids(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.service_uuid = service;
        self.characteristic_uuid = characteristic;
        self
    }
}

/// What gets registered: one service, one characteristic, one value.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertisementSpec {
    /// Service UUID.
    pub service_uuid: Uuid,
    /// Characteristic UUID.
    pub characteristic_uuid: Uuid,
    /// Characteristic value.
    pub value: Bytes,
}

/// A service and its characteristics, as handed to the radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceTree {
    /// The service.
    pub service: ServiceDescriptor,
    /// Its characteristics, values included.
    pub characteristics: Vec<CharacteristicDescriptor>,
}

impl GattServiceTree {
    /// Build the tree for `spec`: one primary service with one read-only
    /// characteristic.
    pub fn from_spec(spec: &AdvertisementSpec) -> Self {
        let mut characteristic = CharacteristicDescriptor::new(
            spec.characteristic_uuid,
            spec.service_uuid,
            CharacteristicProperties::READ_ONLY,
        );
        characteristic.cached_value = Some(spec.value.clone());

        Self {
            service: ServiceDescriptor::primary(spec.service_uuid),
            characteristics: vec![characteristic],
        }
    }

    /// Find a characteristic by UUID.
    pub fn characteristic(&self, uuid: Uuid) -> Option<&CharacteristicDescriptor> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Data placed in the advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementData {
    /// Local name.
    pub local_name: String,
    /// UUIDs of all registered services.
    pub service_uuids: Vec<Uuid>,
}

impl AdvertisementData {
    /// The payload a scanning Central would see.
    pub fn to_payload(&self) -> AdvertisementPayload {
        AdvertisementPayload::new()
            .with(LOCAL_NAME_KEY, AdvertisementValue::Text(self.local_name.clone()))
            .with(SERVICE_UUIDS_KEY, AdvertisementValue::Uuids(self.service_uuids.clone()))
    }
}

/// Identifies an incoming ATT request so it can be answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u64);

/// ATT error codes the Advertiser answers with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttError {
    /// No such attribute in the registered tree.
    AttributeNotFound,
    /// Offset is past the end of the value.
    InvalidOffset,
    /// The attribute is not readable.
    ReadNotPermitted,
}

/// Requests the Advertiser issues to the local radio stack.
#[cfg_attr(test, mockall::automock)]
pub trait PeripheralRadio {
    /// Publish a service tree.
    fn add_service(&mut self, tree: &GattServiceTree);

    /// Withdraw every published service.
    fn remove_all_services(&mut self);

    /// Start advertising.
    fn start_advertising(&mut self, data: &AdvertisementData);

    /// Stop advertising.
    fn stop_advertising(&mut self);

    /// Answer an ATT request.
    fn respond(&mut self, request: RequestId, result: std::result::Result<Bytes, AttError>);
}

/// Callbacks delivered by the local radio stack, one at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralEvent {
    /// The radio's power state changed.
    AdapterStateChanged(AdapterState),
    /// Advertising started, or failed to.
    AdvertisingStarted {
        /// Error from the stack, if any.
        error: Option<String>,
    },
    /// A service was published, or failed to be.
    ServiceAdded {
        /// The service.
        service: Uuid,
        /// Error from the stack, if any.
        error: Option<String>,
    },
    /// A Central subscribed to a characteristic.
    Subscribed {
        /// The remote Central.
        central: DeviceId,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// A Central unsubscribed from a characteristic.
    Unsubscribed {
        /// The remote Central.
        central: DeviceId,
        /// The characteristic.
        characteristic: Uuid,
    },
    /// A Central wants to read a characteristic.
    ReadRequest {
        /// Request to answer.
        request: RequestId,
        /// The remote Central.
        central: DeviceId,
        /// The characteristic.
        characteristic: Uuid,
        /// Byte offset into the value.
        offset: usize,
    },
    /// A Central wrote a characteristic.
    WriteRequest {
        /// Request to answer.
        request: RequestId,
        /// The remote Central.
        central: DeviceId,
        /// The characteristic.
        characteristic: Uuid,
        /// Value written.
        value: Bytes,
    },
    /// The stack can accept more notifications.
    ReadyToUpdateSubscribers,
}

/// Human-readable state published by the Advertiser.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AdvertiserStatus {
    /// Last reported radio state.
    pub adapter_state: AdapterState,
    /// Latest status line.
    pub status: String,
    /// Latest error.
    pub error: String,
    /// Whether advertising is active.
    pub is_advertising: bool,
    /// UUIDs of the registered services.
    pub registered_services: Vec<Uuid>,
    /// Current message value, if a tree is registered.
    pub value: Option<String>,
}

/// The Peripheral role's state machine.
pub struct Advertiser<P> {
    radio: P,
    config: AdvertiserConfig,
    adapter: AdapterMonitor,
    tree: Option<GattServiceTree>,
    status: AdvertiserStatus,
}

impl<P: PeripheralRadio> Advertiser<P> {
    /// Create an advertiser driving `radio`. Nothing is registered yet.
    pub fn new(radio: P, config: AdvertiserConfig) -> Self {
        Self {
            radio,
            config,
            adapter: AdapterMonitor::new(),
            tree: None,
            status: AdvertiserStatus::default(),
        }
    }

    /// Configuration.
    pub fn config(&self) -> &AdvertiserConfig {
        &self.config
    }

    /// Published status.
    pub fn status(&self) -> &AdvertiserStatus {
        &self.status
    }

    /// Check if advertising is active.
    pub fn is_advertising(&self) -> bool {
        self.status.is_advertising
    }

    /// The registered tree, if any.
    pub fn tree(&self) -> Option<&GattServiceTree> {
        self.tree.as_ref()
    }

    /// The radio this advertiser drives.
    pub fn radio(&self) -> &P {
        &self.radio
    }

    /// Mutable access to the radio.
    pub fn radio_mut(&mut self) -> &mut P {
        &mut self.radio
    }

    /// Register the service tree holding `value`.
    ///
    /// No-op while a tree is registered: call [`remove_all`](Self::remove_all)
    /// first, or use [`update_value`](Self::update_value).
    pub fn register_service_tree(&mut self, value: impl Into<Bytes>) -> CommandOutcome {
        if self.tree.is_some() {
            debug!("Service tree already registered, ignoring");
            return CommandOutcome::NoOp;
        }

        let spec = AdvertisementSpec {
            service_uuid: self.config.service_uuid,
            characteristic_uuid: self.config.characteristic_uuid,
            value: value.into(),
        };
        info!("Service UUID is {}", spec.service_uuid);
        info!("Characteristic UUID is {}", spec.characteristic_uuid);

        let tree = GattServiceTree::from_spec(&spec);
        self.radio.add_service(&tree);

        self.status.registered_services = vec![tree.service.uuid];
        self.status.value = Some(decode_message(&spec.value).text);
        self.tree = Some(tree);
        CommandOutcome::Issued
    }

    /// Withdraw every registered service.
    pub fn remove_all(&mut self) {
        self.radio.remove_all_services();
        self.tree = None;
        self.status.registered_services.clear();
        self.status.value = None;
        debug!("Removed all services");
    }

    /// Replace the advertised value: remove everything, then register a
    /// fresh tree.
    pub fn update_value(&mut self, text: &str) -> CommandOutcome {
        self.remove_all();
        self.register_service_tree(encode_message(text))
    }

    /// Start advertising the registered services.
    pub fn start_advertising(&mut self) -> CommandOutcome {
        if !self.adapter.is_ready() {
            return self.not_ready("start advertising");
        }
        if self.status.is_advertising {
            debug!("Already started advertising");
            return CommandOutcome::NoOp;
        }

        let data = AdvertisementData {
            local_name: self.config.local_name.clone(),
            service_uuids: self.status.registered_services.clone(),
        };
        self.radio.start_advertising(&data);
        self.status.is_advertising = true;
        self.status.status = "Advertising".to_string();
        info!("Advertising as {}", data.local_name);
        CommandOutcome::Issued
    }

    /// Stop advertising.
    pub fn stop_advertising(&mut self) -> CommandOutcome {
        if !self.adapter.is_ready() {
            return self.not_ready("stop advertising");
        }
        if !self.status.is_advertising {
            debug!("Already stopped advertising");
            return CommandOutcome::NoOp;
        }

        self.radio.stop_advertising();
        self.status.is_advertising = false;
        self.status.status = "Stopped advertising".to_string();
        info!("Stopped advertising");
        CommandOutcome::Issued
    }

    /// Process one radio event.
    pub fn handle_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::AdapterStateChanged(state) => {
                self.adapter.on_state_changed(state);
                self.status.adapter_state = state;
                self.status.status = state.to_string();
                if !state.is_powered_on() {
                    self.status.is_advertising = false;
                }
            }
            PeripheralEvent::AdvertisingStarted { error } => {
                info!("Started advertising");
                if let Some(error) = error {
                    warn!("Advertising failed: {}", error);
                    self.status.is_advertising = false;
                    self.status.error = error;
                }
            }
            PeripheralEvent::ServiceAdded { service, error } => match error {
                Some(error) => {
                    warn!("Failed to add service {}: {}", service, error);
                    self.status.error = error;
                }
                None => debug!("Added service {}", service),
            },
            PeripheralEvent::Subscribed {
                central,
                characteristic,
            } => info!("{} subscribed to {}", central, characteristic),
            PeripheralEvent::Unsubscribed {
                central,
                characteristic,
            } => info!("{} unsubscribed from {}", central, characteristic),
            PeripheralEvent::ReadRequest {
                request,
                central,
                characteristic,
                offset,
            } => {
                info!("Received READ request from {} for {}", central, characteristic);
                let result = self.read_response(characteristic, offset);
                self.radio.respond(request, result);
            }
            PeripheralEvent::WriteRequest {
                request,
                central,
                characteristic,
                value,
            } => {
                info!(
                    "Received WRITE request from {} for {} ({} bytes)",
                    central,
                    characteristic,
                    value.len()
                );
                self.radio.respond(request, Ok(Bytes::new()));
            }
            PeripheralEvent::ReadyToUpdateSubscribers => {
                debug!("Peripheral manager is ready to update subscribers");
            }
        }
    }

    fn read_response(&self, characteristic: Uuid, offset: usize) -> std::result::Result<Bytes, AttError> {
        let found = self
            .tree
            .as_ref()
            .and_then(|tree| tree.characteristic(characteristic))
            .ok_or(AttError::AttributeNotFound)?;
        if !found.properties.read {
            return Err(AttError::ReadNotPermitted);
        }

        let value = found.cached_value.clone().unwrap_or_default();
        if offset > value.len() {
            return Err(AttError::InvalidOffset);
        }
        Ok(value.slice(offset..))
    }

    fn not_ready(&mut self, operation: &str) -> CommandOutcome {
        let state = self.adapter.state();
        debug!("Cannot {}: Bluetooth is {}", operation, state);
        self.status.status = format!("Cannot {}: Bluetooth is {}", operation, state);
        CommandOutcome::AdapterNotReady(state)
    }
}
