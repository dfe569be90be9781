//! Central role session.
//!
//! [`CentralSession`] composes the adapter monitor, device registry,
//! per-device connection controllers and the GATT cache. It owns no task
//! and performs no I/O of its own: callers feed it commands and radio
//! events one at a time from a single context, and it drives the radio
//! through the [`CentralRadio`] trait. See
//! [`CentralManager`](crate::CentralManager) for the async wrapper.

use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::{AdapterMonitor, AdapterState, CommandOutcome};
use crate::ble::connection::{ConnectOptions, ConnectionAction, ConnectionController, ConnectionState, Transition};
use crate::ble::gatt::GattCache;
use crate::ble::radio::{CentralEvent, CentralRadio};
use crate::ble::registry::{DeviceId, DeviceRecord, DeviceRegistry, NamelessDevicePolicy, Upsert};
use crate::ble::rssi::SignalTier;
use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
use crate::error::{Error, Result};
use crate::utils::decode_message;

/// Configuration for a Central session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CentralConfig {
    /// Only report devices advertising this service. `None` scans for all.
    pub scan_service_filter: Option<Uuid>,
    /// Service searched after connecting.
    pub target_service: Uuid,
    /// Characteristic holding the message.
    pub target_characteristic: Uuid,
    /// What to do with scan results that carry no name.
    pub nameless_policy: NamelessDevicePolicy,
    /// Options passed with every connect request.
    pub connect_options: ConnectOptions,
    /// Stop an active scan as soon as a link comes up.
    pub stop_scan_on_connect: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            scan_service_filter: Some(CHAT_SERVICE_UUID),
            target_service: CHAT_SERVICE_UUID,
            target_characteristic: MESSAGE_CHARACTERISTIC_UUID,
            nameless_policy: NamelessDevicePolicy::Drop,
            connect_options: ConnectOptions::default(),
            stop_scan_on_connect: true,
        }
    }
}

impl CentralConfig {
    /// Set the scan filter.
    pub fn with_scan_filter(mut self, service: Option<Uuid>) -> Self {
        self.scan_service_filter = service;
        self
    }

    /// Set the nameless-device policy.
    pub fn with_nameless_policy(mut self, policy: NamelessDevicePolicy) -> Self {
        self.nameless_policy = policy;
        self
    }

    /// Set the connect options.
    pub fn with_connect_options(mut self, options: ConnectOptions) -> Self {
        self.connect_options = options;
        self
    }

    /// Set whether a successful connect stops scanning.
    pub fn with_stop_scan_on_connect(mut self, stop: bool) -> Self {
        self.stop_scan_on_connect = stop;
        self
    }

    /// Set the service and characteristic searched after connecting.
    pub fn with_target(mut self, service: Uuid, characteristic: Uuid) -> Self {
        self.target_service = service;
        self.target_characteristic = characteristic;
        self
    }
}

/// Human-readable state published by a Central session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionStatus {
    /// Last reported radio state.
    pub adapter_state: AdapterState,
    /// Latest session-level status line.
    pub status: String,
    /// Latest session-level error.
    pub error: String,
    /// Latest status line about the connected device.
    pub peripheral_output: String,
    /// Latest error about the connected device.
    pub peripheral_error: String,
    /// Latest message read from any device.
    pub last_message: Option<String>,
    /// Whether a scan is active.
    pub is_scanning: bool,
}

/// Change notifications emitted while processing commands and events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The radio's power state changed.
    AdapterStateChanged(AdapterState),
    /// Scanning started or stopped.
    ScanningChanged(bool),
    /// A device was seen for the first time.
    DeviceDiscovered(DeviceId),
    /// A known device was seen again.
    DeviceUpdated(DeviceId),
    /// A device entered a new connection state.
    ConnectionStateChanged {
        /// The device.
        id: DeviceId,
        /// The state entered.
        state: ConnectionState,
    },
    /// A message was read.
    MessageRead {
        /// The device.
        id: DeviceId,
        /// Decoded text.
        message: String,
    },
    /// A signal strength reading arrived.
    RssiRead {
        /// The device.
        id: DeviceId,
        /// Reading in dBm.
        rssi: i16,
        /// Classified tier.
        tier: SignalTier,
    },
    /// The registry was cleared.
    RegistryReset,
    /// Status lines or flags changed since the last drain.
    StatusChanged(SessionStatus),
}

/// Copy of a session's published state.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionSnapshot {
    /// Status lines and flags.
    pub status: SessionStatus,
    /// All known devices, ordered by id.
    pub devices: Vec<DeviceRecord>,
}

impl SessionSnapshot {
    /// Look up a device.
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| &d.id == id)
    }
}

/// The Central role's state machine.
pub struct CentralSession<R> {
    radio: R,
    config: CentralConfig,
    adapter: AdapterMonitor,
    registry: DeviceRegistry,
    gatt: GattCache,
    status: SessionStatus,
    published: SessionStatus,
    updates: Vec<SessionUpdate>,
}

impl<R: CentralRadio> CentralSession<R> {
    /// Create a session driving `radio`.
    pub fn new(radio: R, config: CentralConfig) -> Self {
        let template = ConnectionController::new(config.target_service, config.target_characteristic);
        Self {
            radio,
            registry: DeviceRegistry::new(config.nameless_policy, template),
            config,
            adapter: AdapterMonitor::new(),
            gatt: GattCache::new(),
            status: SessionStatus::default(),
            published: SessionStatus::default(),
            updates: Vec::new(),
        }
    }

    // === Queries ===

    /// Session configuration.
    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Last reported radio state.
    pub fn adapter_state(&self) -> AdapterState {
        self.adapter.state()
    }

    /// Check if the radio is powered on.
    pub fn is_ready(&self) -> bool {
        self.adapter.is_ready()
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.status.is_scanning
    }

    /// Published status.
    pub fn status(&self) -> &SessionStatus {
        &self.status
    }

    /// Known devices.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Look up a device.
    pub fn device(&self, id: &DeviceId) -> Option<&DeviceRecord> {
        self.registry.get(id)
    }

    /// Resolved characteristic handles.
    pub fn gatt(&self) -> &GattCache {
        &self.gatt
    }

    /// The radio this session drives.
    pub fn radio(&self) -> &R {
        &self.radio
    }

    /// Mutable access to the radio.
    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    /// Copy the published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        let mut devices: Vec<_> = self.registry.iter().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        SessionSnapshot {
            status: self.status.clone(),
            devices,
        }
    }

    /// Take the change notifications accumulated since the last call. A
    /// trailing [`SessionUpdate::StatusChanged`] is added when the published
    /// status differs from the previous drain.
    pub fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        if self.status != self.published {
            self.published = self.status.clone();
            self.updates.push(SessionUpdate::StatusChanged(self.published.clone()));
        }
        std::mem::take(&mut self.updates)
    }

    // === Commands ===

    /// Start a scan session. Clears devices from the previous session.
    pub fn start_scanning(&mut self) -> CommandOutcome {
        if !self.adapter.is_ready() {
            return self.not_ready("start scanning");
        }
        if self.status.is_scanning {
            debug!("Central manager is already scanning...");
            return CommandOutcome::NoOp;
        }

        self.registry.begin_session();
        let filter: Vec<Uuid> = self.config.scan_service_filter.into_iter().collect();
        self.radio.start_scan(filter);
        self.set_scanning(true);
        self.status.status = "Started scanning".to_string();
        info!("Started scanning");
        CommandOutcome::Issued
    }

    /// Stop the active scan.
    pub fn stop_scanning(&mut self) -> CommandOutcome {
        if !self.adapter.is_ready() {
            return self.not_ready("stop scanning");
        }
        if !self.status.is_scanning {
            debug!("Central manager already stopped scanning...");
            return CommandOutcome::NoOp;
        }

        self.radio.stop_scan();
        self.set_scanning(false);
        self.status.status = "Stopped scanning".to_string();
        info!("Stopped scanning");
        CommandOutcome::Issued
    }

    /// Connect to a known device. Discovery follows automatically.
    pub fn connect(&mut self, id: &DeviceId) -> Result<CommandOutcome> {
        if !self.adapter.is_ready() {
            return Ok(self.not_ready("connect"));
        }

        let (label, transition) = match self.registry.require_mut(id) {
            Ok(record) => (record.label().to_string(), record.connection.connect()),
            Err(e) => return self.fail(e),
        };

        if !transition.changed() {
            self.status.status = format!("Already {} with {}", transition.from, label);
            return Ok(CommandOutcome::NoOp);
        }

        info!("Attempting to connect to {}", label);
        self.status.status = format!("Attempting to connect to {}", label);
        self.apply(id, transition);
        Ok(CommandOutcome::Issued)
    }

    /// Disconnect from a device. Idempotent; the cached characteristic is
    /// dropped before this returns.
    pub fn disconnect(&mut self, id: &DeviceId) -> Result<CommandOutcome> {
        let transition = match self.registry.require_mut(id) {
            Ok(record) => record.connection.disconnect(),
            Err(e) => return self.fail(e),
        };

        // The cache is cleared even when the state machine had nothing to do.
        self.gatt.invalidate(id);

        if !transition.changed() {
            return Ok(CommandOutcome::NoOp);
        }

        info!("Disconnecting from {}", id);
        self.apply(id, transition);
        Ok(CommandOutcome::Issued)
    }

    /// Read the message characteristic. The decoded text is published when
    /// the read completes.
    pub fn read_value(&mut self, id: &DeviceId) -> Result<CommandOutcome> {
        let ready = match self.registry.require(id) {
            Ok(record) => record.connection_state().is_ready(),
            Err(e) => return self.fail(e),
        };

        let handle = match self.gatt.get(id) {
            Some(handle) if ready => *handle,
            _ => {
                self.status.error = "No characteristic found to read the message".to_string();
                warn!("No characteristic found to read the message from {}", id);
                return Err(Error::NoCharacteristicResolved { id: id.to_string() });
            }
        };

        trace!("Reading characteristic {} from {}", handle.uuid, id);
        self.radio.read_value(id, &handle);
        Ok(CommandOutcome::Issued)
    }

    /// Read the link's signal strength.
    pub fn read_signal_strength(&mut self, id: &DeviceId) -> Result<CommandOutcome> {
        let link_up = match self.registry.require(id) {
            Ok(record) => record.connection_state().is_link_up(),
            Err(e) => return self.fail(e),
        };
        if !link_up {
            return self.fail(Error::NotConnected { id: id.to_string() });
        }

        self.radio.read_rssi(id);
        Ok(CommandOutcome::Issued)
    }

    /// Forget every known device. Live links are cancelled first.
    pub fn reset_registry(&mut self) {
        let active: Vec<DeviceId> = self
            .registry
            .iter()
            .filter(|r| r.connection_state().is_active())
            .map(|r| r.id.clone())
            .collect();
        for id in active {
            if let Err(e) = self.disconnect(&id) {
                warn!("Failed to disconnect {} on reset: {}", id, e);
            }
        }

        self.registry.reset();
        self.gatt.clear();
        self.updates.push(SessionUpdate::RegistryReset);
        debug!("Device registry reset");
    }

    // === Events ===

    /// Process one radio event.
    pub fn handle_event(&mut self, event: CentralEvent) {
        trace!("Handling {:?}", event);

        match event {
            CentralEvent::AdapterStateChanged(state) => self.on_adapter_state(state),
            CentralEvent::DeviceDiscovered {
                id,
                name,
                rssi,
                payload,
            } => match self.registry.on_device_discovered(id.clone(), name, rssi, payload) {
                Upsert::Inserted => self.updates.push(SessionUpdate::DeviceDiscovered(id)),
                Upsert::Updated => self.updates.push(SessionUpdate::DeviceUpdated(id)),
                Upsert::Dropped => {}
            },
            CentralEvent::ScanFailed { reason } => {
                warn!("Scan failed: {}", reason);
                self.set_scanning(false);
                self.status.error = reason;
            }
            CentralEvent::Connected { id } => {
                let Some((label, transition)) = self.drive(&id, ConnectionController::on_connected) else {
                    return;
                };
                if !transition.changed() {
                    // The caller gave up on this attempt before the link came up.
                    if transition.from.is_terminal() {
                        info!("Late connect for peripheral {}, cancelling", label);
                        self.radio.cancel_connection(&id);
                    }
                    return;
                }
                if self.config.stop_scan_on_connect && self.status.is_scanning {
                    self.stop_scanning();
                }
                info!("Successfully connected to peripheral {}", label);
                self.status.peripheral_output = format!("Successfully connected to peripheral {}", label);
                self.apply(&id, transition);
            }
            CentralEvent::ConnectFailed { id, reason } => {
                let Some((label, transition)) = self.drive(&id, |c| c.on_connect_failed(reason.clone())) else {
                    return;
                };
                if !transition.changed() {
                    debug!("Connect failure for {} after the attempt ended: {}", label, reason);
                    return;
                }
                warn!("Failed to connect to peripheral {}: {}", label, reason);
                self.status.peripheral_output = format!("Failed to connect to peripheral {}", label);
                self.status.peripheral_error = reason;
                self.apply(&id, transition);
            }
            CentralEvent::Disconnected { id, reason } => {
                self.gatt.invalidate(&id);
                let Some((label, transition)) = self.drive(&id, ConnectionController::on_disconnected) else {
                    return;
                };
                if transition.changed() {
                    info!("Disconnected from peripheral {}", label);
                    self.status.status = format!("Disconnected from peripheral {}", label);
                }
                if let Some(reason) = reason {
                    warn!("Disconnect from {} reported: {}", label, reason);
                    self.status.error = reason;
                }
                self.apply(&id, transition);
            }
            CentralEvent::ServicesDiscovered { id, services } => {
                let Some((label, transition)) =
                    self.drive(&id, |c| c.on_services_discovered(&services))
                else {
                    return;
                };
                debug!("Discovered {} service(s) for peripheral {}", services.len(), label);
                self.status.peripheral_output = format!("Discovered services for peripheral {}", label);
                self.apply(&id, transition);
            }
            CentralEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => {
                let Some((label, transition)) =
                    self.drive(&id, |c| c.on_characteristics_discovered(service, &characteristics))
                else {
                    return;
                };
                self.status.peripheral_output = if transition.to().is_ready() {
                    info!("Peripheral {} is ready", label);
                    "Discovered services and found 'message' characteristic".to_string()
                } else {
                    format!("Discovered characteristics for peripheral {}", label)
                };
                self.apply(&id, transition);
            }
            CentralEvent::ValueRead {
                id,
                characteristic,
                value,
            } => self.on_value_read(id, characteristic, &value),
            CentralEvent::ReadFailed { id, reason } => {
                warn!("Read from {} failed: {}", id, reason);
                self.status.peripheral_error = reason;
            }
            CentralEvent::RssiRead { id, rssi } => {
                let Some(record) = self.registry.get_mut(&id) else {
                    warn!("RSSI read for unknown device {}", id);
                    return;
                };
                record.last_rssi = Some(rssi);
                let tier = SignalTier::classify(rssi);
                info!("Read RSSI for peripheral {} - {}", record.label(), rssi);
                self.status.peripheral_output = format!("Read RSSI for peripheral {} - {}", record.label(), rssi);
                self.updates.push(SessionUpdate::RssiRead { id, rssi, tier });
            }
            CentralEvent::StackError { id, reason } => {
                let Some((label, transition)) = self.drive(&id, |c| c.on_stack_error(reason.clone())) else {
                    return;
                };
                warn!("Stack error for {}: {}", label, reason);
                self.status.peripheral_error = reason;
                self.apply(&id, transition);
            }
        }
    }

    fn on_adapter_state(&mut self, state: AdapterState) {
        let old = self.adapter.on_state_changed(state);
        self.status.adapter_state = state;
        self.status.status = state.to_string();
        if old != state {
            self.updates.push(SessionUpdate::AdapterStateChanged(state));
        }

        if state.is_powered_on() {
            return;
        }

        // The stack stops scans and drops links when the radio goes away.
        self.set_scanning(false);
        let live: Vec<DeviceId> = self
            .registry
            .iter()
            .filter(|r| r.connection_state().is_active())
            .map(|r| r.id.clone())
            .collect();
        for id in live {
            if let Some((_, transition)) = self.drive(&id, ConnectionController::on_disconnected) {
                self.apply(&id, transition);
            }
        }
    }

    fn on_value_read(&mut self, id: DeviceId, characteristic: Uuid, value: &[u8]) {
        // A read that completes after the link dropped must not publish.
        if self.gatt.get(&id).map(|h| h.uuid) != Some(characteristic) {
            debug!("Discarding read of {} from {}: not resolved", characteristic, id);
            return;
        }
        let Some(record) = self.registry.get_mut(&id) else {
            return;
        };

        let decoded = decode_message(value);
        if decoded.lossy {
            warn!(
                "Message from {} was not valid UTF-8; decoded with replacements",
                record.label()
            );
        }
        debug!("Read message from {}: {:?}", record.label(), decoded.text);

        record.last_message = Some(decoded.text.clone());
        self.status.last_message = Some(decoded.text.clone());
        self.updates.push(SessionUpdate::MessageRead {
            id,
            message: decoded.text,
        });
    }

    /// Run one controller input for a device, returning its label.
    fn drive(
        &mut self,
        id: &DeviceId,
        input: impl FnOnce(&mut ConnectionController) -> Transition,
    ) -> Option<(String, Transition)> {
        match self.registry.get_mut(id) {
            Some(record) => {
                let transition = input(&mut record.connection);
                Some((record.label().to_string(), transition))
            }
            None => {
                warn!("Event for unknown device {}, ignoring", id);
                None
            }
        }
    }

    fn apply(&mut self, id: &DeviceId, transition: Transition) {
        for action in transition.actions {
            match action {
                ConnectionAction::InvalidateCache => {
                    self.gatt.invalidate(id);
                }
                ConnectionAction::CacheCharacteristic(handle) => self.gatt.insert(id.clone(), handle),
                ConnectionAction::RequestConnect => {
                    self.radio.connect(id, &self.config.connect_options);
                }
                ConnectionAction::CancelConnection => self.radio.cancel_connection(id),
                ConnectionAction::DiscoverServices { filter } => self.radio.discover_services(id, filter),
                ConnectionAction::DiscoverCharacteristics { service, filter } => {
                    self.radio.discover_characteristics(id, service, filter)
                }
            }
        }

        for state in transition.visited {
            self.updates.push(SessionUpdate::ConnectionStateChanged {
                id: id.clone(),
                state,
            });
        }
    }

    fn set_scanning(&mut self, scanning: bool) {
        if self.status.is_scanning != scanning {
            self.status.is_scanning = scanning;
            self.updates.push(SessionUpdate::ScanningChanged(scanning));
        }
    }

    fn not_ready(&mut self, operation: &str) -> CommandOutcome {
        let state = self.adapter.state();
        debug!("Cannot {}: Bluetooth is {}", operation, state);
        self.status.status = format!("Cannot {}: Bluetooth is {}", operation, state);
        CommandOutcome::AdapterNotReady(state)
    }

    fn fail<T>(&mut self, error: Error) -> Result<T> {
        warn!("{}", error);
        self.status.error = error.to_string();
        Err(error)
    }
}
