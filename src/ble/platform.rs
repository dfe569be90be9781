//! btleplug-backed [`CentralRadio`].
//!
//! Each command is spawned onto the runtime captured at construction and
//! reports its result as a [`CentralEvent`] on the channel returned by
//! [`BtleplugCentral::new`]. Adapter events (scan results, disconnects,
//! power changes) are pumped onto the same channel by a background task.

use btleplug::api::{
    Central, CentralEvent as StackEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::connection::ConnectOptions;
use crate::ble::gatt::{CharacteristicDescriptor, CharacteristicHandle, ServiceDescriptor};
use crate::ble::radio::{CentralEvent, CentralRadio};
use crate::ble::registry::{
    AdvertisementPayload, AdvertisementValue, DeviceId, LOCAL_NAME_KEY, SERVICE_UUIDS_KEY, TX_POWER_LEVEL_KEY,
};
use crate::error::{Error, Result};

type Peripherals = Arc<RwLock<HashMap<DeviceId, Peripheral>>>;

/// Central radio driving the first system Bluetooth adapter.
pub struct BtleplugCentral {
    adapter: Adapter,
    runtime: Handle,
    peripherals: Peripherals,
    event_tx: mpsc::UnboundedSender<CentralEvent>,
    pump: JoinHandle<()>,
}

impl BtleplugCentral {
    /// Open the first adapter and start pumping its events.
    ///
    /// The initial power state is the first event delivered.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<CentralEvent>)> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapter = manager
            .adapters()
            .await
            .map_err(Error::Bluetooth)?
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        Self::with_adapter(adapter).await
    }

    /// Drive a specific adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter's event stream cannot be opened.
    pub async fn with_adapter(adapter: Adapter) -> Result<(Self, mpsc::UnboundedReceiver<CentralEvent>)> {
        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let peripherals: Peripherals = Arc::new(RwLock::new(HashMap::new()));

        let initial = match adapter.adapter_state().await {
            Ok(state) => AdapterState::from(state),
            Err(e) => {
                warn!("Failed to read adapter state: {}", e);
                AdapterState::Unknown
            }
        };
        let _ = event_tx.send(CentralEvent::AdapterStateChanged(initial));

        let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
        let pump = {
            let adapter = adapter.clone();
            let peripherals = peripherals.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    if event_tx.is_closed() {
                        break;
                    }
                    Self::handle_stack_event(event, &adapter, &peripherals, &event_tx).await;
                }
                debug!("Adapter event stream ended");
            })
        };

        let central = Self {
            adapter,
            runtime: Handle::current(),
            peripherals,
            event_tx,
            pump,
        };
        Ok((central, event_rx))
    }

    /// The underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    async fn handle_stack_event(
        event: StackEvent,
        adapter: &Adapter,
        peripherals: &Peripherals,
        event_tx: &mpsc::UnboundedSender<CentralEvent>,
    ) {
        match event {
            StackEvent::DeviceDiscovered(id) | StackEvent::DeviceUpdated(id) => {
                trace!("Device seen: {:?}", id);
                Self::process_peripheral(adapter, id, peripherals, event_tx).await;
            }
            StackEvent::DeviceConnected(id) => {
                // Connect completion is reported by the connect task.
                debug!("Device connected: {:?}", id);
            }
            StackEvent::DeviceDisconnected(id) => {
                debug!("Device disconnected: {:?}", id);
                let _ = event_tx.send(CentralEvent::Disconnected {
                    id: DeviceId::new(id.to_string()),
                    reason: None,
                });
            }
            StackEvent::StateUpdate(state) => {
                let _ = event_tx.send(CentralEvent::AdapterStateChanged(state.into()));
            }
            // Advertisement fragments are picked up through the next
            // DeviceUpdated and its properties.
            other => trace!("Ignoring adapter event: {:?}", other),
        }
    }

    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Peripherals,
        event_tx: &mpsc::UnboundedSender<CentralEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        let device_id = DeviceId::new(id.to_string());
        peripherals.write().insert(device_id.clone(), peripheral);

        let _ = event_tx.send(CentralEvent::DeviceDiscovered {
            id: device_id,
            name: properties.local_name.clone(),
            rssi: properties.rssi,
            payload: advertisement_payload(&properties),
        });
    }

    fn peripheral(&self, id: &DeviceId) -> Option<Peripheral> {
        self.peripherals.read().get(id).cloned()
    }

    /// Run a command against a known peripheral in the background. The
    /// closure's error, if any, is reported with `on_error`.
    fn spawn_for<F, Fut>(&self, id: &DeviceId, command: F, on_error: fn(DeviceId, String) -> CentralEvent)
    where
        F: FnOnce(Peripheral, DeviceId, mpsc::UnboundedSender<CentralEvent>) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let event_tx = self.event_tx.clone();
        let Some(peripheral) = self.peripheral(id) else {
            warn!("No platform peripheral for {}", id);
            let _ = event_tx.send(on_error(id.clone(), format!("Unknown peripheral {}", id)));
            return;
        };

        let id = id.clone();
        let task = command(peripheral, id.clone(), event_tx.clone());
        self.runtime.spawn(async move {
            if let Err(e) = task.await {
                error!("Command for {} failed: {}", id, e);
                let _ = event_tx.send(on_error(id, e.to_string()));
            }
        });
    }
}

impl CentralRadio for BtleplugCentral {
    fn start_scan(&mut self, services: Vec<Uuid>) {
        let adapter = self.adapter.clone();
        let event_tx = self.event_tx.clone();
        self.runtime.spawn(async move {
            info!("Starting BLE scan (filter: {:?})", services);
            if let Err(e) = adapter.start_scan(ScanFilter { services }).await {
                error!("Failed to start scan: {}", e);
                let _ = event_tx.send(CentralEvent::ScanFailed { reason: e.to_string() });
            }
        });
    }

    fn stop_scan(&mut self) {
        let adapter = self.adapter.clone();
        self.runtime.spawn(async move {
            info!("Stopping BLE scan");
            if let Err(e) = adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
    }

    fn connect(&mut self, id: &DeviceId, options: &ConnectOptions) {
        let options = options.clone();
        self.spawn_for(
            id,
            move |peripheral, id, event_tx| async move {
                debug!("Connecting to {} with {:?}", id, options);
                if !options.start_delay.is_zero() {
                    tokio::time::sleep(options.start_delay).await;
                }
                peripheral.connect().await.map_err(Error::Bluetooth)?;
                let _ = event_tx.send(CentralEvent::Connected { id });
                Ok(())
            },
            |id, reason| CentralEvent::ConnectFailed { id, reason },
        );
    }

    fn cancel_connection(&mut self, id: &DeviceId) {
        self.spawn_for(
            id,
            |peripheral, id, _| async move {
                debug!("Cancelling connection to {}", id);
                peripheral.disconnect().await.map_err(Error::Bluetooth)
            },
            |id, reason| CentralEvent::Disconnected {
                id,
                reason: Some(reason),
            },
        );
    }

    fn discover_services(&mut self, id: &DeviceId, filter: Vec<Uuid>) {
        self.spawn_for(
            id,
            move |peripheral, id, event_tx| async move {
                peripheral.discover_services().await.map_err(Error::Bluetooth)?;

                let services: Vec<_> = peripheral
                    .services()
                    .into_iter()
                    .filter(|s| filter.is_empty() || filter.contains(&s.uuid))
                    .map(|s| ServiceDescriptor {
                        uuid: s.uuid,
                        primary: s.primary,
                    })
                    .collect();
                debug!("Discovered {} matching service(s) on {}", services.len(), id);

                let _ = event_tx.send(CentralEvent::ServicesDiscovered { id, services });
                Ok(())
            },
            |id, reason| CentralEvent::StackError { id, reason },
        );
    }

    fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, filter: Vec<Uuid>) {
        // btleplug resolves characteristics together with services, so the
        // answer is already cached on the peripheral.
        self.spawn_for(
            id,
            move |peripheral, id, event_tx| async move {
                let characteristics: Vec<_> = peripheral
                    .services()
                    .into_iter()
                    .filter(|s| s.uuid == service)
                    .flat_map(|s| s.characteristics)
                    .filter(|c| filter.is_empty() || filter.contains(&c.uuid))
                    .map(|c| CharacteristicDescriptor::new(c.uuid, c.service_uuid, c.properties.into()))
                    .collect();
                debug!(
                    "Found {} matching characteristic(s) in service {} on {}",
                    characteristics.len(),
                    service,
                    id
                );

                let _ = event_tx.send(CentralEvent::CharacteristicsDiscovered {
                    id,
                    service,
                    characteristics,
                });
                Ok(())
            },
            |id, reason| CentralEvent::StackError { id, reason },
        );
    }

    fn read_value(&mut self, id: &DeviceId, characteristic: &CharacteristicHandle) {
        let handle = *characteristic;
        self.spawn_for(
            id,
            move |peripheral, id, event_tx| async move {
                let characteristic = peripheral
                    .characteristics()
                    .into_iter()
                    .find(|c| c.uuid == handle.uuid && c.service_uuid == handle.service_uuid)
                    .ok_or_else(|| Error::NoCharacteristicResolved { id: id.to_string() })?;

                let data = peripheral.read(&characteristic).await.map_err(Error::Bluetooth)?;
                trace!("Read {} bytes from characteristic {}", data.len(), handle.uuid);

                let _ = event_tx.send(CentralEvent::ValueRead {
                    id,
                    characteristic: handle.uuid,
                    value: data.into(),
                });
                Ok(())
            },
            |id, reason| CentralEvent::ReadFailed { id, reason },
        );
    }

    fn read_rssi(&mut self, id: &DeviceId) {
        self.spawn_for(
            id,
            |peripheral, id, event_tx| async move {
                let rssi = peripheral
                    .properties()
                    .await
                    .map_err(Error::Bluetooth)?
                    .and_then(|p| p.rssi)
                    .ok_or_else(|| Error::Internal("stack reported no RSSI".to_string()))?;

                let _ = event_tx.send(CentralEvent::RssiRead { id, rssi });
                Ok(())
            },
            |id, reason| CentralEvent::ReadFailed { id, reason },
        );
    }
}

impl Drop for BtleplugCentral {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Flatten btleplug's advertisement properties into a payload.
fn advertisement_payload(properties: &PeripheralProperties) -> AdvertisementPayload {
    let mut payload = AdvertisementPayload::new();

    if let Some(name) = &properties.local_name {
        payload.insert(LOCAL_NAME_KEY, AdvertisementValue::Text(name.clone()));
    }
    if !properties.services.is_empty() {
        payload.insert(SERVICE_UUIDS_KEY, AdvertisementValue::Uuids(properties.services.clone()));
    }
    if let Some(tx_power) = properties.tx_power_level {
        payload.insert(TX_POWER_LEVEL_KEY, AdvertisementValue::Integer(tx_power.into()));
    }
    for (company, data) in &properties.manufacturer_data {
        payload.insert(
            format!("manufacturer_data/{:04x}", company),
            AdvertisementValue::Bytes(data.clone().into()),
        );
    }
    for (service, data) in &properties.service_data {
        payload.insert(
            format!("service_data/{}", service),
            AdvertisementValue::Bytes(data.clone().into()),
        );
    }

    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::uuids::CHAT_SERVICE_UUID;

    #[test]
    fn test_advertisement_payload() {
        let mut properties = PeripheralProperties::default();
        properties.local_name = Some("BTDEV".to_string());
        properties.services = vec![CHAT_SERVICE_UUID];
        properties.tx_power_level = Some(-4);
        properties.manufacturer_data.insert(0x004c, vec![1, 2]);

        let payload = advertisement_payload(&properties);
        assert_eq!(payload.local_name(), Some("BTDEV"));
        assert_eq!(payload.service_uuids(), &[CHAT_SERVICE_UUID]);
        assert_eq!(
            payload.get(TX_POWER_LEVEL_KEY),
            Some(&AdvertisementValue::Integer(-4))
        );
        assert!(payload.get("manufacturer_data/004c").is_some());
    }

    #[test]
    fn test_empty_advertisement() {
        assert!(advertisement_payload(&PeripheralProperties::default()).is_empty());
    }
}
