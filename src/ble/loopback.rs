//! In-process Peripheral radio.
//!
//! btleplug only implements the Central role, so the Peripheral role runs
//! against [`LoopbackPeripheral`]: it records the published tree and
//! advertisement, acknowledges them with the events a real stack would
//! send, and lets a [`LoopbackHandle`] play the remote Central.

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::adapter::AdapterState;
use crate::ble::advertising::{
    AdvertisementData, AttError, GattServiceTree, PeripheralEvent, PeripheralRadio, RequestId,
};
use crate::ble::registry::{AdvertisementPayload, DeviceId};

type Pending = HashMap<RequestId, oneshot::Sender<std::result::Result<Bytes, AttError>>>;

#[derive(Default)]
struct Shared {
    services: RwLock<Vec<GattServiceTree>>,
    advertisement: RwLock<Option<AdvertisementData>>,
    pending: RwLock<Pending>,
    next_request: AtomicU64,
}

/// Peripheral radio that lives entirely in this process.
pub struct LoopbackPeripheral {
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<PeripheralEvent>,
}

impl LoopbackPeripheral {
    /// Create a powered-on loopback radio. The returned receiver yields its
    /// events, starting with the power state.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PeripheralEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(PeripheralEvent::AdapterStateChanged(AdapterState::PoweredOn));

        let radio = Self {
            shared: Arc::new(Shared::default()),
            event_tx,
        };
        (radio, event_rx)
    }

    /// Handle for playing the remote side.
    pub fn handle(&self) -> LoopbackHandle {
        LoopbackHandle {
            shared: self.shared.clone(),
            event_tx: self.event_tx.clone(),
        }
    }

    fn emit(&self, event: PeripheralEvent) {
        if self.event_tx.send(event).is_err() {
            trace!("Loopback event dropped: receiver closed");
        }
    }
}

impl PeripheralRadio for LoopbackPeripheral {
    fn add_service(&mut self, tree: &GattServiceTree) {
        debug!("Loopback: adding service {}", tree.service.uuid);
        self.shared.services.write().push(tree.clone());
        self.emit(PeripheralEvent::ServiceAdded {
            service: tree.service.uuid,
            error: None,
        });
    }

    fn remove_all_services(&mut self) {
        debug!("Loopback: removing all services");
        self.shared.services.write().clear();
    }

    fn start_advertising(&mut self, data: &AdvertisementData) {
        debug!("Loopback: advertising {:?}", data);
        *self.shared.advertisement.write() = Some(data.clone());
        self.emit(PeripheralEvent::AdvertisingStarted { error: None });
    }

    fn stop_advertising(&mut self) {
        debug!("Loopback: advertising stopped");
        *self.shared.advertisement.write() = None;
    }

    fn respond(&mut self, request: RequestId, result: std::result::Result<Bytes, AttError>) {
        match self.shared.pending.write().remove(&request) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => warn!("Response to unknown request {:?}", request),
        }
    }
}

/// The remote side of a [`LoopbackPeripheral`].
#[derive(Clone)]
pub struct LoopbackHandle {
    shared: Arc<Shared>,
    event_tx: mpsc::UnboundedSender<PeripheralEvent>,
}

impl LoopbackHandle {
    /// Services currently published.
    pub fn services(&self) -> Vec<GattServiceTree> {
        self.shared.services.read().clone()
    }

    /// Current advertisement, as a scanning Central would see it.
    pub fn advertisement(&self) -> Option<AdvertisementPayload> {
        self.shared
            .advertisement
            .read()
            .as_ref()
            .map(AdvertisementData::to_payload)
    }

    /// Report a power-state change.
    pub fn set_adapter_state(&self, state: AdapterState) {
        let _ = self.event_tx.send(PeripheralEvent::AdapterStateChanged(state));
    }

    /// Issue a read as `central`. The receiver completes once the
    /// Advertiser answers.
    pub fn read(
        &self,
        central: impl Into<DeviceId>,
        characteristic: Uuid,
        offset: usize,
    ) -> oneshot::Receiver<std::result::Result<Bytes, AttError>> {
        let (request, reply) = self.register();
        let _ = self.event_tx.send(PeripheralEvent::ReadRequest {
            request,
            central: central.into(),
            characteristic,
            offset,
        });
        reply
    }

    /// Issue a write as `central`.
    pub fn write(
        &self,
        central: impl Into<DeviceId>,
        characteristic: Uuid,
        value: impl Into<Bytes>,
    ) -> oneshot::Receiver<std::result::Result<Bytes, AttError>> {
        let (request, reply) = self.register();
        let _ = self.event_tx.send(PeripheralEvent::WriteRequest {
            request,
            central: central.into(),
            characteristic,
            value: value.into(),
        });
        reply
    }

    /// Subscribe as `central`.
    pub fn subscribe(&self, central: impl Into<DeviceId>, characteristic: Uuid) {
        let _ = self.event_tx.send(PeripheralEvent::Subscribed {
            central: central.into(),
            characteristic,
        });
    }

    /// Unsubscribe as `central`.
    pub fn unsubscribe(&self, central: impl Into<DeviceId>, characteristic: Uuid) {
        let _ = self.event_tx.send(PeripheralEvent::Unsubscribed {
            central: central.into(),
            characteristic,
        });
    }

    fn register(&self) -> (RequestId, oneshot::Receiver<std::result::Result<Bytes, AttError>>) {
        let request = RequestId(self.shared.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.shared.pending.write().insert(request, tx);
        (request, rx)
    }
}
