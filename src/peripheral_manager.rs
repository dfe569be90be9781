//! Async handle for the Peripheral role.
//!
//! Same shape as [`CentralManager`](crate::CentralManager): the
//! [`Advertiser`] lives on one task that serializes commands and radio
//! events, and publishes an [`AdvertiserStatus`] after every change.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ble::adapter::CommandOutcome;
use crate::ble::advertising::{Advertiser, AdvertiserConfig, AdvertiserStatus, PeripheralEvent, PeripheralRadio};
use crate::ble::loopback::{LoopbackHandle, LoopbackPeripheral};
use crate::central_manager::CallbackHandle;
use crate::error::{Error, Result};

enum Command {
    Register(Bytes, oneshot::Sender<CommandOutcome>),
    RemoveAll(oneshot::Sender<()>),
    UpdateValue(String, oneshot::Sender<CommandOutcome>),
    StartAdvertising(oneshot::Sender<CommandOutcome>),
    StopAdvertising(oneshot::Sender<CommandOutcome>),
    Shutdown(oneshot::Sender<()>),
}

/// Async front end for the Peripheral role.
pub struct PeripheralManager {
    command_tx: mpsc::UnboundedSender<Command>,
    status: Arc<RwLock<AdvertiserStatus>>,
    status_tx: broadcast::Sender<AdvertiserStatus>,
    callback_counter: AtomicU64,
    worker: RwLock<Option<JoinHandle<()>>>,
}

impl PeripheralManager {
    /// Create a manager on an in-process [`LoopbackPeripheral`]. The
    /// returned handle plays the remote Central.
    pub fn loopback(config: AdvertiserConfig) -> (Self, LoopbackHandle) {
        let (radio, events) = LoopbackPeripheral::new();
        let remote = radio.handle();
        (Self::with_radio(radio, events, config), remote)
    }

    /// Create a manager driving any Peripheral radio. `events` must carry
    /// the radio's callbacks.
    pub fn with_radio<P>(radio: P, events: mpsc::UnboundedReceiver<PeripheralEvent>, config: AdvertiserConfig) -> Self
    where
        P: PeripheralRadio + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = broadcast::channel(64);
        let status = Arc::new(RwLock::new(AdvertiserStatus::default()));

        let advertiser = Advertiser::new(radio, config);
        let worker = tokio::spawn(Self::run(
            advertiser,
            command_rx,
            events,
            status.clone(),
            status_tx.clone(),
        ));

        Self {
            command_tx,
            status,
            status_tx,
            callback_counter: AtomicU64::new(0),
            worker: RwLock::new(Some(worker)),
        }
    }

    async fn run<P: PeripheralRadio>(
        mut advertiser: Advertiser<P>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<PeripheralEvent>,
        status: Arc<RwLock<AdvertiserStatus>>,
        status_tx: broadcast::Sender<AdvertiserStatus>,
    ) {
        let publish = |advertiser: &Advertiser<P>| {
            if *status.read() != *advertiser.status() {
                let current = advertiser.status().clone();
                *status.write() = current.clone();
                let _ = status_tx.send(current);
            }
        };

        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    advertiser.handle_event(event);
                    publish(&advertiser);
                }
                command = command_rx.recv() => {
                    let Some(command) = command else {
                        break;
                    };
                    match command {
                        Command::Register(value, reply) => {
                            let outcome = advertiser.register_service_tree(value);
                            publish(&advertiser);
                            let _ = reply.send(outcome);
                        }
                        Command::RemoveAll(reply) => {
                            advertiser.remove_all();
                            publish(&advertiser);
                            let _ = reply.send(());
                        }
                        Command::UpdateValue(text, reply) => {
                            let outcome = advertiser.update_value(&text);
                            publish(&advertiser);
                            let _ = reply.send(outcome);
                        }
                        Command::StartAdvertising(reply) => {
                            let outcome = advertiser.start_advertising();
                            publish(&advertiser);
                            let _ = reply.send(outcome);
                        }
                        Command::StopAdvertising(reply) => {
                            let outcome = advertiser.stop_advertising();
                            publish(&advertiser);
                            let _ = reply.send(outcome);
                        }
                        Command::Shutdown(reply) => {
                            info!("Shutting down peripheral session");
                            advertiser.stop_advertising();
                            advertiser.remove_all();
                            publish(&advertiser);
                            let _ = reply.send(());
                            break;
                        }
                    }
                }
            }
        }

        debug!("Peripheral session task ended");
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Register the service tree holding `value`. No-op while a tree is
    /// registered.
    pub async fn register_service_tree(&self, value: impl Into<Bytes>) -> Result<CommandOutcome> {
        let value = value.into();
        self.request(|reply| Command::Register(value, reply)).await
    }

    /// Withdraw every registered service.
    pub async fn remove_all(&self) -> Result<()> {
        self.request(Command::RemoveAll).await
    }

    /// Replace the advertised value.
    pub async fn update_value(&self, text: impl Into<String>) -> Result<CommandOutcome> {
        let text = text.into();
        self.request(|reply| Command::UpdateValue(text, reply)).await
    }

    /// Start advertising.
    pub async fn start_advertising(&self) -> Result<CommandOutcome> {
        self.request(Command::StartAdvertising).await
    }

    /// Stop advertising.
    pub async fn stop_advertising(&self) -> Result<CommandOutcome> {
        self.request(Command::StopAdvertising).await
    }

    /// Latest published status.
    pub fn status(&self) -> AdvertiserStatus {
        self.status.read().clone()
    }

    /// Check if advertising is active.
    pub fn is_advertising(&self) -> bool {
        self.status.read().is_advertising
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AdvertiserStatus> {
        self.status_tx.subscribe()
    }

    /// Register a callback for status changes.
    pub fn on_status_changed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(AdvertiserStatus) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.status_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(status) = rx.recv().await {
                callback(status);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop advertising, withdraw the services and stop the session task.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await?;

        let worker = self.worker.write().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::AdapterState;
    use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
    use crate::utils::decode_message;
    use pretty_assertions::assert_eq;

    async fn read(remote: &LoopbackHandle) -> String {
        let value = remote
            .read("central", MESSAGE_CHARACTERISTIC_UUID, 0)
            .await
            .unwrap()
            .unwrap();
        decode_message(&value).text
    }

    #[tokio::test]
    async fn test_register_advertise_and_serve() {
        let (manager, remote) = PeripheralManager::loopback(AdvertiserConfig::default());

        assert_eq!(
            manager.register_service_tree("test").await.unwrap(),
            CommandOutcome::Issued
        );
        assert_eq!(
            manager.register_service_tree("abcd").await.unwrap(),
            CommandOutcome::NoOp
        );
        assert_eq!(manager.start_advertising().await.unwrap(), CommandOutcome::Issued);
        assert_eq!(manager.start_advertising().await.unwrap(), CommandOutcome::NoOp);
        assert!(manager.is_advertising());

        let payload = remote.advertisement().unwrap();
        assert_eq!(payload.local_name(), Some("BTDEV"));
        assert_eq!(payload.service_uuids(), &[CHAT_SERVICE_UUID]);

        assert_eq!(read(&remote).await, "test");

        manager.update_value("abcd").await.unwrap();
        assert_eq!(read(&remote).await, "abcd");
        assert_eq!(manager.status().value.as_deref(), Some("abcd"));
    }

    #[tokio::test]
    async fn test_power_off_stops_advertising() {
        let (manager, remote) = PeripheralManager::loopback(AdvertiserConfig::default());
        manager.register_service_tree("test").await.unwrap();
        manager.start_advertising().await.unwrap();

        let mut statuses = manager.subscribe();
        remote.set_adapter_state(AdapterState::PoweredOff);
        let status = statuses.recv().await.unwrap();
        assert!(!status.is_advertising);
        assert_eq!(status.adapter_state, AdapterState::PoweredOff);

        assert_eq!(
            manager.start_advertising().await.unwrap(),
            CommandOutcome::AdapterNotReady(AdapterState::PoweredOff)
        );
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (manager, remote) = PeripheralManager::loopback(AdvertiserConfig::default());
        manager.register_service_tree("test").await.unwrap();
        manager.start_advertising().await.unwrap();

        manager.shutdown().await.unwrap();
        assert!(remote.services().is_empty());
        assert!(remote.advertisement().is_none());
        assert!(matches!(
            manager.start_advertising().await,
            Err(Error::SessionClosed)
        ));
    }
}
