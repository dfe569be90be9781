//! Async handle for the Central role.
//!
//! A [`CentralManager`] owns a [`CentralSession`] on one background task.
//! Commands from any number of callers and events from the radio are
//! processed there one at a time, so no two callbacks ever interleave.
//! After each step the task publishes a fresh [`SessionSnapshot`] and
//! broadcasts the [`SessionUpdate`]s it produced.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ble::adapter::CommandOutcome;
use crate::ble::connection::ConnectionState;
use crate::ble::platform::BtleplugCentral;
use crate::ble::radio::{CentralEvent, CentralRadio};
use crate::ble::registry::{DeviceId, DeviceRecord};
use crate::error::{Error, Result};
use crate::session::{CentralConfig, CentralSession, SessionSnapshot, SessionStatus, SessionUpdate};

/// Handle returned when registering a callback. The callback stays
/// registered until the handle is dropped or [`unregister`](Self::unregister)
/// is called.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

enum Command {
    StartScanning(oneshot::Sender<CommandOutcome>),
    StopScanning(oneshot::Sender<CommandOutcome>),
    Connect(DeviceId, oneshot::Sender<Result<CommandOutcome>>),
    Disconnect(DeviceId, oneshot::Sender<Result<CommandOutcome>>),
    ReadValue(DeviceId, oneshot::Sender<Result<CommandOutcome>>),
    ReadSignalStrength(DeviceId, oneshot::Sender<Result<CommandOutcome>>),
    ResetRegistry(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Publishes the session's state from the session task.
struct Publisher {
    snapshot: Arc<RwLock<SessionSnapshot>>,
    update_tx: broadcast::Sender<SessionUpdate>,
}

impl Publisher {
    fn publish<R: CentralRadio>(&self, session: &mut CentralSession<R>) {
        let updates = session.drain_updates();
        if updates.is_empty() {
            return;
        }

        *self.snapshot.write() = session.snapshot();
        for update in updates {
            let _ = self.update_tx.send(update);
        }
    }

    /// Run a command, publish its effects, then answer the caller, so a
    /// caller never observes a snapshot older than its own command.
    fn reply<R: CentralRadio, T>(
        &self,
        session: &mut CentralSession<R>,
        reply: oneshot::Sender<T>,
        command: impl FnOnce(&mut CentralSession<R>) -> T,
    ) {
        let value = command(session);
        self.publish(session);
        let _ = reply.send(value);
    }
}

/// Async front end for a Central session.
pub struct CentralManager {
    command_tx: mpsc::UnboundedSender<Command>,
    snapshot: Arc<RwLock<SessionSnapshot>>,
    update_tx: broadcast::Sender<SessionUpdate>,
    callback_counter: AtomicU64,
    worker: RwLock<Option<JoinHandle<()>>>,
}

impl CentralManager {
    /// Create a manager on the system's first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(CentralConfig::default()).await
    }

    /// Create a manager on the system's first Bluetooth adapter with a
    /// custom configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn with_config(config: CentralConfig) -> Result<Self> {
        let (radio, events) = BtleplugCentral::new().await?;
        Ok(Self::with_radio(radio, events, config))
    }

    /// Create a manager driving any radio. `events` must carry the radio's
    /// callbacks.
    pub fn with_radio<R>(radio: R, events: mpsc::UnboundedReceiver<CentralEvent>, config: CentralConfig) -> Self
    where
        R: CentralRadio + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (update_tx, _) = broadcast::channel(256);
        let snapshot = Arc::new(RwLock::new(SessionSnapshot::default()));

        let session = CentralSession::new(radio, config);
        let worker = tokio::spawn(Self::run(
            session,
            command_rx,
            events,
            snapshot.clone(),
            update_tx.clone(),
        ));

        Self {
            command_tx,
            snapshot,
            update_tx,
            callback_counter: AtomicU64::new(0),
            worker: RwLock::new(Some(worker)),
        }
    }

    async fn run<R: CentralRadio>(
        mut session: CentralSession<R>,
        mut command_rx: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<CentralEvent>,
        snapshot: Arc<RwLock<SessionSnapshot>>,
        update_tx: broadcast::Sender<SessionUpdate>,
    ) {
        let publisher = Publisher { snapshot, update_tx };

        loop {
            tokio::select! {
                // Pending stack callbacks are applied before new commands.
                biased;

                Some(event) = events.recv() => {
                    session.handle_event(event);
                    publisher.publish(&mut session);
                }
                command = command_rx.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        publisher.reply(&mut session, reply, Self::shut_down);
                        break;
                    }
                    Some(command) => Self::dispatch(&mut session, &publisher, command),
                    None => break,
                },
            }
        }

        debug!("Central session task ended");
    }

    fn dispatch<R: CentralRadio>(session: &mut CentralSession<R>, publisher: &Publisher, command: Command) {
        match command {
            Command::StartScanning(reply) => publisher.reply(session, reply, |s| s.start_scanning()),
            Command::StopScanning(reply) => publisher.reply(session, reply, |s| s.stop_scanning()),
            Command::Connect(id, reply) => publisher.reply(session, reply, |s| s.connect(&id)),
            Command::Disconnect(id, reply) => publisher.reply(session, reply, |s| s.disconnect(&id)),
            Command::ReadValue(id, reply) => publisher.reply(session, reply, |s| s.read_value(&id)),
            Command::ReadSignalStrength(id, reply) => {
                publisher.reply(session, reply, |s| s.read_signal_strength(&id))
            }
            Command::ResetRegistry(reply) => publisher.reply(session, reply, |s| s.reset_registry()),
            Command::Shutdown(reply) => publisher.reply(session, reply, Self::shut_down),
        }
    }

    fn shut_down<R: CentralRadio>(session: &mut CentralSession<R>) {
        info!("Shutting down central session");
        session.stop_scanning();

        let active: Vec<DeviceId> = session
            .registry()
            .iter()
            .filter(|r| r.connection_state().is_active())
            .map(|r| r.id.clone())
            .collect();
        for id in active {
            if let Err(e) = session.disconnect(&id) {
                warn!("Error disconnecting {}: {}", id, e);
            }
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(command(reply_tx))
            .map_err(|_| Error::SessionClosed)?;
        reply_rx.await.map_err(|_| Error::SessionClosed)
    }

    /// Start a scan session.
    pub async fn start_scanning(&self) -> Result<CommandOutcome> {
        self.request(Command::StartScanning).await
    }

    /// Stop the active scan.
    pub async fn stop_scanning(&self) -> Result<CommandOutcome> {
        self.request(Command::StopScanning).await
    }

    /// Connect to a discovered device. Returns once the request is issued;
    /// watch [`subscribe`](Self::subscribe) for progress.
    pub async fn connect(&self, id: &DeviceId) -> Result<CommandOutcome> {
        self.request(|reply| Command::Connect(id.clone(), reply)).await?
    }

    /// Connect and wait until the device is Ready.
    ///
    /// If `deadline` elapses first the attempt is cancelled with
    /// [`disconnect`](Self::disconnect).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] on deadline, [`Error::ConnectFailed`] if
    /// the stack rejects the link, [`Error::Disconnected`] if it drops during
    /// discovery and [`Error::BluetoothUnavailable`] if the radio is off.
    pub async fn connect_with_deadline(&self, id: &DeviceId, deadline: Duration) -> Result<()> {
        let mut updates = self.update_tx.subscribe();

        if let CommandOutcome::AdapterNotReady(state) = self.connect(id).await? {
            debug!("Cannot connect to {}: Bluetooth is {}", id, state);
            return Err(Error::BluetoothUnavailable);
        }
        if self.connection_state(id).is_some_and(|s| s.is_ready()) {
            return Ok(());
        }

        let wait = async {
            loop {
                match updates.recv().await {
                    Ok(SessionUpdate::ConnectionStateChanged { id: changed, state }) if &changed == id => {
                        match state {
                            ConnectionState::Ready => return Ok(()),
                            ConnectionState::Failed(reason) => return Err(Error::ConnectFailed { reason }),
                            ConnectionState::Disconnected => {
                                return Err(Error::Disconnected {
                                    reason: "link dropped before discovery completed".to_string(),
                                })
                            }
                            _ => {}
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Missed {} session updates, checking snapshot", skipped);
                        if self.connection_state(id).is_some_and(|s| s.is_ready()) {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::SessionClosed),
                }
            }
        };

        match tokio::time::timeout(deadline, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Connecting to {} timed out after {:?}", id, deadline);
                self.disconnect(id).await?;
                Err(Error::Timeout)
            }
        }
    }

    /// Disconnect from a device. Idempotent.
    pub async fn disconnect(&self, id: &DeviceId) -> Result<CommandOutcome> {
        self.request(|reply| Command::Disconnect(id.clone(), reply)).await?
    }

    /// Read the message characteristic. The text arrives as
    /// [`SessionUpdate::MessageRead`].
    pub async fn read_value(&self, id: &DeviceId) -> Result<CommandOutcome> {
        self.request(|reply| Command::ReadValue(id.clone(), reply)).await?
    }

    /// Read the link's signal strength. The reading arrives as
    /// [`SessionUpdate::RssiRead`].
    pub async fn read_signal_strength(&self, id: &DeviceId) -> Result<CommandOutcome> {
        self.request(|reply| Command::ReadSignalStrength(id.clone(), reply))
            .await?
    }

    /// Forget every known device.
    pub async fn reset_registry(&self) -> Result<()> {
        self.request(Command::ResetRegistry).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.read().clone()
    }

    /// Latest published status lines.
    pub fn status(&self) -> SessionStatus {
        self.snapshot.read().status.clone()
    }

    /// Latest copy of a device record.
    pub fn device(&self, id: &DeviceId) -> Option<DeviceRecord> {
        self.snapshot.read().device(id).cloned()
    }

    /// Latest connection state of a device.
    pub fn connection_state(&self, id: &DeviceId) -> Option<ConnectionState> {
        self.snapshot
            .read()
            .device(id)
            .map(|d| d.connection_state().clone())
    }

    /// Devices sorted by signal strength, strongest first.
    pub fn devices_by_signal(&self) -> Vec<DeviceRecord> {
        let mut devices = self.snapshot.read().devices.clone();
        devices.sort_by_key(|d| std::cmp::Reverse(d.last_rssi.unwrap_or(i16::MIN)));
        devices
    }

    /// Device with the strongest signal.
    pub fn nearest_device(&self) -> Option<DeviceRecord> {
        self.devices_by_signal().into_iter().next()
    }

    /// Subscribe to session updates.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.update_tx.subscribe()
    }

    /// Register a callback for session updates.
    pub fn on_update<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionUpdate) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.update_tx.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(update) => callback(update),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Stop scanning, disconnect every device and stop the session task.
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
    use crate::ble::connection::ConnectOptions;
    use crate::ble::gatt::{CharacteristicDescriptor, CharacteristicHandle, CharacteristicProperties, ServiceDescriptor};
    use crate::ble::registry::AdvertisementPayload;
    use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use uuid::Uuid;

    /// Answers every command at once, like a cooperative remote device.
    struct ScriptedRadio {
        events: mpsc::UnboundedSender<CentralEvent>,
        ignore_connect: bool,
        cancels: Arc<AtomicUsize>,
    }

    impl ScriptedRadio {
        fn send(&self, event: CentralEvent) {
            let _ = self.events.send(event);
        }
    }

    impl CentralRadio for ScriptedRadio {
        fn start_scan(&mut self, _services: Vec<Uuid>) {}

        fn stop_scan(&mut self) {}

        fn connect(&mut self, id: &DeviceId, _options: &ConnectOptions) {
            if !self.ignore_connect {
                self.send(CentralEvent::Connected { id: id.clone() });
            }
        }

        fn cancel_connection(&mut self, id: &DeviceId) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.send(CentralEvent::Disconnected {
                id: id.clone(),
                reason: None,
            });
        }

        fn discover_services(&mut self, id: &DeviceId, _filter: Vec<Uuid>) {
            self.send(CentralEvent::ServicesDiscovered {
                id: id.clone(),
                services: vec![ServiceDescriptor::primary(CHAT_SERVICE_UUID)],
            });
        }

        fn discover_characteristics(&mut self, id: &DeviceId, service: Uuid, _filter: Vec<Uuid>) {
            self.send(CentralEvent::CharacteristicsDiscovered {
                id: id.clone(),
                service,
                characteristics: vec![CharacteristicDescriptor::new(
                    MESSAGE_CHARACTERISTIC_UUID,
                    service,
                    CharacteristicProperties::READ_ONLY,
                )],
            });
        }

        fn read_value(&mut self, id: &DeviceId, characteristic: &CharacteristicHandle) {
            self.send(CentralEvent::ValueRead {
                id: id.clone(),
                characteristic: characteristic.uuid,
                value: Bytes::from_static(b"hi"),
            });
        }

        fn read_rssi(&mut self, id: &DeviceId) {
            self.send(CentralEvent::RssiRead { id: id.clone(), rssi: -60 });
        }
    }

    fn manager(ignore_connect: bool) -> (CentralManager, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancels = Arc::new(AtomicUsize::new(0));

        let _ = tx.send(CentralEvent::AdapterStateChanged(AdapterState::PoweredOn));
        let _ = tx.send(CentralEvent::DeviceDiscovered {
            id: "A".into(),
            name: Some("BTDEV".into()),
            rssi: Some(-50),
            payload: AdvertisementPayload::new(),
        });

        let radio = ScriptedRadio {
            events: tx,
            ignore_connect,
            cancels: cancels.clone(),
        };
        (
            CentralManager::with_radio(radio, rx, CentralConfig::default()),
            cancels,
        )
    }

    async fn wait_for(manager: &CentralManager, check: impl Fn(&SessionSnapshot) -> bool) {
        for _ in 0..100 {
            if check(&manager.snapshot()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_connect_and_read() {
        let (manager, _) = manager(false);
        let id = DeviceId::new("A");
        wait_for(&manager, |s| s.device(&id).is_some()).await;

        manager
            .connect_with_deadline(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(manager.connection_state(&id), Some(ConnectionState::Ready));

        assert_eq!(manager.read_value(&id).await.unwrap(), CommandOutcome::Issued);
        wait_for(&manager, |s| s.status.last_message.as_deref() == Some("hi")).await;
        assert_eq!(
            manager.device(&id).unwrap().last_message.as_deref(),
            Some("hi")
        );

        manager.read_signal_strength(&id).await.unwrap();
        wait_for(&manager, |s| {
            s.device(&id).and_then(|d| d.last_rssi) == Some(-60)
        })
        .await;
    }

    #[tokio::test]
    async fn test_connect_deadline_cancels_attempt() {
        let (manager, cancels) = manager(true);
        let id = DeviceId::new("A");
        wait_for(&manager, |s| s.device(&id).is_some()).await;

        let err = manager
            .connect_with_deadline(&id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert_eq!(
            manager.connection_state(&id),
            Some(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_unknown_device() {
        let (manager, _) = manager(false);
        wait_for(&manager, |s| s.status.adapter_state == AdapterState::PoweredOn).await;

        let err = manager.connect(&"nope".into()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownDevice { .. }));
    }

    #[tokio::test]
    async fn test_scanning_is_idempotent() {
        let (manager, _) = manager(false);
        wait_for(&manager, |s| s.status.adapter_state == AdapterState::PoweredOn).await;

        assert_eq!(manager.start_scanning().await.unwrap(), CommandOutcome::Issued);
        assert_eq!(manager.start_scanning().await.unwrap(), CommandOutcome::NoOp);
        assert!(manager.status().is_scanning);
    }

    #[tokio::test]
    async fn test_on_update_callback() {
        let (manager, _) = manager(false);
        let id = DeviceId::new("A");
        wait_for(&manager, |s| s.device(&id).is_some()).await;

        let saw_ready = Arc::new(AtomicBool::new(false));
        let flag = saw_ready.clone();
        let handle = manager.on_update(move |update| {
            if let SessionUpdate::ConnectionStateChanged {
                state: ConnectionState::Ready,
                ..
            } = update
            {
                flag.store(true, Ordering::SeqCst);
            }
        });

        manager
            .connect_with_deadline(&id, Duration::from_secs(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(saw_ready.load(Ordering::SeqCst));
        handle.unregister();
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let (manager, cancels) = manager(false);
        let id = DeviceId::new("A");
        wait_for(&manager, |s| s.device(&id).is_some()).await;
        manager
            .connect_with_deadline(&id, Duration::from_secs(1))
            .await
            .unwrap();

        manager.shutdown().await.unwrap();
        assert_eq!(cancels.load(Ordering::SeqCst), 1);
        assert!(matches!(
            manager.start_scanning().await,
            Err(Error::SessionClosed)
        ));
    }
}
