//! Per-device connection state machine.
//!
//! The controller never talks to the radio itself. Each input returns a
//! [`Transition`] listing the states entered and the [`ConnectionAction`]s
//! the caller must carry out, in order. Cache invalidation is always listed
//! first so a stale handle can never outlive the Ready state.

use std::time::Duration;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::ble::gatt::{CharacteristicDescriptor, CharacteristicHandle, ServiceDescriptor};

/// Connection state for a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionState {
    /// No link.
    #[default]
    Disconnected,
    /// Connect requested, waiting for the stack.
    Connecting,
    /// Link established.
    Connected,
    /// Waiting for the service list.
    DiscoveringServices,
    /// Waiting for the message characteristic.
    DiscoveringCharacteristics,
    /// Message characteristic resolved; reads are possible.
    Ready,
    /// The stack reported a failure. Terminal until a new connect.
    Failed(String),
}

impl ConnectionState {
    /// Check if reads can be issued.
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if a connection attempt or link is in progress.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Check if the link itself is up.
    pub fn is_link_up(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::DiscoveringServices | Self::DiscoveringCharacteristics | Self::Ready
        )
    }

    /// Disconnected and Failed are terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "Discovering services"),
            Self::DiscoveringCharacteristics => write!(f, "Discovering characteristics"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed(reason) => write!(f, "Failed: {}", reason),
        }
    }
}

/// Options passed to the stack with a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectOptions {
    /// Alert the user when the link comes up while backgrounded.
    pub notify_on_connect: bool,
    /// Alert the user when the link drops while backgrounded.
    pub notify_on_disconnect: bool,
    /// Alert the user on incoming notifications while backgrounded.
    pub notify_on_notification: bool,
    /// Bridge classic transports for dual-mode devices.
    pub enable_transport_bridging: bool,
    /// Require the remote to be a paired companion.
    pub requires_companion_pairing: bool,
    /// Delay before the connection attempt starts.
    pub start_delay: Duration,
}

impl ConnectOptions {
    /// Default start delay.
    pub const DEFAULT_START_DELAY: Duration = Duration::from_secs(3);

    /// Set the start delay.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            notify_on_connect: false,
            notify_on_disconnect: false,
            notify_on_notification: false,
            enable_transport_bridging: false,
            requires_companion_pairing: false,
            start_delay: Self::DEFAULT_START_DELAY,
        }
    }
}

/// Side effect requested by a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Ask the stack to connect.
    RequestConnect,
    /// Ask the stack to tear the link down.
    CancelConnection,
    /// Discover services, restricted to `filter`.
    DiscoverServices {
        /// Service UUIDs of interest.
        filter: Vec<Uuid>,
    },
    /// Discover characteristics of one service, restricted to `filter`.
    DiscoverCharacteristics {
        /// The service to search.
        service: Uuid,
        /// Characteristic UUIDs of interest.
        filter: Vec<Uuid>,
    },
    /// Store the resolved message characteristic.
    CacheCharacteristic(CharacteristicHandle),
    /// Drop any cached characteristic for this device.
    InvalidateCache,
}

/// Outcome of feeding one input to a [`ConnectionController`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// State before the input.
    pub from: ConnectionState,
    /// States entered, in order. Empty when the input was ignored.
    pub visited: Vec<ConnectionState>,
    /// Actions to perform, in order.
    pub actions: Vec<ConnectionAction>,
}

impl Transition {
    fn ignored(from: ConnectionState) -> Self {
        Self {
            from,
            visited: Vec::new(),
            actions: Vec::new(),
        }
    }

    /// State after the input.
    pub fn to(&self) -> &ConnectionState {
        self.visited.last().unwrap_or(&self.from)
    }

    /// Check if the state changed.
    pub fn changed(&self) -> bool {
        !self.visited.is_empty()
    }
}

/// Drives one device through connect, discovery and ready.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConnectionController {
    state: ConnectionState,
    target_service: Uuid,
    target_characteristic: Uuid,
}

impl ConnectionController {
    /// Create a controller looking for `target_characteristic` inside
    /// `target_service`.
    pub fn new(target_service: Uuid, target_characteristic: Uuid) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            target_service,
            target_characteristic,
        }
    }

    /// Current state.
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Service searched during discovery.
    pub fn target_service(&self) -> Uuid {
        self.target_service
    }

    /// Characteristic searched during discovery.
    pub fn target_characteristic(&self) -> Uuid {
        self.target_characteristic
    }

    /// Caller asked to connect. Only valid from a terminal state.
    pub fn connect(&mut self) -> Transition {
        if self.state.is_active() {
            debug!("Connect ignored, already {}", self.state);
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Connecting],
            vec![ConnectionAction::InvalidateCache, ConnectionAction::RequestConnect],
        )
    }

    /// The stack reports the link is up. Service discovery starts at once.
    pub fn on_connected(&mut self) -> Transition {
        if self.state != ConnectionState::Connecting {
            warn!("Unexpected connect callback while {}", self.state);
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Connected, ConnectionState::DiscoveringServices],
            vec![ConnectionAction::DiscoverServices {
                filter: vec![self.target_service],
            }],
        )
    }

    /// The stack could not establish the link.
    pub fn on_connect_failed(&mut self, reason: impl Into<String>) -> Transition {
        if self.state != ConnectionState::Connecting {
            warn!("Unexpected connect failure while {}", self.state);
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Failed(reason.into())],
            vec![ConnectionAction::InvalidateCache],
        )
    }

    /// The stack delivered the service list. Characteristic discovery is
    /// requested for each matching service only.
    pub fn on_services_discovered(&mut self, services: &[ServiceDescriptor]) -> Transition {
        if self.state != ConnectionState::DiscoveringServices {
            trace!("Services discovered while {}, ignoring", self.state);
            return Transition::ignored(self.state.clone());
        }

        let actions: Vec<_> = services
            .iter()
            .filter(|s| s.uuid == self.target_service)
            .map(|s| ConnectionAction::DiscoverCharacteristics {
                service: s.uuid,
                filter: vec![self.target_characteristic],
            })
            .collect();

        if actions.is_empty() {
            debug!(
                "None of {} service(s) match {}, still discovering",
                services.len(),
                self.target_service
            );
            return Transition::ignored(self.state.clone());
        }

        self.step(vec![ConnectionState::DiscoveringCharacteristics], actions)
    }

    /// The stack delivered characteristics of `service`. The first one
    /// matching the target is cached and the device becomes Ready.
    pub fn on_characteristics_discovered(
        &mut self,
        service: Uuid,
        characteristics: &[CharacteristicDescriptor],
    ) -> Transition {
        if self.state != ConnectionState::DiscoveringCharacteristics || service != self.target_service {
            trace!(
                "Characteristics for {} discovered while {}, ignoring",
                service,
                self.state
            );
            return Transition::ignored(self.state.clone());
        }

        match characteristics
            .iter()
            .find(|c| c.uuid == self.target_characteristic)
        {
            Some(found) => self.step(
                vec![ConnectionState::Ready],
                vec![ConnectionAction::CacheCharacteristic(found.handle())],
            ),
            None => {
                debug!("Target characteristic not among {} found", characteristics.len());
                Transition::ignored(self.state.clone())
            }
        }
    }

    /// Caller asked to disconnect. Idempotent.
    ///
    /// A stack error can leave the link up behind Failed, so the link is
    /// cancelled from there too.
    pub fn disconnect(&mut self) -> Transition {
        if self.state == ConnectionState::Disconnected {
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Disconnected],
            vec![ConnectionAction::InvalidateCache, ConnectionAction::CancelConnection],
        )
    }

    /// The stack reports the link went away.
    pub fn on_disconnected(&mut self) -> Transition {
        if self.state == ConnectionState::Disconnected {
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Disconnected],
            vec![ConnectionAction::InvalidateCache],
        )
    }

    /// The stack reported an error for this device. Surfaced, not retried.
    pub fn on_stack_error(&mut self, reason: impl Into<String>) -> Transition {
        if self.state.is_terminal() {
            trace!("Stack error while {}, ignoring", self.state);
            return Transition::ignored(self.state.clone());
        }
        self.step(
            vec![ConnectionState::Failed(reason.into())],
            vec![ConnectionAction::InvalidateCache],
        )
    }

    fn step(&mut self, visited: Vec<ConnectionState>, actions: Vec<ConnectionAction>) -> Transition {
        let from = self.state.clone();
        for next in &visited {
            debug!("Connection state changed: {} -> {}", self.state, next);
            self.state = next.clone();
        }
        Transition {
            from,
            visited,
            actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::gatt::CharacteristicProperties;
    use crate::ble::uuids::{CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID};
    use pretty_assertions::assert_eq;

    fn controller() -> ConnectionController {
        ConnectionController::new(CHAT_SERVICE_UUID, MESSAGE_CHARACTERISTIC_UUID)
    }

    fn message_characteristic() -> CharacteristicDescriptor {
        CharacteristicDescriptor::new(
            MESSAGE_CHARACTERISTIC_UUID,
            CHAT_SERVICE_UUID,
            CharacteristicProperties::READ_ONLY,
        )
    }

    fn ready_controller() -> ConnectionController {
        let mut c = controller();
        c.connect();
        c.on_connected();
        c.on_services_discovered(&[ServiceDescriptor::primary(CHAT_SERVICE_UUID)]);
        c.on_characteristics_discovered(CHAT_SERVICE_UUID, &[message_characteristic()]);
        assert!(c.state().is_ready());
        c
    }

    fn controller_in(state: &ConnectionState) -> ConnectionController {
        let mut c = controller();
        match state {
            ConnectionState::Disconnected => {}
            ConnectionState::Connecting => {
                c.connect();
            }
            ConnectionState::Connected | ConnectionState::DiscoveringServices => {
                c.connect();
                c.on_connected();
            }
            ConnectionState::DiscoveringCharacteristics => {
                c.connect();
                c.on_connected();
                c.on_services_discovered(&[ServiceDescriptor::primary(CHAT_SERVICE_UUID)]);
            }
            ConnectionState::Ready => c = ready_controller(),
            ConnectionState::Failed(reason) => {
                c.connect();
                c.on_connect_failed(reason.clone());
            }
        }
        c
    }

    #[test]
    fn test_connection_state() {
        assert!(!ConnectionState::Disconnected.is_active());
        assert!(ConnectionState::Connecting.is_active());
        assert!(!ConnectionState::Connecting.is_link_up());
        assert!(ConnectionState::Ready.is_link_up());
        assert!(ConnectionState::Failed("x".into()).is_terminal());
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(format!("{}", ConnectionState::Ready), "Ready");
        assert_eq!(format!("{}", ConnectionState::Disconnected), "Disconnected");
        assert_eq!(
            format!("{}", ConnectionState::Failed("timeout".into())),
            "Failed: timeout"
        );
    }

    #[test]
    fn test_default_connect_options() {
        let options = ConnectOptions::default();
        assert!(!options.notify_on_connect);
        assert!(!options.requires_companion_pairing);
        assert_eq!(options.start_delay, Duration::from_secs(3));
    }

    #[test]
    fn test_happy_path() {
        let mut c = controller();

        let t = c.connect();
        assert_eq!(t.to(), &ConnectionState::Connecting);
        assert!(t.actions.contains(&ConnectionAction::RequestConnect));

        let t = c.on_connected();
        assert_eq!(
            t.visited,
            vec![ConnectionState::Connected, ConnectionState::DiscoveringServices]
        );
        assert_eq!(
            t.actions,
            vec![ConnectionAction::DiscoverServices {
                filter: vec![CHAT_SERVICE_UUID]
            }]
        );

        let other = ServiceDescriptor::primary(Uuid::from_u128(0x180a));
        let t = c.on_services_discovered(&[other, ServiceDescriptor::primary(CHAT_SERVICE_UUID)]);
        assert_eq!(t.to(), &ConnectionState::DiscoveringCharacteristics);
        assert_eq!(
            t.actions,
            vec![ConnectionAction::DiscoverCharacteristics {
                service: CHAT_SERVICE_UUID,
                filter: vec![MESSAGE_CHARACTERISTIC_UUID],
            }]
        );

        let t = c.on_characteristics_discovered(CHAT_SERVICE_UUID, &[message_characteristic()]);
        assert_eq!(t.to(), &ConnectionState::Ready);
        assert_eq!(
            t.actions,
            vec![ConnectionAction::CacheCharacteristic(message_characteristic().handle())]
        );
    }

    #[test]
    fn test_non_matching_characteristic_stays_pending() {
        let mut c = controller_in(&ConnectionState::DiscoveringCharacteristics);
        let other = CharacteristicDescriptor::new(
            Uuid::from_u128(0x2a29),
            CHAT_SERVICE_UUID,
            CharacteristicProperties::READ_ONLY,
        );

        let t = c.on_characteristics_discovered(CHAT_SERVICE_UUID, &[other]);
        assert!(!t.changed());
        assert_eq!(c.state(), &ConnectionState::DiscoveringCharacteristics);
    }

    #[test]
    fn test_unrelated_services_are_ignored() {
        let mut c = controller_in(&ConnectionState::DiscoveringServices);
        let t = c.on_services_discovered(&[ServiceDescriptor::primary(Uuid::from_u128(0x180f))]);
        assert!(!t.changed());
        assert!(t.actions.is_empty());
    }

    #[test]
    fn test_connect_failure_is_terminal() {
        let mut c = controller_in(&ConnectionState::Connecting);
        let t = c.on_connect_failed("peer refused");
        assert_eq!(t.to(), &ConnectionState::Failed("peer refused".into()));

        // No automatic retry: a late success callback is ignored.
        assert!(!c.on_connected().changed());

        // A new explicit connect is allowed.
        assert_eq!(c.connect().to(), &ConnectionState::Connecting);
    }

    #[test]
    fn test_connect_while_active_is_ignored() {
        let mut c = controller_in(&ConnectionState::Ready);
        let t = c.connect();
        assert!(!t.changed());
        assert!(t.actions.is_empty());
    }

    #[test]
    fn test_stack_error_from_ready() {
        let mut c = ready_controller();
        let t = c.on_stack_error("GATT error");
        assert_eq!(t.to(), &ConnectionState::Failed("GATT error".into()));
        assert_eq!(t.actions, vec![ConnectionAction::InvalidateCache]);
    }

    #[test]
    fn test_disconnect_from_every_state() {
        let states = [
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::DiscoveringServices,
            ConnectionState::DiscoveringCharacteristics,
            ConnectionState::Ready,
            ConnectionState::Failed("boom".into()),
        ];

        for state in &states {
            let mut c = controller_in(state);
            let t = c.disconnect();
            assert_eq!(c.state(), &ConnectionState::Disconnected, "from {}", state);
            if *state == ConnectionState::Disconnected {
                assert!(t.actions.is_empty());
            } else {
                assert_eq!(
                    t.actions,
                    vec![ConnectionAction::InvalidateCache, ConnectionAction::CancelConnection],
                    "from {}",
                    state
                );
            }

            // Idempotent.
            assert!(!c.disconnect().changed());
        }
    }

    #[test]
    fn test_stack_disconnect_invalidates_cache() {
        let mut c = ready_controller();
        let t = c.on_disconnected();
        assert_eq!(t.to(), &ConnectionState::Disconnected);
        assert_eq!(t.actions, vec![ConnectionAction::InvalidateCache]);
        assert!(!c.on_disconnected().changed());
    }
}
