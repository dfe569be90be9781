//! Local radio power/authorization tracking.

use tracing::{debug, info};

/// Power and authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AdapterState {
    /// State not yet reported by the stack.
    #[default]
    Unknown,
    /// The stack is resetting; a new state will follow.
    Resetting,
    /// This platform has no BLE support.
    Unsupported,
    /// The application may not use Bluetooth.
    Unauthorized,
    /// The radio is switched off.
    PoweredOff,
    /// The radio is on and usable.
    PoweredOn,
}

impl AdapterState {
    /// Check if the radio can accept commands.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Resetting => write!(f, "resetting"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::PoweredOff => write!(f, "powered off"),
            Self::PoweredOn => write!(f, "powered on"),
        }
    }
}

impl From<btleplug::api::CentralState> for AdapterState {
    fn from(state: btleplug::api::CentralState) -> Self {
        use btleplug::api::CentralState;

        match state {
            CentralState::PoweredOn => Self::PoweredOn,
            CentralState::PoweredOff => Self::PoweredOff,
            CentralState::Unknown => Self::Unknown,
        }
    }
}

/// Tracks the last power state reported by the stack.
///
/// Every gated operation asks [`AdapterMonitor::is_ready`] first and turns
/// into a no-op when the radio is not powered on.
#[derive(Debug, Clone, Default)]
pub struct AdapterMonitor {
    state: AdapterState,
}

impl AdapterMonitor {
    /// Create a monitor in the [`AdapterState::Unknown`] state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a power-state callback. Returns the previous state.
    pub fn on_state_changed(&mut self, new_state: AdapterState) -> AdapterState {
        let old = std::mem::replace(&mut self.state, new_state);
        if old != new_state {
            info!("New BT manager state is {}", new_state);
        } else {
            debug!("BT manager state unchanged: {}", new_state);
        }
        old
    }

    /// Current state.
    pub fn state(&self) -> AdapterState {
        self.state
    }

    /// True iff the radio is powered on.
    pub fn is_ready(&self) -> bool {
        self.state.is_powered_on()
    }
}

/// What a gated command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The request went to the radio.
    Issued,
    /// Nothing to do; already in the requested state.
    NoOp,
    /// The radio is not powered on; nothing was sent.
    AdapterNotReady(AdapterState),
}

impl CommandOutcome {
    /// Check if the request reached the radio.
    pub fn is_issued(&self) -> bool {
        matches!(self, Self::Issued)
    }
}
