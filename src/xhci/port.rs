//! Root-hub port state
//!
//! Each root port walks `Disconnected -> Connected -> Resetting ->
//! Addressing -> DescriptorNegotiation -> Configured`, or drops to `Failed`
//! from any non-terminal state. The controller drives the transitions; this
//! type only records them and rejects moves the state machine does not have.

use log::debug;

use crate::error::{Result, XhciError};

use super::{PortId, PortSc, PortSpeed};

/// Configuration state of a root port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortState {
    /// Nothing attached
    Disconnected,
    /// Device attached, waiting for its turn to be reset
    Connected,
    /// Port reset issued, waiting for the reset-change event
    Resetting,
    /// Enable Slot / Address Device in flight
    Addressing,
    /// Descriptor requests and class setup over EP0
    DescriptorNegotiation,
    /// Class driver bound
    Configured,
    /// Configuration failed; sticky until the connect status changes
    Failed,
}

impl PortState {
    /// States during which the port holds the addressing turn
    pub const fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Resetting | Self::Addressing | Self::DescriptorNegotiation
        )
    }

    /// States the port scan leaves alone
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Configured | Self::Failed)
    }

    const fn allows(self, to: Self) -> bool {
        use PortState::*;
        match (self, to) {
            (_, Disconnected) => true,
            (Disconnected | Failed, Connected) => true,
            (Connected, Resetting) => true,
            (Resetting, Addressing) => true,
            (Addressing, DescriptorNegotiation) => true,
            (DescriptorNegotiation, Configured) => true,
            (Connected | Resetting | Addressing | DescriptorNegotiation, Failed) => true,
            _ => false,
        }
    }
}

/// One root-hub port
#[derive(Debug, Clone)]
pub struct Port {
    id: PortId,
    state: PortState,
    connected: bool,
    speed: PortSpeed,
    slot_id: Option<u8>,
    last_error: Option<XhciError>,
    stalled_scans: u32,
}

impl Port {
    /// Fresh, disconnected port
    pub const fn new(id: PortId) -> Self {
        Self {
            id,
            state: PortState::Disconnected,
            connected: false,
            speed: PortSpeed::Unknown,
            slot_id: None,
            last_error: None,
            stalled_scans: 0,
        }
    }

    /// 1-based port number
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Last observed PORTSC.CCS
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Negotiated speed (valid while connected)
    pub fn speed(&self) -> PortSpeed {
        self.speed
    }

    /// Slot ID once Enable Slot succeeded
    pub fn slot_id(&self) -> Option<u8> {
        self.slot_id
    }

    /// Error that moved the port to `Failed`
    pub fn last_error(&self) -> Option<XhciError> {
        self.last_error
    }

    pub(crate) fn refresh(&mut self, portsc: PortSc) {
        self.connected = portsc.contains(PortSc::CURRENT_CONNECT_STATUS);
        self.speed = if self.connected {
            portsc.speed()
        } else {
            PortSpeed::Unknown
        };
    }

    pub(crate) fn transition(&mut self, to: PortState) -> Result<()> {
        if !self.state.allows(to) {
            return Err(XhciError::InvalidPhase);
        }
        debug!("port {}: {:?} -> {:?}", self.id.value(), self.state, to);
        self.state = to;
        self.stalled_scans = 0;
        match to {
            PortState::Disconnected => {
                self.slot_id = None;
                self.last_error = None;
            }
            PortState::Connected => self.last_error = None,
            _ => {}
        }
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: XhciError) {
        if self.state != PortState::Failed {
            debug!("port {}: {:?} -> Failed ({})", self.id.value(), self.state, error);
        }
        self.state = PortState::Failed;
        self.slot_id = None;
        self.last_error = Some(error);
        self.stalled_scans = 0;
    }

    pub(crate) fn set_slot(&mut self, slot_id: Option<u8>) {
        self.slot_id = slot_id;
    }

    /// Count one scan pass without progress; returns the new count
    pub(crate) fn stall(&mut self) -> u32 {
        self.stalled_scans = self.stalled_scans.saturating_add(1);
        self.stalled_scans
    }
}
