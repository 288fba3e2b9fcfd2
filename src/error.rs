//! xHCI error types
//!
//! Every failure the driver can report is a variant of [`XhciError`]. Lifecycle
//! calls propagate them, steady-state calls hand them back as values, and
//! callers that need an integer status use [`XhciError::cause`].

use core::fmt;

use crate::xhci::trb::CompletionCode;

/// xHCI operation result type
pub type Result<T> = core::result::Result<T, XhciError>;

/// Cause code reported for a successful operation
pub const SUCCESS: i32 = 0;

/// xHCI error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum XhciError {
    /// Operation requires a successful `initialize` first
    NotInitialized,
    /// Controller stayed running after Run/Stop was cleared
    HostControllerNotHalted,
    /// HCRST or CNR did not clear in time
    ResetTimeout,
    /// USBSTS.HCH did not clear after setting Run/Stop
    RunTimeout,
    /// BIOS did not release the controller through USB Legacy Support
    OwnershipTimeout,
    /// Host system error or host controller error reported in USBSTS
    HostSystemError,
    /// Controller capability this driver does not support
    Unsupported,
    /// Producer ring has no free slot
    RingFull,
    /// TRB pointer does not belong to the ring it was reported on
    RingCorruption,
    /// Slot ID outside the device table or not allocated
    InvalidSlotId,
    /// Event references an endpoint the device does not own
    InvalidEndpoint,
    /// Event arrived while the port was in an unexpected state
    InvalidPhase,
    /// Command completion with no outstanding command at that ring position
    NoWaiter,
    /// Command completed with a non-success completion code
    CommandFailed(CompletionCode),
    /// Transfer completed with a non-success completion code
    TransferFailed(CompletionCode),
    /// Port over-current, or port not enabled after reset
    PortError,
    /// Port configuration step did not complete in time
    Timeout,
    /// Malformed or unexpected USB descriptor
    InvalidDescriptor,
    /// Device slot already in use or no memory for another device
    NoResources,
}

impl XhciError {
    /// Integer cause code for this error; never equal to [`SUCCESS`]
    pub const fn cause(&self) -> i32 {
        match self {
            Self::NotInitialized => 1,
            Self::HostControllerNotHalted => 2,
            Self::ResetTimeout => 3,
            Self::RunTimeout => 4,
            Self::OwnershipTimeout => 5,
            Self::HostSystemError => 6,
            Self::Unsupported => 7,
            Self::RingFull => 8,
            Self::RingCorruption => 9,
            Self::InvalidSlotId => 10,
            Self::InvalidEndpoint => 11,
            Self::InvalidPhase => 12,
            Self::NoWaiter => 13,
            Self::CommandFailed(_) => 14,
            Self::TransferFailed(_) => 15,
            Self::PortError => 16,
            Self::Timeout => 18,
            Self::InvalidDescriptor => 19,
            Self::NoResources => 20,
        }
    }

    /// Whether the controller instance must be abandoned (or re-initialized)
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HostControllerNotHalted
                | Self::ResetTimeout
                | Self::RunTimeout
                | Self::OwnershipTimeout
                | Self::HostSystemError
        )
    }
}

/// Cause code of a result: [`SUCCESS`] for `Ok`, [`XhciError::cause`] otherwise
pub fn cause_of<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => SUCCESS,
        Err(e) => e.cause(),
    }
}

impl fmt::Display for XhciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "Controller not initialized"),
            Self::HostControllerNotHalted => write!(f, "Host controller not halted"),
            Self::ResetTimeout => write!(f, "Controller reset timeout"),
            Self::RunTimeout => write!(f, "Controller run timeout"),
            Self::OwnershipTimeout => write!(f, "BIOS ownership handoff timeout"),
            Self::HostSystemError => write!(f, "Host system error"),
            Self::Unsupported => write!(f, "Unsupported controller capability"),
            Self::RingFull => write!(f, "Ring full"),
            Self::RingCorruption => write!(f, "Ring corruption"),
            Self::InvalidSlotId => write!(f, "Invalid slot ID"),
            Self::InvalidEndpoint => write!(f, "Invalid endpoint"),
            Self::InvalidPhase => write!(f, "Event in unexpected port phase"),
            Self::NoWaiter => write!(f, "No command waiting for completion"),
            Self::CommandFailed(code) => write!(f, "Command failed: {:?}", code),
            Self::TransferFailed(code) => write!(f, "Transfer failed: {:?}", code),
            Self::PortError => write!(f, "Port error"),
            Self::Timeout => write!(f, "Timeout"),
            Self::InvalidDescriptor => write!(f, "Invalid descriptor"),
            Self::NoResources => write!(f, "No resources available"),
        }
    }
}
