//! xHCI (eXtensible Host Controller Interface) implementation
//!
//! This module provides register offsets and bit definitions for a USB 3
//! xHCI host controller, plus the ring, context, port and device structures
//! the controller core is built from.
//!
//! # Register Memory Layout
//!
//! The xHCI register space is divided into:
//! - Capability Registers (read-only, offset 0x00)
//! - Operational Registers (offset CAPLENGTH)
//! - Port Register Sets (operational base + 0x400, 0x10 per port)
//! - Runtime Registers (offset RTSOFF, interrupter sets from +0x20)
//! - Doorbell Array (offset DBOFF, one dword per slot)
//!
//! Register and data-structure layouts follow the xHCI Specification 1.2,
//! Chapters 5 and 6.

pub mod context;
pub mod controller;
pub mod device;
pub mod port;
pub mod register;
pub mod ring;
pub mod trb;

pub use controller::{Controller, ControllerBuilder, ControllerConfig, ControllerState};
pub use port::{Port, PortState};
pub use register::{MmioBus, RegisterBus, RegisterTimeout};
pub use ring::{EventRing, Ring};
pub use trb::{CompletionCode, Trb, TrbType};

use bitflags::bitflags;

/// Root-hub port number (1-based, as used by PORTSC and slot contexts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PortId(u8);

impl PortId {
    /// Create a port ID; `None` for port 0
    pub const fn new(port: u8) -> Option<Self> {
        if port == 0 {
            None
        } else {
            Some(Self(port))
        }
    }

    /// Zero-based index for array access
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Raw 1-based port number
    #[inline(always)]
    pub const fn value(self) -> u8 {
        self.0
    }
}

/// Negotiated port speed (PORTSC Port Speed field, default PSI mapping)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortSpeed {
    /// 12 Mbps
    FullSpeed,
    /// 1.5 Mbps
    LowSpeed,
    /// 480 Mbps
    HighSpeed,
    /// 5 Gbps
    SuperSpeed,
    /// 10 Gbps and above
    SuperSpeedPlus,
    /// No device, or a speed ID this driver does not map
    Unknown,
}

impl PortSpeed {
    /// Decode a Protocol Speed ID value
    pub const fn from_psiv(psiv: u8) -> Self {
        match psiv {
            1 => Self::FullSpeed,
            2 => Self::LowSpeed,
            3 => Self::HighSpeed,
            4 => Self::SuperSpeed,
            5 => Self::SuperSpeedPlus,
            _ => Self::Unknown,
        }
    }

    /// Protocol Speed ID value written into slot contexts
    pub const fn psiv(self) -> u8 {
        match self {
            Self::FullSpeed => 1,
            Self::LowSpeed => 2,
            Self::HighSpeed => 3,
            Self::SuperSpeed => 4,
            Self::SuperSpeedPlus => 5,
            Self::Unknown => 0,
        }
    }

    /// Default control endpoint max packet size before the device descriptor is read
    pub const fn default_max_packet_size(self) -> u16 {
        match self {
            Self::LowSpeed | Self::FullSpeed => 8,
            Self::HighSpeed => 64,
            Self::SuperSpeed | Self::SuperSpeedPlus => 512,
            Self::Unknown => 8,
        }
    }
}

/// Capability register offsets (from the MMIO base)
pub mod cap {
    /// CAPLENGTH (byte 0) and HCIVERSION (bytes 2..4)
    pub const CAPLENGTH: usize = 0x00;
    /// Structural parameters 1: slots, interrupters, ports
    pub const HCSPARAMS1: usize = 0x04;
    /// Structural parameters 2: ERST max, scratchpad count
    pub const HCSPARAMS2: usize = 0x08;
    /// Capability parameters 1: AC64, CSZ, xECP
    pub const HCCPARAMS1: usize = 0x10;
    /// Doorbell array offset
    pub const DBOFF: usize = 0x14;
    /// Runtime register space offset
    pub const RTSOFF: usize = 0x18;

    /// HCSPARAMS1 MaxSlots
    pub const fn max_slots(hcsparams1: u32) -> u8 {
        hcsparams1 as u8
    }

    /// HCSPARAMS1 MaxPorts
    pub const fn max_ports(hcsparams1: u32) -> u8 {
        (hcsparams1 >> 24) as u8
    }

    /// HCSPARAMS2 Max Scratchpad Buffers (Hi << 5 | Lo)
    pub const fn max_scratchpad_buffers(hcsparams2: u32) -> usize {
        let hi = (hcsparams2 >> 21) & 0x1F;
        let lo = (hcsparams2 >> 27) & 0x1F;
        ((hi << 5) | lo) as usize
    }

    /// HCCPARAMS1 Context Size: 64-byte contexts when set
    pub const fn context_size_64(hccparams1: u32) -> bool {
        hccparams1 & (1 << 2) != 0
    }

    /// HCCPARAMS1 xHCI Extended Capabilities Pointer, in bytes from the base
    pub const fn extended_capabilities(hccparams1: u32) -> usize {
        ((hccparams1 >> 16) as usize) << 2
    }
}

/// Operational register offsets (from the operational base)
pub mod op {
    /// USB Command
    pub const USBCMD: usize = 0x00;
    /// USB Status
    pub const USBSTS: usize = 0x04;
    /// Supported page sizes
    pub const PAGESIZE: usize = 0x08;
    /// Command Ring Control (64-bit)
    pub const CRCR: usize = 0x18;
    /// Device Context Base Address Array Pointer (64-bit)
    pub const DCBAAP: usize = 0x30;
    /// Configure (MaxSlotsEn)
    pub const CONFIG: usize = 0x38;
    /// First port register set
    pub const PORT_BASE: usize = 0x400;
    /// Stride between port register sets
    pub const PORT_STRIDE: usize = 0x10;

    /// PORTSC offset for a 1-based port
    pub const fn portsc(port: u8) -> usize {
        PORT_BASE + PORT_STRIDE * (port as usize - 1)
    }
}

/// Interrupter register offsets (from the runtime base)
pub mod runtime {
    /// Interrupter 0 register set
    pub const INTERRUPTER0: usize = 0x20;
    /// Interrupter Management
    pub const IMAN: usize = INTERRUPTER0;
    /// Interrupter Moderation
    pub const IMOD: usize = INTERRUPTER0 + 0x04;
    /// Event Ring Segment Table Size
    pub const ERSTSZ: usize = INTERRUPTER0 + 0x08;
    /// Event Ring Segment Table Base Address (64-bit)
    pub const ERSTBA: usize = INTERRUPTER0 + 0x10;
    /// Event Ring Dequeue Pointer (64-bit)
    pub const ERDP: usize = INTERRUPTER0 + 0x18;
    /// ERDP Event Handler Busy, RW1C
    pub const ERDP_EHB: u64 = 1 << 3;
}

/// Extended capability identifiers and USB Legacy Support bits
pub mod ext_cap {
    /// USB Legacy Support capability ID
    pub const LEGACY_SUPPORT: u8 = 1;
    /// HC BIOS Owned Semaphore
    pub const BIOS_OWNED: u32 = 1 << 16;
    /// HC OS Owned Semaphore
    pub const OS_OWNED: u32 = 1 << 24;
    /// USBLEGCTLSTS, at capability + 4
    pub const LEGCTLSTS: usize = 0x04;
    /// SMI enables in USBLEGCTLSTS (bits 0, 4, 13..=15)
    pub const LEGCTLSTS_SMI_ENABLES: u32 = (1 << 0) | (1 << 4) | (0x7 << 13);

    /// Capability ID field of an extended capability header
    pub const fn id(header: u32) -> u8 {
        header as u8
    }

    /// Next capability pointer in bytes, 0 at the end of the list
    pub const fn next(header: u32) -> usize {
        (((header >> 8) & 0xFF) as usize) << 2
    }
}

bitflags! {
    /// USB Command Register (USBCMD) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbCmd: u32 {
        /// Run/Stop (R/S) - Bit 0
        const RUN_STOP = 1 << 0;
        /// Host Controller Reset (HCRST) - Bit 1
        const HC_RESET = 1 << 1;
        /// Interrupter Enable (INTE) - Bit 2
        const INTERRUPTER_ENABLE = 1 << 2;
        /// Host System Error Enable (HSEE) - Bit 3
        const HOST_SYSTEM_ERROR_ENABLE = 1 << 3;
    }
}

bitflags! {
    /// USB Status Register (USBSTS) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UsbSts: u32 {
        /// HC Halted (HCH) - Bit 0
        const HC_HALTED = 1 << 0;
        /// Host System Error (HSE) - Bit 2
        const HOST_SYSTEM_ERROR = 1 << 2;
        /// Event Interrupt (EINT) - Bit 3
        const EVENT_INTERRUPT = 1 << 3;
        /// Port Change Detect (PCD) - Bit 4
        const PORT_CHANGE_DETECT = 1 << 4;
        /// Controller Not Ready (CNR) - Bit 11
        const CONTROLLER_NOT_READY = 1 << 11;
        /// Host Controller Error (HCE) - Bit 12
        const HC_ERROR = 1 << 12;
    }
}

bitflags! {
    /// Port Status and Control Register (PORTSC) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PortSc: u32 {
        /// Current Connect Status (CCS) - Bit 0
        const CURRENT_CONNECT_STATUS = 1 << 0;
        /// Port Enabled/Disabled (PED) - Bit 1, RW1CS
        const PORT_ENABLED = 1 << 1;
        /// Over-current Active (OCA) - Bit 3
        const OVER_CURRENT_ACTIVE = 1 << 3;
        /// Port Reset (PR) - Bit 4
        const PORT_RESET = 1 << 4;
        /// Port Link State - Bits [8:5]
        const LINK_STATE_MASK = 0xF << 5;
        /// Port Power (PP) - Bit 9
        const PORT_POWER = 1 << 9;
        /// Port Speed - Bits [13:10]
        const PORT_SPEED_MASK = 0xF << 10;
        /// Port Indicator Control - Bits [15:14]
        const PORT_INDICATOR_MASK = 0b11 << 14;
        /// Port Link State Write Strobe (LWS) - Bit 16
        const LINK_WRITE_STROBE = 1 << 16;
        /// Connect Status Change (CSC) - Bit 17
        const CONNECT_STATUS_CHANGE = 1 << 17;
        /// Port Enabled/Disabled Change (PEC) - Bit 18
        const PORT_ENABLE_CHANGE = 1 << 18;
        /// Warm Port Reset Change (WRC) - Bit 19
        const WARM_RESET_CHANGE = 1 << 19;
        /// Over-current Change (OCC) - Bit 20
        const OVER_CURRENT_CHANGE = 1 << 20;
        /// Port Reset Change (PRC) - Bit 21
        const PORT_RESET_CHANGE = 1 << 21;
        /// Port Link State Change (PLC) - Bit 22
        const LINK_STATE_CHANGE = 1 << 22;
        /// Port Config Error Change (CEC) - Bit 23
        const CONFIG_ERROR_CHANGE = 1 << 23;
        /// Cold Attach Status (CAS) - Bit 24
        const COLD_ATTACH_STATUS = 1 << 24;
        /// Wake on Connect Enable (WCE) - Bit 25
        const WAKE_ON_CONNECT_ENABLE = 1 << 25;
        /// Wake on Disconnect Enable (WDE) - Bit 26
        const WAKE_ON_DISCONNECT_ENABLE = 1 << 26;
        /// Wake on Over-current Enable (WOE) - Bit 27
        const WAKE_ON_OVER_CURRENT_ENABLE = 1 << 27;
    }
}

impl PortSc {
    /// All RW1C change bits
    pub const CHANGE_BITS: Self = Self::CONNECT_STATUS_CHANGE
        .union(Self::PORT_ENABLE_CHANGE)
        .union(Self::WARM_RESET_CHANGE)
        .union(Self::OVER_CURRENT_CHANGE)
        .union(Self::PORT_RESET_CHANGE)
        .union(Self::LINK_STATE_CHANGE)
        .union(Self::CONFIG_ERROR_CHANGE);

    /// Bits that must be written back unchanged on any PORTSC write
    pub const PRESERVE_BITS: Self = Self::PORT_POWER
        .union(Self::PORT_INDICATOR_MASK)
        .union(Self::WAKE_ON_CONNECT_ENABLE)
        .union(Self::WAKE_ON_DISCONNECT_ENABLE)
        .union(Self::WAKE_ON_OVER_CURRENT_ENABLE);

    /// Value to write that keeps preserved bits and clears nothing
    pub const fn write_base(self) -> Self {
        self.intersection(Self::PRESERVE_BITS)
    }

    /// Negotiated speed
    pub const fn speed(self) -> PortSpeed {
        PortSpeed::from_psiv(((self.bits() >> 10) & 0xF) as u8)
    }
}

bitflags! {
    /// Interrupter Management Register (IMAN) bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Iman: u32 {
        /// Interrupt Pending (IP) - Bit 0, RW1C
        const INTERRUPT_PENDING = 1 << 0;
        /// Interrupt Enable (IE) - Bit 1
        const INTERRUPT_ENABLE = 1 << 1;
    }
}

bitflags! {
    /// Command Ring Control Register (CRCR) low-dword bit definitions
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Crcr: u64 {
        /// Ring Cycle State (RCS) - Bit 0
        const RING_CYCLE_STATE = 1 << 0;
        /// Command Stop (CS) - Bit 1
        const COMMAND_STOP = 1 << 1;
        /// Command Abort (CA) - Bit 2
        const COMMAND_ABORT = 1 << 2;
        /// Command Ring Running (CRR) - Bit 3
        const COMMAND_RING_RUNNING = 1 << 3;
    }
}

/// Timeout constants (in microseconds)
pub mod timeouts {
    /// Host controller reset and CNR clear (xHCI does not bound this; 1 s is common)
    pub const HC_RESET_TIMEOUT_US: u32 = 1_000_000;
    /// Halt acknowledge after clearing R/S (16 ms per xHCI 5.4.1)
    pub const HALT_TIMEOUT_US: u32 = 16_000;
    /// Run acknowledge after setting R/S
    pub const RUN_TIMEOUT_US: u32 = 16_000;
    /// BIOS ownership handoff
    pub const OWNERSHIP_TIMEOUT_US: u32 = 1_000_000;
    /// Delay between register polls
    pub const POLL_INTERVAL_US: u32 = 10;
}
