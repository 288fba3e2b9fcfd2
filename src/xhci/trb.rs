//! Transfer Request Block (TRB) layout and constructors
//!
//! Based on xHCI Specification 1.2, Section 6.4

use crate::transfer::SetupPacket;

/// TRB control dword field definitions
#[allow(missing_docs)]
pub mod control {
    pub const CYCLE: u32 = 1 << 0;
    /// Link TRB: toggle the consumer cycle state
    pub const TOGGLE_CYCLE: u32 = 1 << 1;
    /// Event Data flag on transfer events
    pub const EVENT_DATA: u32 = 1 << 2;
    pub const INTERRUPT_ON_SHORT_PACKET: u32 = 1 << 2;
    pub const CHAIN: u32 = 1 << 4;
    pub const INTERRUPT_ON_COMPLETION: u32 = 1 << 5;
    pub const IMMEDIATE_DATA: u32 = 1 << 6;

    pub const TYPE_SHIFT: u32 = 10;
    pub const TYPE_MASK: u32 = 0x3F;

    /// Data/Status stage direction bit (1 = IN)
    pub const DIR_IN: u32 = 1 << 16;

    /// Setup stage transfer type field
    pub const TRT_SHIFT: u32 = 16;
    pub const TRT_NO_DATA: u32 = 0;
    pub const TRT_OUT: u32 = 2;
    pub const TRT_IN: u32 = 3;

    pub const ENDPOINT_ID_SHIFT: u32 = 16;
    pub const SLOT_ID_SHIFT: u32 = 24;
}

/// TRB type identifiers (xHCI Table 6-91)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum TrbType {
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Link,
    EnableSlotCommand,
    DisableSlotCommand,
    AddressDeviceCommand,
    ConfigureEndpointCommand,
    NoOpCommand,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    HostControllerEvent,
    /// Any type this driver does not interpret
    Unknown(u8),
}

impl TrbType {
    /// Decode the 6-bit type field
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Normal,
            2 => Self::SetupStage,
            3 => Self::DataStage,
            4 => Self::StatusStage,
            6 => Self::Link,
            9 => Self::EnableSlotCommand,
            10 => Self::DisableSlotCommand,
            11 => Self::AddressDeviceCommand,
            12 => Self::ConfigureEndpointCommand,
            23 => Self::NoOpCommand,
            32 => Self::TransferEvent,
            33 => Self::CommandCompletionEvent,
            34 => Self::PortStatusChangeEvent,
            37 => Self::HostControllerEvent,
            other => Self::Unknown(other),
        }
    }

    /// Raw 6-bit type field
    pub const fn raw(self) -> u8 {
        match self {
            Self::Normal => 1,
            Self::SetupStage => 2,
            Self::DataStage => 3,
            Self::StatusStage => 4,
            Self::Link => 6,
            Self::EnableSlotCommand => 9,
            Self::DisableSlotCommand => 10,
            Self::AddressDeviceCommand => 11,
            Self::ConfigureEndpointCommand => 12,
            Self::NoOpCommand => 23,
            Self::TransferEvent => 32,
            Self::CommandCompletionEvent => 33,
            Self::PortStatusChangeEvent => 34,
            Self::HostControllerEvent => 37,
            Self::Unknown(raw) => raw & 0x3F,
        }
    }
}

/// Completion codes reported in event TRBs (xHCI Table 6-90)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetected,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailable,
    SlotNotEnabled,
    EndpointNotEnabled,
    ShortPacket,
    ParameterError,
    ContextStateError,
    EventRingFull,
    Other(u8),
}

impl CompletionCode {
    /// Decode the 8-bit completion code
    pub const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Invalid,
            1 => Self::Success,
            2 => Self::DataBufferError,
            3 => Self::BabbleDetected,
            4 => Self::UsbTransactionError,
            5 => Self::TrbError,
            6 => Self::StallError,
            7 => Self::ResourceError,
            8 => Self::BandwidthError,
            9 => Self::NoSlotsAvailable,
            11 => Self::SlotNotEnabled,
            12 => Self::EndpointNotEnabled,
            13 => Self::ShortPacket,
            17 => Self::ParameterError,
            19 => Self::ContextStateError,
            21 => Self::EventRingFull,
            other => Self::Other(other),
        }
    }

    /// Raw 8-bit completion code
    pub const fn raw(self) -> u8 {
        match self {
            Self::Invalid => 0,
            Self::Success => 1,
            Self::DataBufferError => 2,
            Self::BabbleDetected => 3,
            Self::UsbTransactionError => 4,
            Self::TrbError => 5,
            Self::StallError => 6,
            Self::ResourceError => 7,
            Self::BandwidthError => 8,
            Self::NoSlotsAvailable => 9,
            Self::SlotNotEnabled => 11,
            Self::EndpointNotEnabled => 12,
            Self::ShortPacket => 13,
            Self::ParameterError => 17,
            Self::ContextStateError => 19,
            Self::EventRingFull => 21,
            Self::Other(raw) => raw,
        }
    }

    /// Success, or a short packet (data still valid)
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ShortPacket)
    }
}

/// Transfer Request Block
///
/// xHCI Specification Section 4.11. Every ring entry is 16 bytes and
/// 16-byte aligned; the cycle bit lives in bit 0 of `control`.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trb {
    /// Parameter (pointer, immediate data, or event payload)
    pub parameter: u64,
    /// Status (transfer length, completion code)
    pub status: u32,
    /// Control (cycle, flags, type, slot/endpoint IDs)
    pub control: u32,
}

const _: () = {
    assert!(core::mem::size_of::<Trb>() == 16);
    assert!(core::mem::align_of::<Trb>() == 16);
};

impl Trb {
    /// All-zero TRB; owned by software under either cycle parity
    pub const EMPTY: Self = Self {
        parameter: 0,
        status: 0,
        control: 0,
    };

    /// Create a TRB from its three fields
    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    const fn typed(trb_type: TrbType, parameter: u64, status: u32, flags: u32) -> Self {
        Self::new(
            parameter,
            status,
            flags | ((trb_type.raw() as u32) << control::TYPE_SHIFT),
        )
    }

    /// Cycle bit
    #[inline]
    pub const fn cycle(&self) -> bool {
        self.control & control::CYCLE != 0
    }

    /// Set or clear the cycle bit
    #[inline]
    pub fn set_cycle(&mut self, cycle: bool) {
        if cycle {
            self.control |= control::CYCLE;
        } else {
            self.control &= !control::CYCLE;
        }
    }

    /// Decoded TRB type
    pub const fn trb_type(&self) -> TrbType {
        TrbType::from_raw(((self.control >> control::TYPE_SHIFT) & control::TYPE_MASK) as u8)
    }

    /// Completion code of an event TRB
    pub const fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw((self.status >> 24) as u8)
    }

    /// Slot ID of an event or command TRB
    pub const fn slot_id(&self) -> u8 {
        (self.control >> control::SLOT_ID_SHIFT) as u8
    }

    /// Endpoint ID (DCI) of a transfer event
    pub const fn endpoint_id(&self) -> u8 {
        ((self.control >> control::ENDPOINT_ID_SHIFT) & 0x1F) as u8
    }

    /// Root port number of a port status change event
    pub const fn port_id(&self) -> u8 {
        (self.parameter >> 24) as u8
    }

    /// Bytes not transferred, from a transfer event
    pub const fn residual_length(&self) -> u32 {
        self.status & 0x00FF_FFFF
    }

    /// Link TRB pointing back at `segment_base`
    pub const fn link(segment_base: u64) -> Self {
        Self::typed(TrbType::Link, segment_base, 0, control::TOGGLE_CYCLE)
    }

    /// Enable Slot command (slot type 0)
    pub const fn enable_slot() -> Self {
        Self::typed(TrbType::EnableSlotCommand, 0, 0, 0)
    }

    /// Disable Slot command
    pub const fn disable_slot(slot_id: u8) -> Self {
        Self::typed(
            TrbType::DisableSlotCommand,
            0,
            0,
            (slot_id as u32) << control::SLOT_ID_SHIFT,
        )
    }

    /// Address Device command with BSR cleared
    pub const fn address_device(input_context: u64, slot_id: u8) -> Self {
        Self::typed(
            TrbType::AddressDeviceCommand,
            input_context,
            0,
            (slot_id as u32) << control::SLOT_ID_SHIFT,
        )
    }

    /// Configure Endpoint command
    pub const fn configure_endpoint(input_context: u64, slot_id: u8) -> Self {
        Self::typed(
            TrbType::ConfigureEndpointCommand,
            input_context,
            0,
            (slot_id as u32) << control::SLOT_ID_SHIFT,
        )
    }

    /// No Op command
    pub const fn no_op_command() -> Self {
        Self::typed(TrbType::NoOpCommand, 0, 0, 0)
    }

    /// Setup stage with the setup packet carried as immediate data
    pub fn setup_stage(setup: &SetupPacket) -> Self {
        let trt = if setup.length == 0 {
            control::TRT_NO_DATA
        } else if setup.is_in() {
            control::TRT_IN
        } else {
            control::TRT_OUT
        };
        Self::typed(
            TrbType::SetupStage,
            setup.to_u64(),
            8,
            control::IMMEDIATE_DATA | (trt << control::TRT_SHIFT),
        )
    }

    /// Data stage pointing at `buffer`; its event reports the residual length
    pub const fn data_stage(buffer: u64, length: u32, dir_in: bool) -> Self {
        let dir = if dir_in { control::DIR_IN } else { 0 };
        Self::typed(
            TrbType::DataStage,
            buffer,
            length & 0x1_FFFF,
            dir | control::INTERRUPT_ON_COMPLETION,
        )
    }

    /// Status stage; `interrupt` only for transfers without a data stage
    pub const fn status_stage(dir_in: bool, interrupt: bool) -> Self {
        let dir = if dir_in { control::DIR_IN } else { 0 };
        let ioc = if interrupt {
            control::INTERRUPT_ON_COMPLETION
        } else {
            0
        };
        Self::typed(TrbType::StatusStage, 0, 0, dir | ioc)
    }

    /// Normal TRB for an interrupt IN transfer into `buffer`
    pub const fn normal(buffer: u64, length: u32) -> Self {
        Self::typed(
            TrbType::Normal,
            buffer,
            length & 0x1_FFFF,
            control::INTERRUPT_ON_COMPLETION | control::INTERRUPT_ON_SHORT_PACKET,
        )
    }
}
