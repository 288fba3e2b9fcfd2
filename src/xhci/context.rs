//! Slot and endpoint contexts
//!
//! Encoders for the input context handed to Address Device and Configure
//! Endpoint (xHCI 6.2), working on raw dword buffers so the same code
//! serves controllers with 32-byte and 64-byte contexts (HCCPARAMS1.CSZ).

use core::ptr::{read_volatile, write_volatile, NonNull};

use crate::dma::{phys_addr, DEVICE_CONTEXT_DWORDS, INPUT_CONTEXT_DWORDS};

use super::PortSpeed;

/// Context entry size selected by HCCPARAMS1.CSZ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ContextSize {
    /// 32-byte contexts
    Bytes32,
    /// 64-byte contexts
    Bytes64,
}

impl ContextSize {
    /// Entry stride in dwords
    pub const fn dwords(self) -> usize {
        match self {
            Self::Bytes32 => 8,
            Self::Bytes64 => 16,
        }
    }
}

/// Endpoint type field of an endpoint context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum EndpointType {
    IsochOut = 1,
    BulkOut = 2,
    InterruptOut = 3,
    Control = 4,
    IsochIn = 5,
    BulkIn = 6,
    InterruptIn = 7,
}

/// Device Context Index of an endpoint address (EP0 = 1)
pub const fn device_context_index(endpoint_address: u8) -> u8 {
    let number = endpoint_address & 0x0F;
    if number == 0 {
        1
    } else {
        number * 2 + ((endpoint_address >> 7) & 1)
    }
}

/// Endpoint context Interval for an interrupt endpoint (xHCI 6.2.3.6)
///
/// Full/low speed `bInterval` is in 1 ms frames; high and super speed use
/// 2^(bInterval-1) microframes. The result is a power-of-two exponent of
/// 125 µs units.
pub fn interrupt_interval(speed: PortSpeed, b_interval: u8) -> u8 {
    match speed {
        PortSpeed::FullSpeed | PortSpeed::LowSpeed | PortSpeed::Unknown => {
            let microframes = (b_interval.max(1) as u32) * 8;
            // floor(log2)
            let exponent = 31 - microframes.leading_zeros();
            exponent.clamp(3, 10) as u8
        }
        PortSpeed::HighSpeed | PortSpeed::SuperSpeed | PortSpeed::SuperSpeedPlus => {
            b_interval.clamp(1, 16) - 1
        }
    }
}

/// Slot context fields this driver programs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotContext {
    /// Route string (0 for root-port devices)
    pub route_string: u32,
    /// Device speed
    pub speed: PortSpeed,
    /// Index of the last valid endpoint context
    pub context_entries: u8,
    /// Root hub port number (1-based)
    pub root_port: u8,
}

impl SlotContext {
    fn encode(&self, out: &mut [u32; 4]) {
        out[0] = (self.route_string & 0x000F_FFFF)
            | ((self.speed.psiv() as u32 & 0xF) << 20)
            | ((self.context_entries as u32 & 0x1F) << 27);
        out[1] = (self.root_port as u32) << 16;
        out[2] = 0;
        out[3] = 0;
    }
}

/// Endpoint context fields this driver programs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointContext {
    /// Endpoint type
    pub endpoint_type: EndpointType,
    /// Max packet size
    pub max_packet_size: u16,
    /// Max burst size (0 below SuperSpeed)
    pub max_burst: u8,
    /// Interval exponent
    pub interval: u8,
    /// Error count (CErr)
    pub error_count: u8,
    /// Transfer ring dequeue pointer
    pub dequeue_pointer: u64,
    /// Dequeue cycle state
    pub dequeue_cycle: bool,
    /// Average TRB length
    pub average_trb_length: u16,
    /// Max ESIT payload (periodic endpoints)
    pub max_esit_payload: u16,
}

impl EndpointContext {
    /// Default control endpoint with a fresh transfer ring
    pub fn control(max_packet_size: u16, ring: u64) -> Self {
        Self {
            endpoint_type: EndpointType::Control,
            max_packet_size,
            max_burst: 0,
            interval: 0,
            error_count: 3,
            dequeue_pointer: ring,
            dequeue_cycle: true,
            average_trb_length: 8,
            max_esit_payload: 0,
        }
    }

    /// Interrupt IN endpoint with a fresh transfer ring
    pub fn interrupt_in(speed: PortSpeed, max_packet_size: u16, b_interval: u8, ring: u64) -> Self {
        Self {
            endpoint_type: EndpointType::InterruptIn,
            max_packet_size,
            max_burst: 0,
            interval: interrupt_interval(speed, b_interval),
            error_count: 3,
            dequeue_pointer: ring,
            dequeue_cycle: true,
            average_trb_length: max_packet_size,
            max_esit_payload: max_packet_size,
        }
    }

    fn encode(&self, out: &mut [u32; 5]) {
        out[0] = (self.interval as u32) << 16;
        out[1] = ((self.error_count as u32 & 0x3) << 1)
            | ((self.endpoint_type as u32) << 3)
            | ((self.max_burst as u32) << 8)
            | ((self.max_packet_size as u32) << 16);
        let dequeue = (self.dequeue_pointer & !0xF) | self.dequeue_cycle as u64;
        out[2] = dequeue as u32;
        out[3] = (dequeue >> 32) as u32;
        out[4] = (self.average_trb_length as u32) | ((self.max_esit_payload as u32) << 16);
    }
}

/// Input context in DMA memory
pub struct InputContext {
    base: NonNull<u32>,
    size: ContextSize,
}

impl InputContext {
    /// Wrap an input context buffer of `INPUT_CONTEXT_DWORDS` dwords
    ///
    /// # Safety
    ///
    /// `base` must be valid for `INPUT_CONTEXT_DWORDS` dword writes for the
    /// lifetime of the value, 64-byte aligned, and owned by the caller.
    pub unsafe fn new(base: NonNull<u32>, size: ContextSize) -> Self {
        Self { base, size }
    }

    /// Bus address for Address Device / Configure Endpoint
    pub fn address(&self) -> u64 {
        phys_addr(self.base.as_ptr())
    }

    /// Zero every entry
    pub fn clear(&mut self) {
        for i in 0..INPUT_CONTEXT_DWORDS {
            self.write(i, 0);
        }
    }

    /// Input control context: add and drop flags
    pub fn set_control(&mut self, add_flags: u32, drop_flags: u32) {
        self.write(0, drop_flags);
        self.write(1, add_flags);
    }

    /// Write the slot context (entry 1)
    pub fn set_slot(&mut self, slot: &SlotContext) {
        let mut dwords = [0u32; 4];
        slot.encode(&mut dwords);
        let offset = self.size.dwords();
        for (i, value) in dwords.iter().enumerate() {
            self.write(offset + i, *value);
        }
    }

    /// Write the endpoint context for `dci` (entry dci + 1)
    pub fn set_endpoint(&mut self, dci: u8, endpoint: &EndpointContext) {
        let mut dwords = [0u32; 5];
        endpoint.encode(&mut dwords);
        let offset = self.size.dwords() * (dci as usize + 1);
        for (i, value) in dwords.iter().enumerate() {
            self.write(offset + i, *value);
        }
    }

    fn write(&mut self, index: usize, value: u32) {
        debug_assert!(index < INPUT_CONTEXT_DWORDS);
        // SAFETY: index bounded by the buffer length per `new`
        unsafe { write_volatile(self.base.as_ptr().add(index), value) }
    }
}

/// Slot state reported in an output slot context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum SlotState {
    DisabledOrEnabled,
    Default,
    Addressed,
    Configured,
    Reserved(u8),
}

/// Output device context written by the controller
pub struct DeviceContext {
    base: NonNull<u32>,
}

impl DeviceContext {
    /// Wrap a device context buffer of `DEVICE_CONTEXT_DWORDS` dwords
    ///
    /// # Safety
    ///
    /// `base` must be valid for `DEVICE_CONTEXT_DWORDS` dword accesses for
    /// the lifetime of the value and 64-byte aligned.
    pub unsafe fn new(base: NonNull<u32>) -> Self {
        Self { base }
    }

    /// Bus address for the DCBAA entry
    pub fn address(&self) -> u64 {
        phys_addr(self.base.as_ptr())
    }

    /// Zero the context before handing it to the controller
    pub fn clear(&mut self) {
        for i in 0..DEVICE_CONTEXT_DWORDS {
            // SAFETY: i < DEVICE_CONTEXT_DWORDS
            unsafe { write_volatile(self.base.as_ptr().add(i), 0) };
        }
    }

    /// USB device address assigned by Address Device
    pub fn usb_address(&self) -> u8 {
        self.read(3) as u8
    }

    /// Slot state
    pub fn slot_state(&self) -> SlotState {
        match (self.read(3) >> 27) as u8 {
            0 => SlotState::DisabledOrEnabled,
            1 => SlotState::Default,
            2 => SlotState::Addressed,
            3 => SlotState::Configured,
            other => SlotState::Reserved(other),
        }
    }

    fn read(&self, index: usize) -> u32 {
        // SAFETY: slot context dwords are within the buffer
        unsafe { read_volatile(self.base.as_ptr().add(index)) }
    }
}

/// Add-context flag for entry `dci` (A0 is the slot context)
pub const fn add_flag(dci: u8) -> u32 {
    1 << dci
}
