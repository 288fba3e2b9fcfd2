//! DMA memory for the xHCI controller
//!
//! Everything the controller reads or writes by bus-master DMA lives in one
//! [`ControllerMemory`] region that the caller places statically (or leaks)
//! and hands over at construction. Each structure carries the alignment the
//! xHCI specification requires, so no runtime allocator is involved.
//!
//! **CRITICAL**: the region must be DMA-coherent and identity mapped
//! (virtual address == bus address). On platforms with a non-coherent
//! cache, place it in an uncached section:
//!
//! ```ignore
//! #[link_section = ".dma"]
//! static mut XHCI_MEMORY: ControllerMemory = ControllerMemory::new();
//! ```

pub mod memory;

pub use memory::{MemoryMap, SlotAllocator, SlotBuffers};

use crate::xhci::ring::EventRingSegmentTableEntry;
use crate::xhci::trb::Trb;

/// Device slots backed by memory (MaxSlotsEn never exceeds this)
pub const MAX_SLOTS: usize = 8;

/// TRBs per command/transfer ring segment, including the Link TRB
pub const RING_SEGMENT_TRBS: usize = 32;

/// TRBs in the primary event ring segment
pub const EVENT_RING_TRBS: usize = 64;

/// Scratchpad pages this region can provide
pub const MAX_SCRATCHPAD_BUFFERS: usize = 8;

/// Control transfer data stage buffer
pub const CONTROL_BUFFER_SIZE: usize = 256;

/// Interrupt IN report buffer
pub const REPORT_BUFFER_SIZE: usize = 64;

/// Controller page size this driver programs against
pub const PAGE_SIZE: usize = 4096;

/// Largest context entry (CSZ = 1) in dwords
pub const CONTEXT_ENTRY_DWORDS: usize = 16;

/// Device context: slot context + 31 endpoint contexts
pub const DEVICE_CONTEXT_DWORDS: usize = 32 * CONTEXT_ENTRY_DWORDS;

/// Input context: input control context + device context
pub const INPUT_CONTEXT_DWORDS: usize = 33 * CONTEXT_ENTRY_DWORDS;

/// Bus address of a DMA object (identity mapping)
#[inline(always)]
pub fn phys_addr<T>(ptr: *const T) -> u64 {
    ptr as usize as u64
}

/// One ring segment
///
/// 1 KiB alignment keeps segments of up to 64 TRBs inside a 64 KiB
/// boundary, as xHCI 6.5 requires.
#[repr(C, align(1024))]
pub struct TrbSegment<const N: usize>(pub [Trb; N]);

impl<const N: usize> TrbSegment<N> {
    /// Zeroed segment
    pub const fn new() -> Self {
        Self([Trb::EMPTY; N])
    }
}

impl<const N: usize> Default for TrbSegment<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Device or input context buffer (64-byte aligned)
#[repr(C, align(64))]
pub struct ContextBuffer<const N: usize>(pub [u32; N]);

impl<const N: usize> ContextBuffer<N> {
    /// Zeroed context
    pub const fn new() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> Default for ContextBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Transfer data buffer (64-byte aligned)
#[repr(C, align(64))]
pub struct DataBuffer<const N: usize>(pub [u8; N]);

impl<const N: usize> DataBuffer<N> {
    /// Zeroed buffer
    pub const fn new() -> Self {
        Self([0; N])
    }
}

impl<const N: usize> Default for DataBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Scratchpad buffer page handed to the controller
#[repr(C, align(4096))]
pub struct ScratchpadPage(pub [u8; PAGE_SIZE]);

impl ScratchpadPage {
    /// Zeroed page
    pub const fn new() -> Self {
        Self([0; PAGE_SIZE])
    }
}

/// Device Context Base Address Array; entry 0 points at the scratchpad array
#[repr(C, align(64))]
pub struct Dcbaa(pub [u64; MAX_SLOTS + 1]);

/// Scratchpad Buffer Array
#[repr(C, align(64))]
pub struct ScratchpadArray(pub [u64; MAX_SCRATCHPAD_BUFFERS]);

/// Per-slot DMA structures
#[repr(C)]
pub struct SlotMemory {
    /// Output device context, written by the controller
    pub device_context: ContextBuffer<DEVICE_CONTEXT_DWORDS>,
    /// Input context for Address Device / Configure Endpoint
    pub input_context: ContextBuffer<INPUT_CONTEXT_DWORDS>,
    /// Default control endpoint transfer ring
    pub control_ring: TrbSegment<RING_SEGMENT_TRBS>,
    /// Interrupt IN endpoint transfer ring
    pub interrupt_ring: TrbSegment<RING_SEGMENT_TRBS>,
    /// Control transfer data stage buffer
    pub control_buffer: DataBuffer<CONTROL_BUFFER_SIZE>,
    /// Interrupt IN report buffer
    pub report_buffer: DataBuffer<REPORT_BUFFER_SIZE>,
}

impl SlotMemory {
    /// Zeroed slot memory
    pub const fn new() -> Self {
        Self {
            device_context: ContextBuffer::new(),
            input_context: ContextBuffer::new(),
            control_ring: TrbSegment::new(),
            interrupt_ring: TrbSegment::new(),
            control_buffer: DataBuffer::new(),
            report_buffer: DataBuffer::new(),
        }
    }
}

/// All DMA memory used by one controller
#[repr(C, align(4096))]
pub struct ControllerMemory {
    /// Scratchpad pages (page aligned, so first)
    pub scratchpad: [ScratchpadPage; MAX_SCRATCHPAD_BUFFERS],
    /// Device Context Base Address Array
    pub dcbaa: Dcbaa,
    /// Scratchpad Buffer Array
    pub scratchpad_array: ScratchpadArray,
    /// Event Ring Segment Table (one segment)
    pub erst: [EventRingSegmentTableEntry; 1],
    /// Command ring segment
    pub command_ring: TrbSegment<RING_SEGMENT_TRBS>,
    /// Primary event ring segment
    pub event_ring: TrbSegment<EVENT_RING_TRBS>,
    /// Per-slot structures, index = slot ID - 1
    pub slots: [SlotMemory; MAX_SLOTS],
}

impl ControllerMemory {
    /// Zeroed region, usable in a `static` initializer
    pub const fn new() -> Self {
        Self {
            scratchpad: [const { ScratchpadPage::new() }; MAX_SCRATCHPAD_BUFFERS],
            dcbaa: Dcbaa([0; MAX_SLOTS + 1]),
            scratchpad_array: ScratchpadArray([0; MAX_SCRATCHPAD_BUFFERS]),
            erst: [EventRingSegmentTableEntry::EMPTY],
            command_ring: TrbSegment::new(),
            event_ring: TrbSegment::new(),
            slots: [const { SlotMemory::new() }; MAX_SLOTS],
        }
    }
}

impl Default for ControllerMemory {
    fn default() -> Self {
        Self::new()
    }
}

// Ensure alignment of the structures the controller dereferences
const _: () = {
    assert!(core::mem::align_of::<TrbSegment<RING_SEGMENT_TRBS>>() >= 64);
    assert!(core::mem::size_of::<TrbSegment<EVENT_RING_TRBS>>() <= 1024);
    assert!(core::mem::align_of::<Dcbaa>() == 64);
    assert!(core::mem::align_of::<ScratchpadPage>() == PAGE_SIZE);
    assert!(core::mem::size_of::<ContextBuffer<DEVICE_CONTEXT_DWORDS>>() == 2048);
    assert!(core::mem::size_of::<ContextBuffer<INPUT_CONTEXT_DWORDS>>() == 2112);
    assert!(core::mem::align_of::<EventRingSegmentTableEntry>() == 64);
};
