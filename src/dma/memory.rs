//! Controller memory map
//!
//! Converts the caller's `&'static mut ControllerMemory` into raw pointers
//! once, so rings and contexts can share the region with the controller's
//! DMA engine, and tracks which slot's memory is claimed with a bit mask.

use core::ptr::{addr_of_mut, write_volatile, NonNull};

use crate::error::{Result, XhciError};
use crate::xhci::ring::EventRingSegmentTableEntry;
use crate::xhci::trb::Trb;

use super::{phys_addr, ControllerMemory, ScratchpadPage, SlotMemory, MAX_SCRATCHPAD_BUFFERS, MAX_SLOTS};

/// Raw view of a [`ControllerMemory`] region
pub struct MemoryMap {
    region: NonNull<ControllerMemory>,
}

impl MemoryMap {
    /// Take over `memory` for the lifetime of the program
    pub fn new(memory: &'static mut ControllerMemory) -> Self {
        Self {
            region: NonNull::from(memory),
        }
    }

    fn region(&self) -> *mut ControllerMemory {
        self.region.as_ptr()
    }

    /// Command ring segment
    pub fn command_ring(&self) -> (NonNull<Trb>, usize) {
        // SAFETY: region is valid for 'static and never moved
        let segment = unsafe { addr_of_mut!((*self.region()).command_ring.0) };
        segment_of(segment)
    }

    /// Primary event ring segment
    pub fn event_ring(&self) -> (NonNull<Trb>, usize) {
        // SAFETY: see `command_ring`
        let segment = unsafe { addr_of_mut!((*self.region()).event_ring.0) };
        segment_of(segment)
    }

    /// Bus address of the DCBAA
    pub fn dcbaa_address(&self) -> u64 {
        // SAFETY: see `command_ring`
        phys_addr(unsafe { addr_of_mut!((*self.region()).dcbaa) })
    }

    /// Write DCBAA entry `index` (0 = scratchpad array, else slot ID)
    pub fn set_dcbaa_entry(&mut self, index: usize, address: u64) {
        debug_assert!(index <= MAX_SLOTS);
        // SAFETY: index bounded by the array length
        unsafe { write_volatile(addr_of_mut!((*self.region()).dcbaa.0[index]), address) };
    }

    /// Zero the whole DCBAA
    pub fn clear_dcbaa(&mut self) {
        for index in 0..=MAX_SLOTS {
            self.set_dcbaa_entry(index, 0);
        }
    }

    /// Fill the scratchpad array with `count` pages and return its address
    pub fn bind_scratchpad(&mut self, count: usize) -> Result<u64> {
        if count > MAX_SCRATCHPAD_BUFFERS {
            return Err(XhciError::Unsupported);
        }
        let region = self.region();
        for index in 0..MAX_SCRATCHPAD_BUFFERS {
            // SAFETY: index < MAX_SCRATCHPAD_BUFFERS
            unsafe {
                let page: *mut ScratchpadPage = addr_of_mut!((*region).scratchpad[index]);
                let entry = if index < count { phys_addr(page) } else { 0 };
                write_volatile(addr_of_mut!((*region).scratchpad_array.0[index]), entry);
            }
        }
        // SAFETY: see `command_ring`
        Ok(phys_addr(unsafe { addr_of_mut!((*region).scratchpad_array) }))
    }

    /// Write the single event ring segment table entry and return its address
    pub fn write_erst(&mut self, entry: EventRingSegmentTableEntry) -> u64 {
        // SAFETY: see `command_ring`
        unsafe {
            let erst = addr_of_mut!((*self.region()).erst[0]);
            write_volatile(erst, entry);
            phys_addr(erst)
        }
    }

    /// Buffers of device slot `slot_id` (1-based)
    pub fn slot(&self, slot_id: u8) -> Result<SlotBuffers> {
        let index = slot_index(slot_id)?;
        // SAFETY: index < MAX_SLOTS
        let slot: *mut SlotMemory = unsafe { addr_of_mut!((*self.region()).slots[index]) };
        // SAFETY: all fields lie inside the 'static region
        unsafe {
            Ok(SlotBuffers {
                device_context: nonnull(addr_of_mut!((*slot).device_context.0).cast()),
                input_context: nonnull(addr_of_mut!((*slot).input_context.0).cast()),
                control_ring: segment_of(addr_of_mut!((*slot).control_ring.0)),
                interrupt_ring: segment_of(addr_of_mut!((*slot).interrupt_ring.0)),
                control_buffer: nonnull(addr_of_mut!((*slot).control_buffer.0).cast()),
                report_buffer: nonnull(addr_of_mut!((*slot).report_buffer.0).cast()),
            })
        }
    }
}

/// Raw pointers into one [`SlotMemory`]
#[derive(Debug, Clone, Copy)]
pub struct SlotBuffers {
    /// Output device context
    pub device_context: NonNull<u32>,
    /// Input context
    pub input_context: NonNull<u32>,
    /// Control ring segment and length
    pub control_ring: (NonNull<Trb>, usize),
    /// Interrupt ring segment and length
    pub interrupt_ring: (NonNull<Trb>, usize),
    /// Control data buffer (`CONTROL_BUFFER_SIZE` bytes)
    pub control_buffer: NonNull<u8>,
    /// Report buffer (`REPORT_BUFFER_SIZE` bytes)
    pub report_buffer: NonNull<u8>,
}

/// Bit-mask tracking of claimed slot memory
#[derive(Debug, Default)]
pub struct SlotAllocator {
    allocated: u32,
}

const _: () = assert!(MAX_SLOTS <= 32);

impl SlotAllocator {
    /// No slots claimed
    pub const fn new() -> Self {
        Self { allocated: 0 }
    }

    /// Claim the memory of `slot_id` (as assigned by Enable Slot)
    pub fn claim(&mut self, slot_id: u8) -> Result<()> {
        let bit = 1u32 << slot_index(slot_id)?;
        if self.allocated & bit != 0 {
            return Err(XhciError::NoResources);
        }
        self.allocated |= bit;
        Ok(())
    }

    /// Release the memory of `slot_id`
    pub fn release(&mut self, slot_id: u8) -> Result<()> {
        let bit = 1u32 << slot_index(slot_id)?;
        self.allocated &= !bit;
        Ok(())
    }

    /// Whether `slot_id` is claimed
    pub fn is_claimed(&self, slot_id: u8) -> bool {
        match slot_index(slot_id) {
            Ok(index) => self.allocated & (1 << index) != 0,
            Err(_) => false,
        }
    }

    /// Slots still free
    pub fn available(&self) -> u8 {
        (MAX_SLOTS as u32 - self.allocated.count_ones()) as u8
    }

    /// Release everything
    pub fn reset(&mut self) {
        self.allocated = 0;
    }
}

fn slot_index(slot_id: u8) -> Result<usize> {
    if slot_id == 0 || slot_id as usize > MAX_SLOTS {
        return Err(XhciError::InvalidSlotId);
    }
    Ok(slot_id as usize - 1)
}

fn segment_of<const N: usize>(segment: *mut [Trb; N]) -> (NonNull<Trb>, usize) {
    (nonnull(segment.cast()), N)
}

fn nonnull<T>(ptr: *mut T) -> NonNull<T> {
    // Derived from a NonNull region pointer, so never null
    NonNull::new(ptr).unwrap_or(NonNull::dangling())
}
