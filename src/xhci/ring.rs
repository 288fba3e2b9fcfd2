//! Command, transfer and event rings
//!
//! A [`Ring`] is a single-segment producer ring (command ring, transfer
//! rings) closed by a Link TRB with Toggle Cycle set. An [`EventRing`] is
//! the consumer side of the controller's primary event ring segment.
//!
//! Ownership follows the cycle-bit convention of xHCI 4.9: an entry belongs
//! to the consumer when its cycle bit equals the consumer cycle state, and
//! the producer flips its cycle state every time it wraps.

use core::ptr::{addr_of, addr_of_mut, read_volatile, write_volatile, NonNull};
use core::sync::atomic::{fence, Ordering};

use crate::dma::phys_addr;
use crate::error::{Result, XhciError};

use super::trb::{control, Trb};

/// Producer ring of TRBs in DMA memory
pub struct Ring {
    base: NonNull<Trb>,
    len: usize,
    enqueue: usize,
    dequeue: usize,
    cycle: bool,
}

impl Ring {
    /// Wrap a segment of `len` TRBs; the last one becomes the Link TRB
    ///
    /// # Safety
    ///
    /// `base` must point to `len` TRBs of DMA-visible memory that stays
    /// valid, and is not written by software through any other path, for
    /// the lifetime of the ring. `len` must be at least 3.
    pub unsafe fn new(base: NonNull<Trb>, len: usize) -> Self {
        debug_assert!(len >= 3);
        let mut ring = Self {
            base,
            len,
            enqueue: 0,
            dequeue: 0,
            cycle: true,
        };
        ring.reset();
        ring
    }

    /// Zero the segment, rewrite the Link TRB and restart at cycle 1
    pub fn reset(&mut self) {
        for i in 0..self.len {
            self.write_entry(i, Trb::EMPTY);
        }
        self.write_entry(self.len - 1, Trb::link(self.base_address()));
        self.enqueue = 0;
        self.dequeue = 0;
        self.cycle = true;
    }

    /// Physical address of the first TRB
    pub fn base_address(&self) -> u64 {
        phys_addr(self.base.as_ptr())
    }

    /// Producer cycle state
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    /// Usable entries (excluding the Link TRB)
    pub fn capacity(&self) -> usize {
        self.len - 1
    }

    /// TRBs pushed and not yet retired
    pub fn outstanding(&self) -> usize {
        let usable = self.capacity();
        (self.enqueue + usable - self.dequeue) % usable
    }

    /// Whether another push would fail
    pub fn is_full(&self) -> bool {
        (self.enqueue + 1) % self.capacity() == self.dequeue
    }

    /// Write `trb` at the enqueue position and hand it to the controller
    ///
    /// Returns the physical address of the written TRB, which identifies it
    /// in the completion event.
    pub fn push(&mut self, trb: Trb) -> Result<u64> {
        if self.is_full() {
            return Err(XhciError::RingFull);
        }

        let index = self.enqueue;
        let cycle = if self.cycle { control::CYCLE } else { 0 };
        let ptr = self.entry_ptr(index);
        // SAFETY: index < len, memory owned by this ring per `new`
        unsafe {
            write_volatile(addr_of_mut!((*ptr).parameter), trb.parameter);
            write_volatile(addr_of_mut!((*ptr).status), trb.status);
            // Control dword carries ownership; it must land last
            fence(Ordering::Release);
            write_volatile(
                addr_of_mut!((*ptr).control),
                (trb.control & !control::CYCLE) | cycle,
            );
        }
        let address = phys_addr(ptr);

        self.enqueue += 1;
        if self.enqueue == self.len - 1 {
            let link = self.entry_ptr(self.len - 1);
            // SAFETY: the Link TRB is part of the ring segment
            unsafe {
                let ctrl = read_volatile(addr_of!((*link).control));
                fence(Ordering::Release);
                write_volatile(addr_of_mut!((*link).control), (ctrl & !control::CYCLE) | cycle);
            }
            self.cycle = !self.cycle;
            self.enqueue = 0;
        }

        Ok(address)
    }

    /// Mark everything up to and including the TRB at `address` as consumed
    pub fn retire(&mut self, address: u64) -> Result<()> {
        let index = self.index_of(address)?;
        self.dequeue = (index + 1) % self.capacity();
        Ok(())
    }

    /// Whether `address` is a TRB of this ring
    pub fn contains(&self, address: u64) -> bool {
        self.index_of(address).is_ok()
    }

    fn index_of(&self, address: u64) -> Result<usize> {
        let base = self.base_address();
        let offset = address.wrapping_sub(base);
        let size = core::mem::size_of::<Trb>() as u64;
        if address < base || offset % size != 0 || (offset / size) as usize >= self.capacity() {
            return Err(XhciError::RingCorruption);
        }
        Ok((offset / size) as usize)
    }

    fn entry_ptr(&self, index: usize) -> *mut Trb {
        // SAFETY: callers keep index < len
        unsafe { self.base.as_ptr().add(index) }
    }

    fn write_entry(&mut self, index: usize, trb: Trb) {
        // SAFETY: index < len, memory owned by this ring
        unsafe { write_volatile(self.entry_ptr(index), trb) }
    }
}

/// Consumer side of the primary event ring (single segment)
pub struct EventRing {
    base: NonNull<Trb>,
    len: usize,
    dequeue: usize,
    cycle: bool,
}

impl EventRing {
    /// Wrap an event ring segment of `len` TRBs
    ///
    /// # Safety
    ///
    /// `base` must point to `len` TRBs of DMA-visible memory that stays
    /// valid for the lifetime of the ring and is written only by the
    /// controller once the ring is programmed.
    pub unsafe fn new(base: NonNull<Trb>, len: usize) -> Self {
        let mut ring = Self {
            base,
            len,
            dequeue: 0,
            cycle: true,
        };
        ring.reset();
        ring
    }

    /// Zero the segment and expect cycle 1 at the first entry
    pub fn reset(&mut self) {
        for i in 0..self.len {
            // SAFETY: i < len
            unsafe { write_volatile(self.base.as_ptr().add(i), Trb::EMPTY) };
        }
        self.dequeue = 0;
        self.cycle = true;
    }

    /// Physical address of the segment
    pub fn segment_base(&self) -> u64 {
        phys_addr(self.base.as_ptr())
    }

    /// Segment size in TRBs
    pub fn len(&self) -> usize {
        self.len
    }

    /// Segments always hold at least one TRB
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Consumer cycle state
    pub fn cycle(&self) -> bool {
        self.cycle
    }

    /// Physical address of the dequeue position, for ERDP
    pub fn dequeue_pointer(&self) -> u64 {
        // SAFETY: dequeue < len
        phys_addr(unsafe { self.base.as_ptr().add(self.dequeue) })
    }

    /// Whether the entry at the dequeue position belongs to software
    pub fn has_front(&self) -> bool {
        // SAFETY: dequeue < len
        let ctrl = unsafe { read_volatile(addr_of!((*self.base.as_ptr().add(self.dequeue)).control)) };
        (ctrl & control::CYCLE != 0) == self.cycle
    }

    /// Copy of the front entry without consuming it
    pub fn front(&self) -> Option<Trb> {
        if !self.has_front() {
            return None;
        }
        fence(Ordering::Acquire);
        // SAFETY: dequeue < len
        Some(unsafe { read_volatile(self.base.as_ptr().add(self.dequeue)) })
    }

    /// Consume the front entry
    pub fn pop(&mut self) -> Option<Trb> {
        let trb = self.front()?;
        self.dequeue += 1;
        if self.dequeue == self.len {
            self.dequeue = 0;
            self.cycle = !self.cycle;
        }
        Some(trb)
    }
}

/// Event Ring Segment Table entry (xHCI 6.5)
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy, Default)]
pub struct EventRingSegmentTableEntry {
    /// Segment base address
    pub ring_segment_base: u64,
    /// Segment size in TRBs
    pub ring_segment_size: u32,
    _reserved: u32,
}

impl EventRingSegmentTableEntry {
    /// Empty entry
    pub const EMPTY: Self = Self {
        ring_segment_base: 0,
        ring_segment_size: 0,
        _reserved: 0,
    };

    /// Describe `ring`
    pub fn for_ring(ring: &EventRing) -> Self {
        Self {
            ring_segment_base: ring.segment_base(),
            ring_segment_size: ring.len() as u32,
            _reserved: 0,
        }
    }
}
