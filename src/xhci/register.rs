//! Register access for xHCI
//!
//! All MMIO goes through [`RegisterBus`], so the controller core runs the
//! same against real hardware ([`MmioBus`]) and against a software model.
//! Offsets are byte offsets from the controller's MMIO base.

use core::ptr::{read_volatile, write_volatile};
use core::sync::atomic::{fence, Ordering};

use embedded_hal::delay::DelayNs;

use crate::error::{Result, XhciError};

/// Dword-granular access to the controller register space
pub trait RegisterBus {
    /// Read the 32-bit register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`
    fn write32(&mut self, offset: usize, value: u32);

    /// Read a 64-bit register as two dwords, low first
    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    /// Write a 64-bit register as two dwords, low first
    ///
    /// xHCI latches 64-bit registers on the high-dword write.
    fn write64(&mut self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }

    /// Read-modify-write of a 32-bit register
    #[inline]
    fn modify32<F>(&mut self, offset: usize, f: F)
    where
        F: FnOnce(u32) -> u32,
        Self: Sized,
    {
        let current = self.read32(offset);
        self.write32(offset, f(current));
    }
}

/// Volatile memory-mapped register access
pub struct MmioBus {
    base: usize,
}

impl MmioBus {
    /// Create a bus over the register space at `base`
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of a mapped xHCI register space
    /// (uncached), valid for the lifetime of the bus, and not accessed
    /// through any other path while the bus is in use.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    /// MMIO base address
    pub const fn base(&self) -> usize {
        self.base
    }
}

impl RegisterBus for MmioBus {
    #[inline(always)]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: `new` requires a valid mapping for the whole register space
        let value = unsafe { read_volatile((self.base + offset) as *const u32) };
        fence(Ordering::Acquire);
        value
    }

    #[inline(always)]
    fn write32(&mut self, offset: usize, value: u32) {
        fence(Ordering::Release);
        // SAFETY: see `read32`
        unsafe { write_volatile((self.base + offset) as *mut u32, value) };
    }
}

/// Bounded polling of a register condition
pub struct RegisterTimeout {
    timeout_us: u32,
    poll_interval_us: u32,
}

impl RegisterTimeout {
    /// Create new timeout with duration in microseconds
    pub const fn new_us(timeout_us: u32) -> Self {
        Self {
            timeout_us,
            poll_interval_us: super::timeouts::POLL_INTERVAL_US,
        }
    }

    /// Override the delay between polls
    pub const fn with_poll_interval_us(mut self, poll_interval_us: u32) -> Self {
        self.poll_interval_us = if poll_interval_us == 0 {
            1
        } else {
            poll_interval_us
        };
        self
    }

    /// Wait for condition with timeout
    ///
    /// The condition is checked at least once, and once more after the
    /// final delay, so a zero timeout still observes the current state.
    pub fn wait_for<D, F>(&self, delay: &mut D, mut condition: F) -> Result<()>
    where
        D: DelayNs,
        F: FnMut() -> bool,
    {
        let mut elapsed_us: u32 = 0;
        while !condition() {
            if elapsed_us >= self.timeout_us {
                return Err(XhciError::Timeout);
            }
            delay.delay_us(self.poll_interval_us);
            elapsed_us = elapsed_us.saturating_add(self.poll_interval_us);
        }
        Ok(())
    }
}
