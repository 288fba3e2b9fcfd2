//! HID mouse support
//!
//! Implements HID Boot Protocol mouse reports (USB HID Spec 1.11, Appendix B.2)

use bitflags::bitflags;

/// HID mouse report (boot protocol)
///
/// - Byte 0: Button states
/// - Byte 1: X displacement (signed)
/// - Byte 2: Y displacement (signed)
/// - Byte 3: Wheel displacement, on mice that report one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseReport {
    /// Button states
    pub buttons: MouseButtons,
    /// X displacement (relative movement)
    pub x: i8,
    /// Y displacement (relative movement)
    pub y: i8,
    /// Scroll wheel displacement (if present)
    pub wheel: i8,
}

impl MouseReport {
    /// Parse a 3- or 4-byte boot report; `None` if shorter
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 3 {
            return None;
        }

        Some(Self {
            buttons: MouseButtons::from_bits_truncate(data[0]),
            x: data[1] as i8,
            y: data[2] as i8,
            wheel: data.get(3).map_or(0, |&w| w as i8),
        })
    }

    /// Check if mouse moved
    pub fn has_movement(&self) -> bool {
        self.x != 0 || self.y != 0 || self.wheel != 0
    }
}

bitflags! {
    /// Mouse button states
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MouseButtons: u8 {
        /// Button 1 (left button)
        const LEFT   = 0b00000001;
        /// Button 2 (right button)
        const RIGHT  = 0b00000010;
        /// Button 3 (middle button / wheel click)
        const MIDDLE = 0b00000100;
    }
}
