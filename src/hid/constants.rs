//! HID protocol constants
//!
//! Standard constants from USB HID Specification 1.11

/// HID interface class code
pub const HID_CLASS: u8 = 0x03;

/// HID subclass codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HidSubclass {
    /// No subclass
    None = 0x00,
    /// Boot interface subclass
    Boot = 0x01,
}

/// HID boot interface protocol codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum HidProtocol {
    /// Keyboard protocol
    Keyboard = 0x01,
    /// Mouse protocol
    Mouse = 0x02,
}

/// HID class-specific requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidRequest {
    /// Set protocol
    SetProtocol = 0x0B,
}

/// HID protocol modes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HidProtocolMode {
    /// Boot protocol (fixed report layout)
    Boot = 0x00,
    /// Report protocol (layout from the report descriptor)
    Report = 0x01,
}
