//! HID (Human Interface Device) support
//!
//! Boot-protocol keyboards and mice are the device classes the controller
//! binds drivers for. Reports arrive on the device's interrupt IN endpoint
//! and are handed to the registered observer from inside
//! `Controller::process_event`.
//!
//! # Boot Protocol
//!
//! - Fixed report format (8 bytes for keyboard, 3-4 bytes for mouse)
//! - No report descriptor parsing needed
//! - Selected with SET_PROTOCOL(boot) before the endpoint is configured
//!
//! # Reference
//!
//! - USB HID Specification 1.11: <https://www.usb.org/document-library/device-class-definition-hid-111>
//! - HID Usage Tables 1.12: <https://usb.org/document-library/hid-usage-tables-15>

pub mod constants;
pub mod driver;
pub mod keyboard;
pub mod mouse;

pub use constants::*;
pub use driver::{ClassDriver, KeyboardObserver, MouseObserver, Observers};
pub use keyboard::{KeyCode, KeyEvent, KeyModifiers, KeyboardReport};
pub use mouse::{MouseButtons, MouseReport};
