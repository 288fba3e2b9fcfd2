//! Class drivers and observer dispatch
//!
//! A configured device is bound to exactly one [`ClassDriver`]. Reports from
//! its interrupt IN endpoint are decoded by the driver and delivered,
//! synchronously, to the observer registered for that device family.

use log::{debug, trace};

use crate::enumeration::BootInterface;

use super::constants::HidProtocol;
use super::keyboard::{KeyEvent, KeyboardReport};
use super::mouse::MouseReport;

/// Mouse observer: relative X and Y displacement
pub type MouseObserver = fn(i8, i8);

/// Keyboard observer: one key transition
pub type KeyboardObserver = fn(KeyEvent);

/// Registered observer per device family
///
/// Registering replaces the previous observer of the same family.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observers {
    mouse: Option<MouseObserver>,
    keyboard: Option<KeyboardObserver>,
}

impl Observers {
    /// No observers registered
    pub const fn new() -> Self {
        Self {
            mouse: None,
            keyboard: None,
        }
    }

    /// Set the mouse observer
    pub fn register_mouse(&mut self, observer: MouseObserver) {
        self.mouse = Some(observer);
    }

    /// Set the keyboard observer
    pub fn register_keyboard(&mut self, observer: KeyboardObserver) {
        self.keyboard = Some(observer);
    }

    fn notify_mouse(&self, x: i8, y: i8) -> bool {
        match self.mouse {
            Some(observer) => {
                observer(x, y);
                true
            }
            None => false,
        }
    }

    fn notify_keyboard(&self, event: KeyEvent) -> bool {
        match self.keyboard {
            Some(observer) => {
                observer(event);
                true
            }
            None => false,
        }
    }
}

/// Driver bound to a configured device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassDriver {
    /// HID boot mouse
    Mouse,
    /// HID boot keyboard, remembering the last report for transitions
    Keyboard {
        /// Previous report
        previous: KeyboardReport,
    },
    /// No supported interface; reports are dropped
    Unsupported,
}

impl ClassDriver {
    /// Select the driver for the interface chosen during negotiation
    pub fn for_interface(interface: Option<&BootInterface>) -> Self {
        match interface.map(|i| i.protocol) {
            Some(HidProtocol::Mouse) => Self::Mouse,
            Some(HidProtocol::Keyboard) => Self::Keyboard {
                previous: KeyboardReport::EMPTY,
            },
            None => Self::Unsupported,
        }
    }

    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mouse => "mouse",
            Self::Keyboard { .. } => "keyboard",
            Self::Unsupported => "unsupported",
        }
    }

    /// Decode one report and notify observers
    ///
    /// Returns the number of observer calls made.
    pub fn on_report(&mut self, data: &[u8], observers: &Observers) -> usize {
        match self {
            Self::Mouse => match MouseReport::parse(data) {
                Some(report) => {
                    trace!("mouse report x={} y={}", report.x, report.y);
                    observers.notify_mouse(report.x, report.y) as usize
                }
                None => {
                    debug!("short mouse report ({} bytes)", data.len());
                    0
                }
            },
            Self::Keyboard { previous } => {
                let Some(report) = KeyboardReport::parse(data) else {
                    debug!("short keyboard report ({} bytes)", data.len());
                    return 0;
                };
                // Phantom state: keep the last good report
                if report.is_rollover() {
                    return 0;
                }
                let mut delivered = 0;
                for event in report.transitions(previous) {
                    if observers.notify_keyboard(event) {
                        delivered += 1;
                    }
                }
                *previous = report;
                delivered
            }
            Self::Unsupported => 0,
        }
    }
}
