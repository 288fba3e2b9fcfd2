#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

//! USB host driver core for xHCI controllers
//!
//! Brings up an xHCI host controller, walks each root port from attach to a
//! configured device, and delivers HID boot-protocol keyboard and mouse
//! input to registered observers. Polled, single-threaded, no allocation.
//!
//! # Getting Started
//!
//! 1. Give the controller its register window through a [`RegisterBus`]
//!    ([`MmioBus`] on real hardware) and a `'static` [`ControllerMemory`]
//! 2. [`Controller::initialize`], then [`Controller::run`]
//! 3. Register observers, call [`Controller::configure_ports`] when ports
//!    change, and drain events with [`Controller::process_event`]
//!
//! ```ignore
//! static mut MEMORY: ControllerMemory = ControllerMemory::new();
//!
//! let bus = unsafe { MmioBus::new(bar0) };
//! let memory = unsafe { &mut *core::ptr::addr_of_mut!(MEMORY) };
//! let mut xhc = Controller::new(bus, delay, memory);
//! xhc.initialize()?;
//! xhc.run()?;
//! xhc.register_mouse_observer(|dx, dy| log::info!("mouse {} {}", dx, dy));
//! xhc.configure_ports();
//! ```
//!
//! # Core Components
//!
//! - [`xhci`] - controller, rings, contexts, root ports
//! - [`dma`] - statically allocated controller memory
//! - [`enumeration`] - descriptor parsing
//! - [`hid`] - boot keyboard and mouse class drivers
//! - [`transfer`] - setup packets and transfer types
//! - [`error`] - error type with stable cause codes

#[cfg(feature = "defmt")]
use defmt as _;

pub mod dma;
pub mod enumeration;
pub mod error;
pub mod hid;
pub mod transfer;
pub mod xhci;

pub use dma::ControllerMemory;
pub use error::{Result, XhciError};
pub use hid::{KeyEvent, KeyboardObserver, MouseObserver};
pub use transfer::{Direction, SetupPacket, TransferType};
pub use xhci::{
    Controller, ControllerBuilder, ControllerConfig, ControllerState, EventRing, MmioBus, Port,
    PortState, RegisterBus,
};
