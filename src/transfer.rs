//! USB transfer primitives
//!
//! Transfer types, directions, and the control-request setup packet that the
//! driver places into Setup Stage TRBs as immediate data.

/// USB transfer types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    /// Decode bits 1:0 of an endpoint descriptor's `bmAttributes`
    pub const fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[allow(missing_docs)]
pub enum Direction {
    In,
    Out,
}

/// Standard request codes used during configuration
#[allow(missing_docs)]
pub mod request {
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_CONFIGURATION: u8 = 0x09;
}

/// Standard descriptor type codes
#[allow(missing_docs)]
pub mod descriptor_type {
    pub const DEVICE: u8 = 0x01;
    pub const CONFIGURATION: u8 = 0x02;
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
}

/// USB Setup packet for control transfers
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SetupPacket {
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
}

impl SetupPacket {
    /// Create GET_DESCRIPTOR request
    pub fn get_descriptor(desc_type: u8, desc_index: u8, language_id: u16, length: u16) -> Self {
        Self {
            request_type: 0x80, // Device-to-host, standard, device
            request: request::GET_DESCRIPTOR,
            value: ((desc_type as u16) << 8) | (desc_index as u16),
            index: language_id,
            length,
        }
    }

    /// Create SET_CONFIGURATION request
    pub fn set_configuration(configuration: u8) -> Self {
        Self {
            request_type: 0x00, // Host-to-device, standard, device
            request: request::SET_CONFIGURATION,
            value: configuration as u16,
            index: 0,
            length: 0,
        }
    }

    /// Create a host-to-device class request addressed to an interface
    pub fn class_interface_out(request: u8, value: u16, interface: u8) -> Self {
        Self {
            request_type: 0x21, // Host-to-device, class, interface
            request,
            value,
            index: interface as u16,
            length: 0,
        }
    }

    /// Check if this is an IN transfer
    pub fn is_in(&self) -> bool {
        (self.request_type & 0x80) != 0
    }

    /// Data stage direction, if the request has a data stage
    pub fn data_direction(&self) -> Option<Direction> {
        match (self.length, self.is_in()) {
            (0, _) => None,
            (_, true) => Some(Direction::In),
            (_, false) => Some(Direction::Out),
        }
    }

    /// Little-endian packing used as Setup Stage immediate data
    pub fn to_u64(&self) -> u64 {
        (self.request_type as u64)
            | ((self.request as u64) << 8)
            | ((self.value as u64) << 16)
            | ((self.index as u64) << 32)
            | ((self.length as u64) << 48)
    }
}
