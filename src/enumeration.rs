//! USB device enumeration
//!
//! Standard descriptor parsing and class selection for the descriptor
//! negotiation phase of port configuration. The controller fetches the
//! device and configuration descriptors over EP0; this module decides what
//! the device is and which endpoint the class driver will poll.

use crate::error::{Result, XhciError};
use crate::hid::constants::{HidProtocol, HidSubclass, HID_CLASS};
use crate::transfer::{descriptor_type, TransferType};

/// USB device class codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceClass {
    /// Class defined per interface
    PerInterface = 0x00,
    /// Audio device
    Audio = 0x01,
    /// Communications device
    Cdc = 0x02,
    /// Human interface device
    Hid = 0x03,
    /// Mass storage device
    MassStorage = 0x08,
    /// Hub
    Hub = 0x09,
    /// Vendor specific
    VendorSpecific = 0xFF,
}

impl DeviceClass {
    /// Create from u8 value
    pub fn from_u8(value: u8) -> Self {
        match value {
            0x00 => Self::PerInterface,
            0x01 => Self::Audio,
            0x02 => Self::Cdc,
            0x03 => Self::Hid,
            0x08 => Self::MassStorage,
            0x09 => Self::Hub,
            _ => Self::VendorSpecific, // Default to vendor specific for unknown
        }
    }
}

/// USB device descriptor (18 bytes)
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct DeviceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_sub_class: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub b_num_configurations: u8,
}

impl DeviceDescriptor {
    /// Descriptor length on the wire
    pub const LENGTH: usize = 18;

    /// Parse from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH {
            return Err(XhciError::InvalidDescriptor);
        }

        // Validate descriptor type
        if data[1] != descriptor_type::DEVICE {
            return Err(XhciError::InvalidDescriptor);
        }

        // SAFETY: length checked, packed struct has alignment 1
        Ok(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }

    /// Get device class
    pub fn device_class(&self) -> DeviceClass {
        DeviceClass::from_u8(self.b_device_class)
    }

    /// EP0 max packet size in bytes
    ///
    /// USB 3 devices report an exponent (bcdUSB >= 3.0).
    pub fn max_packet_size0(&self) -> u16 {
        let bcd_usb = self.bcd_usb;
        if bcd_usb >= 0x0300 {
            1u16 << self.b_max_packet_size0.min(15)
        } else {
            self.b_max_packet_size0 as u16
        }
    }
}

/// Configuration descriptor header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct ConfigurationDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

impl ConfigurationDescriptor {
    /// Header length on the wire
    pub const LENGTH: usize = 9;

    /// Parse the header from raw bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LENGTH || data[1] != descriptor_type::CONFIGURATION {
            return Err(XhciError::InvalidDescriptor);
        }
        // SAFETY: length checked, packed struct has alignment 1
        Ok(unsafe { core::ptr::read_unaligned(data.as_ptr() as *const Self) })
    }
}

/// Interface descriptor
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct InterfaceDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

impl InterfaceDescriptor {
    /// Boot-protocol HID function of this interface, if any
    pub fn boot_protocol(&self) -> Option<HidProtocol> {
        if self.b_interface_class != HID_CLASS
            || self.b_interface_sub_class != HidSubclass::Boot as u8
        {
            return None;
        }
        match self.b_interface_protocol {
            p if p == HidProtocol::Keyboard as u8 => Some(HidProtocol::Keyboard),
            p if p == HidProtocol::Mouse as u8 => Some(HidProtocol::Mouse),
            _ => None,
        }
    }
}

/// Endpoint descriptor
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
#[allow(missing_docs)]
pub struct EndpointDescriptor {
    pub b_length: u8,
    pub b_descriptor_type: u8,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

impl EndpointDescriptor {
    /// Whether this is an IN endpoint
    pub fn is_in(&self) -> bool {
        self.b_endpoint_address & 0x80 != 0
    }

    /// Transfer type from bmAttributes
    pub fn transfer_type(&self) -> TransferType {
        TransferType::from_attributes(self.bm_attributes)
    }

    /// Max packet size without the additional-transactions bits
    pub fn max_packet_size(&self) -> u16 {
        let size = self.w_max_packet_size;
        size & 0x07FF
    }
}

/// One descriptor inside a configuration descriptor set
#[derive(Debug, Clone, Copy)]
pub enum Descriptor {
    /// Interface descriptor
    Interface(InterfaceDescriptor),
    /// Endpoint descriptor
    Endpoint(EndpointDescriptor),
    /// Anything else (HID, class-specific, companion)
    Other(u8),
}

/// Walks the descriptors following a configuration header
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> DescriptorIter<'a> {
    /// Iterate over `data`, which starts with the configuration header
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<Descriptor>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + 2 > self.data.len() {
            return None;
        }
        let rest = &self.data[self.offset..];
        let length = rest[0] as usize;
        if length < 2 || length > rest.len() {
            // Stop after reporting a malformed entry
            self.offset = self.data.len();
            return Some(Err(XhciError::InvalidDescriptor));
        }
        self.offset += length;

        let descriptor = match rest[1] {
            descriptor_type::INTERFACE if length >= 9 => {
                // SAFETY: length checked, packed struct has alignment 1
                Descriptor::Interface(unsafe {
                    core::ptr::read_unaligned(rest.as_ptr() as *const InterfaceDescriptor)
                })
            }
            descriptor_type::ENDPOINT if length >= 7 => {
                // SAFETY: length checked, packed struct has alignment 1
                Descriptor::Endpoint(unsafe {
                    core::ptr::read_unaligned(rest.as_ptr() as *const EndpointDescriptor)
                })
            }
            other => Descriptor::Other(other),
        };
        Some(Ok(descriptor))
    }
}

/// HID boot interface selected for a class driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInterface {
    /// bInterfaceNumber
    pub interface_number: u8,
    /// Keyboard or mouse
    pub protocol: HidProtocol,
    /// Interrupt IN endpoint address
    pub endpoint_address: u8,
    /// Endpoint max packet size
    pub max_packet_size: u16,
    /// Endpoint bInterval
    pub interval: u8,
}

/// Result of walking a configuration descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigurationSummary {
    /// bConfigurationValue to pass to SET_CONFIGURATION
    pub configuration_value: u8,
    /// First usable HID boot interface
    pub boot_interface: Option<BootInterface>,
}

/// Parse a full configuration descriptor set
///
/// Picks the first interface that is a HID boot keyboard or mouse and owns
/// an interrupt IN endpoint. Data past `wTotalLength` is ignored.
pub fn parse_configuration(data: &[u8]) -> Result<ConfigurationSummary> {
    let header = ConfigurationDescriptor::from_bytes(data)?;
    let total = (header.w_total_length as usize).min(data.len());
    if total < ConfigurationDescriptor::LENGTH {
        return Err(XhciError::InvalidDescriptor);
    }

    let mut current: Option<(InterfaceDescriptor, HidProtocol)> = None;
    let mut boot_interface = None;

    for descriptor in DescriptorIter::new(&data[..total]).skip(1) {
        match descriptor? {
            Descriptor::Interface(interface) => {
                current = interface.boot_protocol().map(|p| (interface, p));
            }
            Descriptor::Endpoint(endpoint) => {
                let Some((interface, protocol)) = current else {
                    continue;
                };
                if endpoint.is_in() && endpoint.transfer_type() == TransferType::Interrupt {
                    boot_interface = Some(BootInterface {
                        interface_number: interface.b_interface_number,
                        protocol,
                        endpoint_address: endpoint.b_endpoint_address,
                        max_packet_size: endpoint.max_packet_size(),
                        interval: endpoint.b_interval,
                    });
                    break;
                }
            }
            Descriptor::Other(_) => {}
        }
    }

    Ok(ConfigurationSummary {
        configuration_value: header.b_configuration_value,
        boot_interface,
    })
}
