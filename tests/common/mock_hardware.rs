//! Device profiles for the software controller
//!
//! Descriptor sets for the devices the mock controller can attach to a root
//! port.

/// Speed IDs as reported in PORTSC
pub mod speed {
    pub const FULL: u8 = 1;
    pub const LOW: u8 = 2;
    pub const HIGH: u8 = 3;
    pub const SUPER: u8 = 4;
}

/// Device attached to a mock root port
#[derive(Debug, Clone)]
pub struct MockDevice {
    /// PORTSC speed ID
    pub speed: u8,
    /// Answer to GET_DESCRIPTOR(device)
    pub device_descriptor: Vec<u8>,
    /// Answer to GET_DESCRIPTOR(configuration)
    pub config_descriptor: Vec<u8>,
}

impl MockDevice {
    /// Low-speed HID boot mouse
    pub fn mouse() -> Self {
        Self {
            speed: speed::LOW,
            device_descriptor: device_descriptor(0x0200, 8, 0x046D, 0xC077),
            config_descriptor: hid_config_descriptor(2, 4, 10),
        }
    }

    /// Full-speed HID boot keyboard
    pub fn keyboard() -> Self {
        Self {
            speed: speed::FULL,
            device_descriptor: device_descriptor(0x0110, 8, 0x413C, 0x2107),
            config_descriptor: hid_config_descriptor(1, 8, 10),
        }
    }

    /// High-speed mass storage device; no supported interface
    pub fn storage() -> Self {
        Self {
            speed: speed::HIGH,
            device_descriptor: device_descriptor(0x0200, 64, 0x0781, 0x5567),
            config_descriptor: storage_config_descriptor(),
        }
    }

    /// Device whose device descriptor is truncated
    pub fn truncated() -> Self {
        let mut device = Self::mouse();
        device.device_descriptor.truncate(8);
        device
    }
}

/// Standard device descriptor, class defined at interface level
pub fn device_descriptor(bcd_usb: u16, max_packet_size0: u8, vendor: u16, product: u16) -> Vec<u8> {
    let usb = bcd_usb.to_le_bytes();
    let vid = vendor.to_le_bytes();
    let pid = product.to_le_bytes();
    vec![
        0x12,             // bLength
        0x01,             // bDescriptorType (DEVICE)
        usb[0], usb[1],   // bcdUSB
        0x00,             // bDeviceClass
        0x00,             // bDeviceSubClass
        0x00,             // bDeviceProtocol
        max_packet_size0, // bMaxPacketSize0
        vid[0], vid[1],   // idVendor
        pid[0], pid[1],   // idProduct
        0x00, 0x01,       // bcdDevice (1.0)
        0x01,             // iManufacturer
        0x02,             // iProduct
        0x00,             // iSerialNumber
        0x01,             // bNumConfigurations
    ]
}

/// Configuration with one HID boot interface and its interrupt IN endpoint
pub fn hid_config_descriptor(protocol: u8, max_packet_size: u8, interval: u8) -> Vec<u8> {
    vec![
        // Configuration
        0x09, 0x02, 34, 0x00, // bLength, CONFIGURATION, wTotalLength
        0x01,                 // bNumInterfaces
        0x01,                 // bConfigurationValue
        0x00,                 // iConfiguration
        0xA0,                 // bmAttributes (bus powered, remote wakeup)
        0x32,                 // bMaxPower (100mA)
        // Interface 0: HID boot
        0x09, 0x04, 0x00, 0x00, // bLength, INTERFACE, bInterfaceNumber, bAlternateSetting
        0x01,                   // bNumEndpoints
        0x03, 0x01, protocol,   // HID, boot subclass, keyboard/mouse
        0x00,                   // iInterface
        // HID class descriptor
        0x09, 0x21, 0x11, 0x01, 0x00, 0x01, 0x22, 0x34, 0x00,
        // Endpoint 1 IN, interrupt
        0x07, 0x05, 0x81, 0x03, max_packet_size, 0x00, interval,
    ]
}

/// Bulk-only mass storage configuration
pub fn storage_config_descriptor() -> Vec<u8> {
    vec![
        0x09, 0x02, 32, 0x00, 0x01, 0x01, 0x00, 0x80, 0x32,
        // Interface 0: mass storage, SCSI, bulk-only
        0x09, 0x04, 0x00, 0x00, 0x02, 0x08, 0x06, 0x50, 0x00,
        // Bulk IN / OUT
        0x07, 0x05, 0x81, 0x02, 0x00, 0x02, 0x00,
        0x07, 0x05, 0x02, 0x02, 0x00, 0x02, 0x00,
    ]
}
