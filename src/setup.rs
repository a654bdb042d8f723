//! SETUP packets
//!
//! Eight bytes, fixed little-endian layout, stored by the engine at the
//! start of every control transfer. [`SetupPacket`] keeps the raw
//! fields and answers the classification questions chapter 9 cares
//! about. Request numbers come from `usb_device::control::Request`, so
//! device code shares one vocabulary with the wider stack.

use usb_device::control::{Recipient, RequestType};
use usb_device::UsbDirection;

/// Feature selectors for `SET_FEATURE` / `CLEAR_FEATURE`
pub mod feature {
    pub const ENDPOINT_HALT: u16 = 0;
    pub const REMOTE_WAKEUP: u16 = 1;
    pub const TEST_MODE: u16 = 2;
}

/// A decoded SETUP packet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SetupPacket {
    /// bmRequestType: direction, type, and recipient
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength: bytes in the data stage
    pub length: u16,
}

impl SetupPacket {
    /// Size of a SETUP packet on the wire
    pub const LENGTH: usize = 8;

    /// Decode the wire layout
    pub fn from_bytes(bytes: &[u8; Self::LENGTH]) -> Self {
        SetupPacket {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    /// Direction of the data stage
    pub fn direction(&self) -> UsbDirection {
        UsbDirection::from(self.request_type)
    }

    /// Standard, class, or vendor request?
    pub fn kind(&self) -> RequestType {
        match (self.request_type >> 5) & 0x03 {
            0 => RequestType::Standard,
            1 => RequestType::Class,
            2 => RequestType::Vendor,
            _ => RequestType::Reserved,
        }
    }

    /// Who the request addresses
    pub fn recipient(&self) -> Recipient {
        match self.request_type & 0x1F {
            0 => Recipient::Device,
            1 => Recipient::Interface,
            2 => Recipient::Endpoint,
            3 => Recipient::Other,
            _ => Recipient::Reserved,
        }
    }

    /// Descriptor type and index, from `wValue`
    pub fn descriptor_type_index(&self) -> (u8, u8) {
        ((self.value >> 8) as u8, self.value as u8)
    }

    /// Endpoint number, for endpoint-recipient requests
    pub fn endpoint(&self) -> usize {
        (self.index & 0x0F) as usize
    }

    /// Endpoint direction, for endpoint-recipient requests
    pub fn endpoint_direction(&self) -> UsbDirection {
        UsbDirection::from(self.index as u8)
    }
}
