//! Endpoint configuration tables
//!
//! A device describes itself to the driver as a flat table of
//! [`EndpointConfig`] entries, one per endpoint per configuration (and
//! per alternate setting, if those are enabled). `SET_CONFIGURATION`
//! and `SET_INTERFACE` walk the table to decide which endpoints come
//! up, at what packet size, and which function driver serves them.

use crate::port::EpControl;

bitflags::bitflags! {
    /// Endpoint capabilities
    ///
    /// The high byte lines up bit-for-bit with [`EpControl`], so
    /// enabling an endpoint in hardware is a byte shift away.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EndpointFlags: u16 {
        /// The endpoint generates handshakes
        const HANDSHAKE = 0x0100;
        /// Bring the endpoint up already stalled
        const STALL = 0x0200;
        /// Enable device-to-host (IN) traffic
        const TRANSMIT = 0x0400;
        /// Enable host-to-device (OUT) traffic
        const RECEIVE = 0x0800;
    }
}

impl EndpointFlags {
    /// Control register image for these capabilities
    ///
    /// Endpoint zero must keep accepting SETUP tokens; every other
    /// endpoint refuses them.
    pub(crate) fn ep_control(self, endpoint: usize) -> EpControl {
        let mut control = EpControl::from_bits_truncate((self.bits() >> 8) as u8);
        if endpoint == 0 {
            control.remove(EpControl::CONTROL_DISABLE);
        } else {
            control.insert(EpControl::CONTROL_DISABLE);
        }
        control
    }
}

/// Capabilities of endpoint zero
pub const EP0_FLAGS: EndpointFlags = EndpointFlags::TRANSMIT
    .union(EndpointFlags::RECEIVE)
    .union(EndpointFlags::HANDSHAKE);

/// Max packet size of endpoint zero
pub const EP0_MAX_PACKET_SIZE: u16 = 8;

/// Most interfaces a single configuration can carry
pub const MAX_INTERFACES: usize = 8;

/// One endpoint's place in one configuration
#[derive(Clone, Copy, Debug)]
pub struct EndpointConfig {
    /// Max packet size, applied to each direction the flags enable
    pub max_packet_size: u16,
    /// Capabilities
    pub flags: EndpointFlags,
    /// Configuration value this entry belongs to
    pub configuration: u8,
    /// Endpoint number
    pub endpoint: u8,
    /// Interface carrying the endpoint
    pub interface: u8,
    /// Alternate setting carrying the endpoint
    pub alternate: u8,
    /// Index of the function driver serving the endpoint
    pub function: u8,
}

/// The entry enabling `endpoint` within `configuration`
///
/// Only default-alternate entries count here; alternates are selected
/// later, by `SET_INTERFACE`.
pub(crate) fn find_endpoint(
    table: &[EndpointConfig],
    configuration: u8,
    endpoint: u8,
) -> Option<&EndpointConfig> {
    table.iter().find(|entry| {
        entry.configuration == configuration && entry.endpoint == endpoint && entry.alternate == 0
    })
}

/// Every entry of one alternate setting of one interface
#[cfg(feature = "alt-interfaces")]
pub(crate) fn interface_endpoints<'a>(
    table: &'a [EndpointConfig],
    configuration: u8,
    interface: u8,
    alternate: u8,
) -> impl Iterator<Item = &'a EndpointConfig> {
    table.iter().filter(move |entry| {
        entry.configuration == configuration
            && entry.interface == interface
            && entry.alternate == alternate
    })
}
