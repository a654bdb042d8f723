//! Pipes: software bookkeeping for endpoint transfers
//!
//! A pipe tracks one direction of one endpoint. The buffer descriptors
//! in the BDT only know about single transactions; the pipe remembers
//! the whole transfer so the engine can split it into packets, count
//! what actually moved, and decide when a terminating zero-length
//! packet is owed.

use usb_device::UsbDirection;

bitflags::bitflags! {
    /// Transfer request flags, and the completion summary echoed back
    ///
    /// The low nibble carries the endpoint number. On completions, the
    /// `TOGGLE` bit holds the data toggle observed on the final packet.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TransferFlags: u8 {
        /// Endpoint number of the transfer
        const ENDPOINT_MASK = 0x0F;
        /// Terminate with a zero-length packet if the transfer divides
        /// evenly into max packets
        const ZERO_TERMINATE = 0x10;
        /// Data toggle to force when `FORCE_TOGGLE` is set
        const TOGGLE = 0x20;
        /// Override the pipe's running data toggle with `TOGGLE`
        const FORCE_TOGGLE = 0x40;
        /// Device-to-host (IN) transfer; clear for host-to-device (OUT)
        const TRANSMIT = 0x80;

        /// Receive armed for a SETUP packet: force DATA0
        const SETUP = Self::FORCE_TOGGLE.bits();
        /// Zero-length IN status handshake: force DATA1
        const STATUS_IN =
            Self::TRANSMIT.bits() | Self::TOGGLE.bits() | Self::FORCE_TOGGLE.bits();
        /// Zero-length OUT status handshake: force DATA1
        const STATUS_OUT = Self::TOGGLE.bits() | Self::FORCE_TOGGLE.bits();
    }
}

impl TransferFlags {
    /// Flags addressing endpoint `ep`, nothing else set
    pub fn for_endpoint(ep: usize) -> Self {
        Self::from_bits_retain((ep & 0x0F) as u8)
    }

    /// Endpoint number carried in the low nibble
    pub fn endpoint(self) -> usize {
        (self.bits() & Self::ENDPOINT_MASK.bits()) as usize
    }

    /// Transfer direction, from the `TRANSMIT` bit
    pub fn direction(self) -> UsbDirection {
        UsbDirection::from(self.bits())
    }
}

/// A completed transfer, reported once per scheduled transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transfer {
    /// Endpoint, direction, and the data toggle of the final packet
    pub flags: TransferFlags,
    /// Token PID written back for the final packet
    pub pid: u8,
    /// Bytes actually transferred, which may be short of the request
    pub size: usize,
}

/// One direction of one endpoint
///
/// `buffer` doubles as the busy flag: a null buffer means the pipe is
/// idle. Zero-length transfers keep it null, which is fine, since they
/// finish within the same descriptor hand-off they started with.
pub(crate) struct Pipe {
    pub(crate) buffer: *mut u8,
    pub(crate) max_packet_size: usize,
    pub(crate) size: usize,
    pub(crate) remaining: usize,
    pub(crate) count: usize,
    pub(crate) odd: bool,
    pub(crate) data1: bool,
    pub(crate) zero_terminate: bool,
    pub(crate) zlp_pending: bool,
}

// Safety: the pipe stores the transfer buffer pointer, but never shares
// it. The caller keeps the buffer alive and untouched until the
// completion for this pipe is reported.
unsafe impl Send for Pipe {}

impl Pipe {
    pub(crate) const fn new() -> Self {
        Pipe {
            buffer: core::ptr::null_mut(),
            max_packet_size: 0,
            size: 0,
            remaining: 0,
            count: 0,
            odd: false,
            data1: false,
            zero_terminate: false,
            zlp_pending: false,
        }
    }

    /// A transfer holds the pipe from schedule to completion
    pub(crate) fn is_busy(&self) -> bool {
        !self.buffer.is_null()
    }

    /// The endpoint was configured for this direction
    pub(crate) fn is_configured(&self) -> bool {
        self.max_packet_size != 0
    }

    /// Size of the next transaction
    pub(crate) fn next_packet_size(&self) -> usize {
        self.remaining.min(self.max_packet_size)
    }

    /// Record a new transfer
    ///
    /// The pipe must be configured and idle. A zero-length packet is
    /// scheduled up front whenever termination is requested and the
    /// transfer divides evenly into max packets, so a full final packet
    /// never reports the transfer complete early.
    pub(crate) fn begin(&mut self, buffer: *mut u8, size: usize, flags: TransferFlags) {
        if flags.contains(TransferFlags::FORCE_TOGGLE) {
            self.data1 = flags.contains(TransferFlags::TOGGLE);
        }
        self.buffer = buffer;
        self.size = size;
        self.remaining = size;
        self.count = 0;
        self.zero_terminate = flags.contains(TransferFlags::ZERO_TERMINATE);
        self.zlp_pending = self.zero_terminate && size != 0 && size % self.max_packet_size == 0;
    }

    /// Drop the in-flight transfer without reporting it
    pub(crate) fn reset_transfer(&mut self) {
        self.buffer = core::ptr::null_mut();
        self.size = 0;
        self.remaining = 0;
        self.count = 0;
        self.zero_terminate = false;
        self.zlp_pending = false;
    }
}
