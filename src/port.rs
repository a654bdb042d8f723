//! The port trait: what the driver needs from your USB controller
//!
//! The transfer engine and bus dispatcher are portable across
//! controllers that speak the shared descriptor table protocol. The
//! registers around that protocol are not. [`UsbPort`] is the seam:
//! a platform support crate implements it against the real registers,
//! and everything in this crate drives the port.

use usb_device::UsbDirection;

bitflags::bitflags! {
    /// Bus-level status, one bit per pending condition
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct BusStatus: u8 {
        /// Host is driving reset signaling
        const RESET = 0x01;
        /// A transaction error was recorded; details in the error status
        const ERROR = 0x02;
        /// Start-of-frame token observed
        const SOF = 0x04;
        /// The engine finished a transaction and released a descriptor
        const TOKEN_DONE = 0x08;
        /// No bus activity for 3ms
        const IDLE = 0x10;
        /// Resume signaling while suspended
        const RESUME = 0x20;
        /// Controller attach state change
        const ATTACH = 0x40;
        /// The engine answered a token with STALL
        const STALL = 0x80;
    }
}

bitflags::bitflags! {
    /// Transaction errors, hardware-reported and software-detected
    ///
    /// The low byte mirrors the controller's error status register.
    /// The upper bits are faults this crate detects itself; they fold
    /// into the same sticky error word.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct ErrorStatus: u32 {
        /// Token PID check failed
        const PID_CHECK = 0x01;
        /// Token CRC5 rejected
        const CRC5 = 0x02;
        /// Data CRC16 rejected
        const CRC16 = 0x04;
        /// Data field was not an integral number of bytes
        const FRAME_SIZE = 0x08;
        /// Bus turnaround timeout
        const BUS_TURNAROUND = 0x10;
        /// The engine could not keep up with bus memory traffic
        const DMA = 0x20;
        /// Bit stuff error
        const BIT_STUFF = 0x80;
        /// A token completed on a descriptor software still owns
        const TOKEN_MISMATCH = 1 << 8;
        /// A token completed on an endpoint with no configured pipe
        const NO_PIPE = 1 << 9;
        /// The engine refused the next packet of an in-flight transfer
        const START_FAILED = 1 << 10;

        /// Every bit a port can report from hardware
        const HARDWARE = 0xBF;
    }
}

bitflags::bitflags! {
    /// Per-endpoint control bits
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct EpControl: u8 {
        /// Generate handshakes; clear only for isochronous traffic
        const HANDSHAKE = 0x01;
        /// Hardware stall latch for this endpoint
        const STALL = 0x02;
        /// Enable IN transactions
        const TX_ENABLE = 0x04;
        /// Enable OUT transactions
        const RX_ENABLE = 0x08;
        /// Refuse SETUP tokens on this endpoint
        const CONTROL_DISABLE = 0x10;
    }
}

/// Identity of the transaction behind a `TOKEN_DONE`
///
/// Points at the descriptor the engine just released.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TokenStatus {
    /// Endpoint number
    pub endpoint: usize,
    /// Token direction
    pub direction: UsbDirection,
    /// Which descriptor bank served the transaction
    pub odd: bool,
}

impl TokenStatus {
    /// Decode the conventional status register layout
    ///
    /// Endpoint number in the high nibble, direction in bit 3, odd bank
    /// in bit 2.
    pub fn from_raw(status: u8) -> Self {
        TokenStatus {
            endpoint: (status >> 4) as usize,
            direction: if status & (1 << 3) != 0 {
                UsbDirection::In
            } else {
                UsbDirection::Out
            },
            odd: status & (1 << 2) != 0,
        }
    }
}

impl Default for TokenStatus {
    fn default() -> Self {
        TokenStatus {
            endpoint: 0,
            direction: UsbDirection::Out,
            odd: false,
        }
    }
}

/// A USB controller that serves the shared descriptor table protocol
///
/// Implement this in your platform support crate against the real
/// registers. The driver calls every method from its polling context;
/// implementations don't need interior mutability or locking of their
/// own.
///
/// # Safety
///
/// The implementation touches USB controller hardware, and the driver
/// trusts it on three points:
///
/// - at most one `UsbPort` instance drives a given controller, and
///   nothing else touches that controller's registers while it does;
/// - [`enable`](Self::enable) points the controller at the descriptor
///   table address it is given, so the engine and this crate read and
///   write the same memory;
/// - [`physical_address`](Self::physical_address) returns an address
///   the engine can reach for any buffer the driver stages in a
///   descriptor.
///
/// Get one of these wrong and the engine will transfer through dangling
/// or aliased memory.
///
/// # Example
///
/// ```
/// use khci_usbd::{BusStatus, EpControl, ErrorStatus, TokenStatus, UsbPort};
///
/// # struct Registers;
/// struct Port {
///     registers: Registers,
/// }
///
/// unsafe impl UsbPort for Port {
///     fn enable(&mut self, bdt: u32) { /* power up, write the table address */ }
///     fn connect(&mut self) { /* enable the pull-up */ }
///     fn disconnect(&mut self) { /* disable the pull-up */ }
///     fn bus_status(&self) -> BusStatus { BusStatus::empty() }
///     fn clear_bus_status(&mut self, status: BusStatus) {}
///     fn error_status(&self) -> ErrorStatus { ErrorStatus::empty() }
///     fn clear_error_status(&mut self, status: ErrorStatus) {}
///     fn token_status(&self) -> TokenStatus { TokenStatus::default() }
///     fn resume_token_processing(&mut self) {}
///     fn set_address(&mut self, address: u8) {}
///     fn endpoint_control(&self, endpoint: usize) -> EpControl { EpControl::empty() }
///     fn set_endpoint_control(&mut self, endpoint: usize, control: EpControl) {}
///     fn session_valid(&self) -> bool { false }
///     fn take_tick(&mut self) -> bool { false }
///     fn set_resume_signaling(&mut self, enabled: bool) {}
///     fn suspend(&mut self) {}
///     fn unsuspend(&mut self) {}
///     fn physical_address(&self, buffer: *const u8) -> u32 {
///         buffer as u32
///     }
/// }
/// ```
pub unsafe trait UsbPort {
    /// Bring the controller out of reset and point it at the
    /// descriptor table
    ///
    /// `bdt` is the physical address of the table; it is 512-byte
    /// aligned.
    fn enable(&mut self, bdt: u32);

    /// Present the device to the host
    fn connect(&mut self);

    /// Drop off the bus
    fn disconnect(&mut self);

    /// Pending bus conditions
    fn bus_status(&self) -> BusStatus;

    /// Acknowledge the given bus conditions
    ///
    /// `TOKEN_DONE` acknowledgement also advances the controller's
    /// token status FIFO.
    fn clear_bus_status(&mut self, status: BusStatus);

    /// Hardware-detected transaction errors
    fn error_status(&self) -> ErrorStatus;

    /// Acknowledge the given transaction errors
    fn clear_error_status(&mut self, status: ErrorStatus);

    /// Identity of the transaction behind the current `TOKEN_DONE`
    ///
    /// Only meaningful while `TOKEN_DONE` is pending.
    fn token_status(&self) -> TokenStatus;

    /// Resume token processing after the controller paused it
    ///
    /// The controller stops accepting tokens once it stores a SETUP
    /// packet; the driver calls this when the packet is safe to
    /// overwrite.
    fn resume_token_processing(&mut self);

    /// Load the device address for future token matching
    fn set_address(&mut self, address: u8);

    /// Read one endpoint's control bits
    fn endpoint_control(&self, endpoint: usize) -> EpControl;

    /// Replace one endpoint's control bits
    fn set_endpoint_control(&mut self, endpoint: usize, control: EpControl);

    /// Is bus power present?
    fn session_valid(&self) -> bool;

    /// Take the latched timer tick, if one elapsed
    ///
    /// The driver times attach debounce and resume signaling in ticks;
    /// a tick should be on the order of a millisecond.
    fn take_tick(&mut self) -> bool;

    /// Start or stop driving resume signaling upstream
    fn set_resume_signaling(&mut self, enabled: bool);

    /// Enter low-power state until bus activity
    fn suspend(&mut self);

    /// Leave the low-power state
    fn unsuspend(&mut self);

    /// Address of `buffer` as the transfer engine sees it
    fn physical_address(&self, buffer: *const u8) -> u32;
}
