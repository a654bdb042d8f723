//! Function drivers
//!
//! A function is one logical device behind the shared control pipe: a
//! serial port, a sensor, a vendor protocol. The device layer owns
//! enumeration and the standard requests; everything else routes to
//! function drivers by the configuration table's `function` index.
//!
//! Drivers are trait objects so a device can mix functions of
//! different types in one slice, in a stable order that the
//! configuration table indexes into.

use crate::pipe::Transfer;
use crate::port::ErrorStatus;
use crate::setup::SetupPacket;

/// Most function drivers one device can carry
pub const MAX_FUNCTIONS: usize = 32;

/// Everything the stack reports upward
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbEvent {
    /// A scheduled transfer finished
    Transfer(Transfer),
    /// Endpoint zero stored a SETUP packet
    Setup(SetupPacket),
    /// Start of frame
    #[cfg(feature = "sof-events")]
    Sof,
    /// Host reset signaling was observed
    Reset,
    /// The bus went idle and the port entered suspend
    Suspend,
    /// Bus activity ended the suspend
    Resume,
    /// Bus power appeared and survived debounce
    Attach,
    /// Bus power disappeared
    Detach,
    /// The engine answered a token with STALL
    Stall,
    /// Transaction errors were recorded
    BusError(ErrorStatus),
    /// The host granted remote wakeup
    EnableRemoteWakeup,
    /// The host revoked remote wakeup
    DisableRemoteWakeup,
}

/// One USB function
///
/// Implementations schedule their data through the [`Transfers`]
/// handle they're given and hear about the results here.
///
/// [`Transfers`]: crate::Transfers
pub trait FunctionDriver {
    /// Bring the function up
    ///
    /// Called once per driver the selected configuration uses, after
    /// its endpoints are configured; a driver usually arms its OUT
    /// endpoints here. `flags` comes from the [`Function`] entry.
    /// Return `false` to veto the configuration; the host then sees
    /// the request stall.
    fn initialize(&mut self, bus: &mut dyn crate::Transfers, flags: u8) -> bool;

    /// Handle an event routed to this function
    ///
    /// The return value matters for control exchanges. For a `Setup`
    /// event, `true` means the request is fully handled and the
    /// control pipe may re-arm for the next SETUP; `false` means the
    /// function started a longer exchange and wants the follow-up
    /// endpoint zero completions. Report `true` from the completion
    /// that finishes the exchange.
    fn handle_event(&mut self, bus: &mut dyn crate::Transfers, event: UsbEvent) -> bool;
}

/// A driver and the startup flags passed to [`FunctionDriver::initialize`]
pub struct Function<'a> {
    pub driver: &'a mut dyn FunctionDriver,
    pub flags: u8,
}
