//! The endpoint zero state machine
//!
//! Control transfers run in stages, and the stage decides what a
//! completion on endpoint zero means: data, status handshake, or a
//! deferred address commit. The state lives in one tagged enum, and
//! the transitions are pure functions from state to (next state,
//! action). The device layer performs the action; nothing here touches
//! hardware.
//!
//! Combinations the protocol cannot produce return
//! [`UsbError::InvalidState`] instead of wedging the pipe, so a
//! corrupted state is visible at the poll call site.

use usb_device::UsbError;

/// Phase of the control pipe
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ep0State {
    /// No bus yet; nothing may complete here
    Uninitialized,
    /// Armed for the next SETUP packet
    WaitingSetup,
    /// The control pipe answered with STALL; the next SETUP clears it
    Stalled,
    /// Streaming an IN data stage; the status OUT is already armed
    SendingData,
    /// Data stage done; waiting for the host's zero-length status OUT
    WaitingStatusOut,
    /// Waiting for our zero-length status IN to reach the host
    WaitingStatusIn,
    /// `SET_ADDRESS` accepted; the address loads after the status stage
    WaitingAddress(u8),
    /// A function driver owns the rest of the exchange
    WaitingFunction,
}

/// What the device layer does after a transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ep0Action {
    /// Nothing left to do for this completion
    Ignore,
    /// Arm endpoint zero for the next SETUP
    RearmSetup,
    /// Clear the transmit stall, then arm for the next SETUP
    UnstallRearmSetup,
    /// Drop any half-sent data stage, then arm for the next SETUP
    FlushTxRearmSetup,
    /// Load the deferred device address, then arm for the next SETUP
    CommitAddress(u8),
    /// Route the completion to the owning function driver
    Forward,
}

/// An OUT transfer completed on endpoint zero
///
/// An OUT completion in `SendingData` is the host cutting a data stage
/// short with an early status packet; the unsent tail gets flushed.
pub(crate) fn out_done(state: Ep0State) -> Result<(Ep0State, Ep0Action), UsbError> {
    use Ep0State::*;
    match state {
        WaitingSetup => Ok((WaitingSetup, Ep0Action::Forward)),
        Stalled => Ok((WaitingSetup, Ep0Action::UnstallRearmSetup)),
        SendingData | WaitingStatusOut => Ok((WaitingSetup, Ep0Action::FlushTxRearmSetup)),
        WaitingFunction => Ok((WaitingFunction, Ep0Action::Forward)),
        Uninitialized | WaitingStatusIn | WaitingAddress(_) => Err(UsbError::InvalidState),
    }
}

/// An IN transfer completed on endpoint zero
pub(crate) fn in_done(state: Ep0State) -> Result<(Ep0State, Ep0Action), UsbError> {
    use Ep0State::*;
    match state {
        WaitingSetup | WaitingStatusOut => Ok((state, Ep0Action::Ignore)),
        WaitingAddress(address) => Ok((WaitingSetup, Ep0Action::CommitAddress(address))),
        SendingData => Ok((WaitingStatusOut, Ep0Action::Ignore)),
        WaitingStatusIn => Ok((WaitingSetup, Ep0Action::RearmSetup)),
        WaitingFunction => Ok((WaitingFunction, Ep0Action::Forward)),
        Uninitialized | Stalled => Err(UsbError::InvalidState),
    }
}

#[cfg(test)]
mod tests {
    use super::Ep0Action::*;
    use super::Ep0State::*;
    use super::{in_done, out_done};
    use usb_device::UsbError;

    #[test]
    fn control_read_sequence() {
        // GET_DESCRIPTOR: data IN completes, then the status OUT.
        let (state, action) = in_done(SendingData).unwrap();
        assert_eq!(state, WaitingStatusOut);
        assert_eq!(action, Ignore);

        let (state, action) = out_done(state).unwrap();
        assert_eq!(state, WaitingSetup);
        assert_eq!(action, FlushTxRearmSetup);
    }

    #[test]
    fn control_read_aborted_by_early_status() {
        // Host stops caring mid data stage and sends the status OUT.
        let (state, action) = out_done(SendingData).unwrap();
        assert_eq!(state, WaitingSetup);
        assert_eq!(action, FlushTxRearmSetup);
    }

    #[test]
    fn control_write_sequence() {
        let (state, action) = in_done(WaitingStatusIn).unwrap();
        assert_eq!(state, WaitingSetup);
        assert_eq!(action, RearmSetup);
    }

    #[test]
    fn deferred_address_commit() {
        let (state, action) = in_done(WaitingAddress(5)).unwrap();
        assert_eq!(state, WaitingSetup);
        assert_eq!(action, CommitAddress(5));
    }

    #[test]
    fn stalled_pipe_consumes_status_out() {
        // After we stall a request, the host may still run its status
        // stage. That packet lands in the armed SETUP buffer; clear the
        // stall and arm a fresh one.
        let (state, action) = out_done(Stalled).unwrap();
        assert_eq!(state, WaitingSetup);
        assert_eq!(action, UnstallRearmSetup);
    }

    #[test]
    fn function_owns_both_directions() {
        assert_eq!(out_done(WaitingFunction).unwrap(), (WaitingFunction, Forward));
        assert_eq!(in_done(WaitingFunction).unwrap(), (WaitingFunction, Forward));
    }

    #[test]
    fn stale_in_completions_ignored() {
        assert_eq!(in_done(WaitingSetup).unwrap(), (WaitingSetup, Ignore));
        assert_eq!(in_done(WaitingStatusOut).unwrap(), (WaitingStatusOut, Ignore));
    }

    #[test]
    fn impossible_combinations_error() {
        assert_eq!(out_done(Uninitialized), Err(UsbError::InvalidState));
        assert_eq!(out_done(WaitingStatusIn), Err(UsbError::InvalidState));
        assert_eq!(out_done(WaitingAddress(1)), Err(UsbError::InvalidState));
        assert_eq!(in_done(Uninitialized), Err(UsbError::InvalidState));
        assert_eq!(in_done(Stalled), Err(UsbError::InvalidState));
    }
}
