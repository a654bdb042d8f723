//! The bus: transfer engine and event dispatcher
//!
//! [`Bus`] owns the descriptor table, the pipe bookkeeping, and the
//! port. It has two halves:
//!
//! - the transfer engine splits transfers into transactions, keeps the
//!   descriptor banks and data toggles in step, and reassembles
//!   completions into whole-transfer events;
//! - the dispatcher, [`poll`](Bus::poll), turns pending controller
//!   status into an ordered batch of [`UsbEvent`]s.
//!
//! A batch is consumed by exactly one caller; see `poll` for the
//! contract.

use core::cell::UnsafeCell;

use usb_device::{UsbDirection, UsbError};

use crate::bdt::{self, EndpointEntry};
use crate::config::EndpointFlags;
use crate::function::UsbEvent;
use crate::memory::UsbBuffers;
use crate::pipe::{Pipe, Transfer, TransferFlags};
use crate::port::{BusStatus, EpControl, ErrorStatus, TokenStatus, UsbPort};
use crate::setup::SetupPacket;

/// Ticks of continuous bus power before we report an attach
const ATTACH_DEBOUNCE_TICKS: u32 = 50;
/// Ticks to hold resume signaling when waking the host
const RESUME_SIGNALING_TICKS: u32 = 2;

/// Status bits the dispatcher services and acknowledges
const SERVICED: BusStatus = BusStatus::RESET
    .union(BusStatus::ERROR)
    .union(BusStatus::TOKEN_DONE)
    .union(BusStatus::IDLE)
    .union(BusStatus::RESUME)
    .union(BusStatus::STALL);

/// Most events one `poll` can produce
const EVENT_CAPACITY: usize = 8;

/// Where we are in the attach debounce
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AttachPhase {
    Detached,
    Debouncing(u32),
    Attached,
}

/// Events from one [`Bus::poll`], in dispatch order
pub struct Events {
    events: [Option<UsbEvent>; EVENT_CAPACITY],
    count: usize,
    next: usize,
}

impl Events {
    const fn new() -> Self {
        Events {
            events: [None; EVENT_CAPACITY],
            count: 0,
            next: 0,
        }
    }

    fn push(&mut self, event: UsbEvent) {
        if self.count < self.events.len() {
            self.events[self.count] = Some(event);
            self.count += 1;
        }
    }
}

impl Iterator for Events {
    type Item = UsbEvent;

    fn next(&mut self) -> Option<UsbEvent> {
        if self.next < self.count {
            let event = self.events[self.next];
            self.next += 1;
            event
        } else {
            None
        }
    }
}

fn pipe_index(direction: UsbDirection) -> usize {
    match direction {
        UsbDirection::Out => 0,
        UsbDirection::In => 1,
    }
}

/// The transfer scheduling surface handed to function drivers
///
/// Object safe, so drivers stay independent of the port type.
pub trait Transfers {
    /// Schedule a transfer
    ///
    /// # Safety
    ///
    /// Same contract as [`Bus::transfer`].
    unsafe fn transfer(
        &mut self,
        flags: TransferFlags,
        buffer: *mut u8,
        size: usize,
    ) -> Result<(), UsbError>;

    /// Abandon the in-flight transfer on one pipe
    fn flush(&mut self, endpoint: usize, direction: UsbDirection) -> Result<(), UsbError>;

    /// Stall one direction of an endpoint
    fn stall_endpoint(&mut self, endpoint: usize, direction: UsbDirection)
        -> Result<(), UsbError>;

    /// Clear a stall and reclaim the descriptors
    fn unstall_endpoint(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
    ) -> Result<(), UsbError>;

    /// Has the engine stalled this pipe?
    fn is_stalled(&self, endpoint: usize, direction: UsbDirection) -> Result<bool, UsbError>;
}

/// USB bus over a [`UsbPort`]
pub struct Bus<'a, P> {
    pub(crate) port: P,
    pub(crate) bdt: &'a [EndpointEntry],
    pub(crate) setup: &'a UnsafeCell<[u8; SetupPacket::LENGTH]>,
    pub(crate) pipes: [[Pipe; 2]; crate::memory::MAX_ENDPOINTS],
    last_error: ErrorStatus,
    attach: AttachPhase,
    resume_ticks: Option<u32>,
}

impl<'a, P: UsbPort> Bus<'a, P> {
    /// Build a bus over claimed memory and a port
    ///
    /// Nothing touches hardware until [`initialize`](Self::initialize).
    pub fn new(port: P, buffers: UsbBuffers<'a>) -> Self {
        const PAIR: [Pipe; 2] = [Pipe::new(), Pipe::new()];
        Bus {
            port,
            bdt: buffers.bdt,
            setup: buffers.setup,
            pipes: [PAIR; crate::memory::MAX_ENDPOINTS],
            last_error: ErrorStatus::empty(),
            attach: AttachPhase::Detached,
            resume_ticks: None,
        }
    }

    /// Endpoints the descriptor table serves
    pub fn endpoints(&self) -> usize {
        self.bdt.len()
    }

    /// Reset the engine: descriptors reclaimed, pipes cleared,
    /// endpoint controls off, address zero
    ///
    /// Called once at startup and again after every bus reset. Attach
    /// tracking and the sticky error word survive.
    pub fn initialize(&mut self) {
        for entry in self.bdt {
            for descriptor in entry.rx.iter().chain(entry.tx.iter()) {
                descriptor.release();
                descriptor.ADDR.write(0);
            }
        }
        for pair in self.pipes.iter_mut() {
            for pipe in pair.iter_mut() {
                *pipe = Pipe::new();
            }
        }

        let table = self.port.physical_address(self.bdt.as_ptr().cast());
        self.port.enable(table);
        for endpoint in 0..self.bdt.len() {
            self.port.set_endpoint_control(endpoint, EpControl::empty());
        }
        self.port.set_address(0);
    }

    /// Present the device to the host
    pub fn connect(&mut self) {
        self.port.connect();
    }

    /// Drop off the bus
    pub fn disconnect(&mut self) {
        self.port.disconnect();
    }

    /// Load the device address
    pub fn set_address(&mut self, address: u8) {
        self.port.set_address(address);
    }

    /// Configure one endpoint
    ///
    /// Each direction the flags enable gets `max_packet_size`; a zero
    /// size clears the enabled directions instead. The endpoint's
    /// control bits are rewritten to match.
    pub fn configure_endpoint(
        &mut self,
        endpoint: usize,
        max_packet_size: u16,
        flags: EndpointFlags,
    ) -> Result<(), UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        if flags.contains(EndpointFlags::RECEIVE) {
            reconfigure(
                &mut self.pipes[endpoint][pipe_index(UsbDirection::Out)],
                max_packet_size,
            );
        }
        if flags.contains(EndpointFlags::TRANSMIT) {
            reconfigure(
                &mut self.pipes[endpoint][pipe_index(UsbDirection::In)],
                max_packet_size,
            );
        }
        self.port
            .set_endpoint_control(endpoint, flags.ep_control(endpoint));
        Ok(())
    }

    /// Disable an endpoint, both directions
    pub fn disable_endpoint(&mut self, endpoint: usize) -> Result<(), UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        self.flush(endpoint, UsbDirection::Out)?;
        self.flush(endpoint, UsbDirection::In)?;
        for pipe in self.pipes[endpoint].iter_mut() {
            *pipe = Pipe::new();
        }
        self.port.set_endpoint_control(endpoint, EpControl::empty());
        Ok(())
    }

    /// Schedule a transfer
    ///
    /// The endpoint, direction, and modifiers all come from `flags`.
    /// The engine moves up to `size` bytes and reports one
    /// [`UsbEvent::Transfer`] when the whole transfer finishes: all
    /// bytes moved, a short packet received, or the terminating
    /// zero-length packet sent. `size` may be zero for handshakes;
    /// `buffer` is ignored then.
    ///
    /// Errors with `WouldBlock` while the pipe is busy and
    /// `InvalidEndpoint` if the endpoint is out of range or not
    /// configured for the direction.
    ///
    /// # Safety
    ///
    /// The engine reads or writes `buffer` by address. It must stay
    /// valid, unmoved, and (for OUT transfers) exclusively writable
    /// from the time of this call until the transfer's completion
    /// event is consumed or the pipe is flushed. IN transfers only
    /// read the buffer.
    pub unsafe fn transfer(
        &mut self,
        flags: TransferFlags,
        buffer: *mut u8,
        size: usize,
    ) -> Result<(), UsbError> {
        let endpoint = flags.endpoint();
        let direction = flags.direction();
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }

        let pipe = &self.pipes[endpoint][pipe_index(direction)];
        if !pipe.is_configured() {
            return Err(UsbError::InvalidEndpoint);
        }
        if pipe.is_busy() {
            return Err(UsbError::WouldBlock);
        }
        // Zero-length transfers leave no buffer behind, so the busy
        // check above can't see them; the descriptor ownership check
        // does.
        if self.bdt[endpoint]
            .descriptor(direction, pipe.odd)
            .owned_by_hardware()
        {
            return Err(UsbError::WouldBlock);
        }

        let pipe = &mut self.pipes[endpoint][pipe_index(direction)];
        let buffer = if size == 0 {
            core::ptr::null_mut()
        } else {
            buffer
        };
        pipe.begin(buffer, size, flags);

        // Keep both descriptor banks working whenever more than one
        // transaction is coming. The terminating zero-length packet
        // counts as one.
        let max = pipe.max_packet_size;
        let two_up_front = size >= max && (pipe.zero_terminate || size != max);
        if two_up_front {
            self.start_packet(endpoint, direction)?;
        }
        self.start_packet(endpoint, direction)?;
        Ok(())
    }

    /// Arm endpoint zero for the next SETUP packet
    pub fn arm_setup(&mut self) -> Result<(), UsbError> {
        // Safety: the SETUP buffer belongs to the claimed memory and
        // outlives the bus. The engine is its only writer, and the
        // dispatcher parses the packet out before anything can re-arm.
        unsafe {
            self.transfer(
                TransferFlags::SETUP,
                self.setup.get().cast(),
                SetupPacket::LENGTH,
            )
        }
    }

    /// Arm endpoint zero for the host's zero-length status OUT
    ///
    /// A genuine status packet carries no data and completes with size
    /// zero. The descriptor still gets the whole SETUP buffer: if the
    /// host abandons the exchange and sends a new SETUP instead, that
    /// packet has somewhere to land.
    pub fn arm_status_out(&mut self) -> Result<(), UsbError> {
        // Safety: same buffer and ownership story as `arm_setup`.
        unsafe {
            self.transfer(
                TransferFlags::STATUS_OUT,
                self.setup.get().cast(),
                SetupPacket::LENGTH,
            )
        }
    }

    /// Abandon the in-flight transfer on one pipe
    ///
    /// Reclaims both descriptor banks without reporting a completion.
    /// When the engine held exactly one bank, the pipe's bank parity
    /// is flipped back in step. Flushing an idle pipe is harmless.
    pub fn flush(&mut self, endpoint: usize, direction: UsbDirection) -> Result<(), UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        let pair = self.bdt[endpoint].pair(direction);
        let even = pair[0].CTRL.read();
        pair[0].release();
        let odd = pair[1].CTRL.read();
        pair[1].release();

        let pipe = &mut self.pipes[endpoint][pipe_index(direction)];
        if (even ^ odd) & bdt::CTRL::UOWN::mask != 0 {
            pipe.odd = !pipe.odd;
        }
        pipe.reset_transfer();
        Ok(())
    }

    /// Stall one direction of an endpoint
    ///
    /// Hands the engine whichever descriptor banks software still
    /// owns, configured to answer every token with STALL. Errors with
    /// `WouldBlock` if the engine owns both banks; flush first.
    pub fn stall_endpoint(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
    ) -> Result<(), UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        let mut stalled = false;
        for descriptor in self.bdt[endpoint].pair(direction) {
            if !descriptor.owned_by_hardware() {
                descriptor.stall();
                stalled = true;
            }
        }
        if stalled {
            Ok(())
        } else {
            Err(UsbError::WouldBlock)
        }
    }

    /// Clear a stall, reclaiming both banks and the hardware latch
    pub fn unstall_endpoint(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
    ) -> Result<(), UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        for descriptor in self.bdt[endpoint].pair(direction) {
            descriptor.release();
        }
        let control = self.port.endpoint_control(endpoint);
        if control.contains(EpControl::STALL) {
            self.port
                .set_endpoint_control(endpoint, control.difference(EpControl::STALL));
        }
        Ok(())
    }

    /// Has the engine stalled this pipe?
    pub fn is_stalled(&self, endpoint: usize, direction: UsbDirection) -> Result<bool, UsbError> {
        if endpoint >= self.bdt.len() {
            return Err(UsbError::InvalidEndpoint);
        }
        Ok(self.bdt[endpoint]
            .pair(direction)
            .iter()
            .any(|descriptor| descriptor.is_stalled()))
    }

    /// Sticky transaction errors accumulated since the last call
    pub fn take_error(&mut self) -> ErrorStatus {
        let error = self.last_error;
        self.last_error = ErrorStatus::empty();
        error
    }

    /// Drive resume signaling upstream to wake the host
    ///
    /// The signaling stops on its own after the standard window.
    pub fn signal_resume(&mut self) {
        self.port.unsuspend();
        self.port.set_resume_signaling(true);
        self.resume_ticks = Some(0);
    }

    /// Service the controller once
    ///
    /// Returns the pending events in dispatch order: timer-driven
    /// attach changes first, then transaction completions, then bus
    /// state changes. Every serviced condition is acknowledged here
    /// and nowhere else.
    ///
    /// Call this from exactly one context, either the USB interrupt or
    /// a single polling loop. The batch borrows nothing, but dropping
    /// it drops the events, so consume it before polling again.
    pub fn poll(&mut self) -> Events {
        let mut events = Events::new();

        if self.port.take_tick() {
            self.tick(&mut events);
        }
        if self.attach == AttachPhase::Attached && !self.port.session_valid() {
            self.port.disconnect();
            self.attach = AttachPhase::Detached;
            events.push(UsbEvent::Detach);
        }

        let mut serviced = SERVICED;
        if cfg!(feature = "sof-events") {
            serviced |= BusStatus::SOF;
        }
        let status = self.port.bus_status().intersection(serviced);
        if status.is_empty() {
            return events;
        }

        #[cfg(feature = "sof-events")]
        if status.contains(BusStatus::SOF) {
            events.push(UsbEvent::Sof);
        }
        if status.contains(BusStatus::TOKEN_DONE) {
            self.service_token(&mut events);
        }
        if status.contains(BusStatus::RESET) {
            events.push(UsbEvent::Reset);
        }
        if status.contains(BusStatus::ERROR) {
            let error = self.port.error_status().intersection(ErrorStatus::HARDWARE);
            self.port.clear_error_status(error);
            warn!("ERROR {:?}", error);
            self.last_error |= error;
            events.push(UsbEvent::BusError(error));
        }
        if status.contains(BusStatus::IDLE) {
            self.port.suspend();
            events.push(UsbEvent::Suspend);
        }
        if status.contains(BusStatus::RESUME) {
            self.port.unsuspend();
            events.push(UsbEvent::Resume);
        }
        if status.contains(BusStatus::STALL) {
            events.push(UsbEvent::Stall);
        }

        // Acknowledge last: clearing TOKEN_DONE advances the
        // controller's token FIFO, so the identity read above must
        // come first.
        self.port.clear_bus_status(status);
        events
    }

    /// One timer tick: attach debounce and the resume signaling window
    fn tick(&mut self, events: &mut Events) {
        match self.attach {
            AttachPhase::Debouncing(ticks) => {
                if !self.port.session_valid() {
                    self.attach = AttachPhase::Detached;
                } else if ticks + 1 >= ATTACH_DEBOUNCE_TICKS {
                    self.attach = AttachPhase::Attached;
                    events.push(UsbEvent::Attach);
                } else {
                    self.attach = AttachPhase::Debouncing(ticks + 1);
                }
            }
            AttachPhase::Detached if self.port.session_valid() => {
                // This tick counts toward the debounce.
                self.attach = AttachPhase::Debouncing(1);
            }
            _ => {}
        }

        if let Some(ticks) = self.resume_ticks {
            if ticks + 1 >= RESUME_SIGNALING_TICKS {
                self.port.set_resume_signaling(false);
                self.resume_ticks = None;
            } else {
                self.resume_ticks = Some(ticks + 1);
            }
        }
    }

    /// Handle one TOKEN_DONE: identify the transaction, account for
    /// it, and keep the transfer moving
    fn service_token(&mut self, events: &mut Events) {
        let TokenStatus {
            endpoint,
            direction,
            odd,
        } = self.port.token_status();
        if endpoint >= self.bdt.len() {
            self.note_error(ErrorStatus::NO_PIPE, events);
            return;
        }

        let descriptor = self.bdt[endpoint].descriptor(direction, odd);
        if descriptor.owned_by_hardware() {
            // The controller says done, but never released the
            // descriptor. Don't touch it.
            self.note_error(ErrorStatus::TOKEN_MISMATCH, events);
            return;
        }
        let pid = descriptor.token_pid();
        let data1 = descriptor.data01();
        let packet_size = descriptor.byte_count();

        if pid == bdt::TOK_PID_SETUP {
            self.pipes[endpoint][pipe_index(direction)].reset_transfer();
            // Safety: the engine pauses token processing when it
            // stores a SETUP packet, so the buffer is stable until the
            // resume call below.
            let packet = unsafe { SetupPacket::from_bytes(&*self.setup.get()) };
            self.port.resume_token_processing();
            debug!("SETUP {:?}", packet);
            events.push(UsbEvent::Setup(packet));
            return;
        }

        if !self.pipes[endpoint][pipe_index(direction)].is_configured() {
            self.note_error(ErrorStatus::NO_PIPE, events);
            return;
        }

        let pipe = &mut self.pipes[endpoint][pipe_index(direction)];
        pipe.count += packet_size;
        let done = pipe.count == pipe.size || packet_size < pipe.max_packet_size;
        if done && pipe.zlp_pending {
            // Data is through, but the terminating zero-length packet
            // is still in flight. Report when it lands.
            pipe.zlp_pending = false;
        } else if done {
            let mut flags = TransferFlags::for_endpoint(endpoint);
            if direction == UsbDirection::In {
                flags |= TransferFlags::TRANSMIT;
            }
            if data1 {
                flags |= TransferFlags::TOGGLE;
            }
            let size = pipe.count;
            pipe.buffer = core::ptr::null_mut();
            events.push(UsbEvent::Transfer(Transfer {
                flags,
                pid: pid as u8,
                size,
            }));
            return;
        }

        let needs_packet = {
            let pipe = &self.pipes[endpoint][pipe_index(direction)];
            pipe.remaining > 0 || pipe.zlp_pending
        };
        if needs_packet && self.start_packet(endpoint, direction).is_err() {
            self.note_error(ErrorStatus::START_FAILED, events);
        }
    }

    /// Arm the next transaction of the in-flight transfer
    fn start_packet(&mut self, endpoint: usize, direction: UsbDirection) -> Result<(), UsbError> {
        let pipe = &self.pipes[endpoint][pipe_index(direction)];
        let descriptor = self.bdt[endpoint].descriptor(direction, pipe.odd);
        if descriptor.owned_by_hardware() {
            return Err(UsbError::WouldBlock);
        }

        let len = pipe.next_packet_size();
        let address = if pipe.buffer.is_null() {
            0
        } else {
            self.port.physical_address(pipe.buffer)
        };
        descriptor.set_buffer(address, len);
        descriptor.hand_to_hardware(pipe.data1);

        let pipe = &mut self.pipes[endpoint][pipe_index(direction)];
        if !pipe.buffer.is_null() {
            pipe.buffer = pipe.buffer.wrapping_add(len);
        }
        pipe.remaining -= len;
        pipe.odd = !pipe.odd;
        pipe.data1 = !pipe.data1;
        Ok(())
    }

    fn note_error(&mut self, error: ErrorStatus, events: &mut Events) {
        error!("TOKEN {:?}", error);
        self.last_error |= error;
        events.push(UsbEvent::BusError(error));
    }
}

fn reconfigure(pipe: &mut Pipe, max_packet_size: u16) {
    if max_packet_size == 0 {
        *pipe = Pipe::new();
    } else {
        pipe.max_packet_size = max_packet_size as usize;
    }
}

impl<P: UsbPort> Transfers for Bus<'_, P> {
    unsafe fn transfer(
        &mut self,
        flags: TransferFlags,
        buffer: *mut u8,
        size: usize,
    ) -> Result<(), UsbError> {
        Bus::transfer(self, flags, buffer, size)
    }

    fn flush(&mut self, endpoint: usize, direction: UsbDirection) -> Result<(), UsbError> {
        Bus::flush(self, endpoint, direction)
    }

    fn stall_endpoint(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
    ) -> Result<(), UsbError> {
        Bus::stall_endpoint(self, endpoint, direction)
    }

    fn unstall_endpoint(
        &mut self,
        endpoint: usize,
        direction: UsbDirection,
    ) -> Result<(), UsbError> {
        Bus::unstall_endpoint(self, endpoint, direction)
    }

    fn is_stalled(&self, endpoint: usize, direction: UsbDirection) -> Result<bool, UsbError> {
        Bus::is_stalled(self, endpoint, direction)
    }
}

#[cfg(test)]
mod tests {
    use super::{Bus, Events};
    use crate::bdt;
    use crate::config::EndpointFlags;
    use crate::function::UsbEvent;
    use crate::memory::UsbMemory;
    use crate::pipe::TransferFlags;
    use crate::port::mock::MockPort;
    use crate::port::{BusStatus, EpControl, ErrorStatus, TokenStatus};
    use usb_device::{UsbDirection, UsbError};

    fn make(memory: &UsbMemory<4>) -> Bus<'_, MockPort> {
        let mut bus = Bus::new(MockPort::new(), memory.take().unwrap());
        bus.initialize();
        bus
    }

    fn configure_bulk(bus: &mut Bus<'_, MockPort>, endpoint: usize, direction: UsbDirection) {
        let flag = match direction {
            UsbDirection::In => EndpointFlags::TRANSMIT,
            UsbDirection::Out => EndpointFlags::RECEIVE,
        };
        bus.configure_endpoint(endpoint, 64, flag | EndpointFlags::HANDSHAKE)
            .unwrap();
    }

    /// Play the engine: release a descriptor with a completion
    /// write-back, then latch TOKEN_DONE for it.
    fn complete(
        bus: &mut Bus<'_, MockPort>,
        endpoint: usize,
        direction: UsbDirection,
        odd: bool,
        size: usize,
        pid: u32,
    ) {
        let descriptor = bus.bdt[endpoint].descriptor(direction, odd);
        assert!(descriptor.owned_by_hardware(), "descriptor was not armed");
        let data1 = descriptor.data01();
        descriptor
            .CTRL
            .write((pid << 2) | ((data1 as u32) << 6) | ((size as u32) << 16));
        bus.port.bus_status |= BusStatus::TOKEN_DONE;
        bus.port.token_status = TokenStatus {
            endpoint,
            direction,
            odd,
        };
    }

    fn transfers(events: Events) -> (usize, usize) {
        let mut count = 0;
        let mut size = 0;
        for event in events {
            if let UsbEvent::Transfer(transfer) = event {
                count += 1;
                size = transfer.size;
            }
        }
        (count, size)
    }

    #[test]
    fn initialize_claims_hardware() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let bus = make(&memory);
        let table = bus.port.enabled_at.unwrap();
        assert_eq!(table % 512, 0);
        assert_eq!(bus.port.address, 0);
        for control in &bus.port.endpoint_control[..4] {
            assert_eq!(*control, EpControl::empty());
        }
        assert_eq!(bus.endpoints(), 4);
    }

    #[test]
    fn transfer_pipelines_both_banks() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        let mut data = [0u8; 128];
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::TRANSMIT;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 128) }.unwrap();

        let pair = bus.bdt[1].pair(UsbDirection::In);
        assert!(pair[0].owned_by_hardware());
        assert!(pair[1].owned_by_hardware());
        assert_eq!(pair[0].byte_count(), 64);
        assert_eq!(pair[1].byte_count(), 64);
        // Toggles alternate across the staged transactions.
        assert_ne!(pair[0].data01(), pair[1].data01());

        // First packet out: no completion yet, nothing left to arm.
        complete(&mut bus, 1, UsbDirection::In, false, 64, bdt::TOK_PID_IN);
        let (count, _) = transfers(bus.poll());
        assert_eq!(count, 0);
        assert!(!bus.bdt[1].pair(UsbDirection::In)[0].owned_by_hardware());

        // Second packet finishes the transfer.
        complete(&mut bus, 1, UsbDirection::In, true, 64, bdt::TOK_PID_IN);
        let (count, size) = transfers(bus.poll());
        assert_eq!(count, 1);
        assert_eq!(size, 128);
    }

    #[test]
    fn zero_terminated_transfer_reports_once() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        let mut data = [0u8; 128];
        let flags = TransferFlags::for_endpoint(1)
            | TransferFlags::TRANSMIT
            | TransferFlags::ZERO_TERMINATE;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 128) }.unwrap();

        // Bank 0 completes; the zero-length terminator takes its place.
        complete(&mut bus, 1, UsbDirection::In, false, 64, bdt::TOK_PID_IN);
        assert_eq!(transfers(bus.poll()).0, 0);
        let zlp = bus.bdt[1].descriptor(UsbDirection::In, false);
        assert!(zlp.owned_by_hardware());
        assert_eq!(zlp.byte_count(), 0);

        // Final data packet: all 128 bytes through, but no report yet.
        complete(&mut bus, 1, UsbDirection::In, true, 64, bdt::TOK_PID_IN);
        assert_eq!(transfers(bus.poll()).0, 0);

        // Terminator lands; exactly one completion for the transfer.
        complete(&mut bus, 1, UsbDirection::In, false, 0, bdt::TOK_PID_IN);
        let (count, size) = transfers(bus.poll());
        assert_eq!(count, 1);
        assert_eq!(size, 128);
    }

    #[test]
    fn exact_max_with_zero_terminate_sends_two_packets() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        let mut data = [0u8; 64];
        let flags = TransferFlags::for_endpoint(1)
            | TransferFlags::TRANSMIT
            | TransferFlags::ZERO_TERMINATE;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 64) }.unwrap();

        let pair = bus.bdt[1].pair(UsbDirection::In);
        assert_eq!(pair[0].byte_count(), 64);
        assert_eq!(pair[1].byte_count(), 0);

        complete(&mut bus, 1, UsbDirection::In, false, 64, bdt::TOK_PID_IN);
        assert_eq!(transfers(bus.poll()).0, 0);
        complete(&mut bus, 1, UsbDirection::In, true, 0, bdt::TOK_PID_IN);
        let (count, size) = transfers(bus.poll());
        assert_eq!(count, 1);
        assert_eq!(size, 64);
    }

    #[test]
    fn short_packet_ends_reception() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 2, UsbDirection::Out);

        let mut data = [0u8; 100];
        let flags = TransferFlags::for_endpoint(2);
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 100) }.unwrap();

        complete(&mut bus, 2, UsbDirection::Out, false, 64, bdt::TOK_PID_OUT);
        assert_eq!(transfers(bus.poll()).0, 0);

        complete(&mut bus, 2, UsbDirection::Out, true, 30, bdt::TOK_PID_OUT);
        let (count, size) = transfers(bus.poll());
        assert_eq!(count, 1);
        assert_eq!(size, 94);
    }

    #[test]
    fn busy_and_invalid_pipes_are_refused() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        let mut data = [0u8; 8];
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::TRANSMIT;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 8) }.unwrap();
        assert_eq!(
            unsafe { bus.transfer(flags, data.as_mut_ptr(), 8) },
            Err(UsbError::WouldBlock)
        );

        // Not configured in this direction.
        let out = TransferFlags::for_endpoint(1);
        assert_eq!(
            unsafe { bus.transfer(out, data.as_mut_ptr(), 8) },
            Err(UsbError::InvalidEndpoint)
        );
        // Beyond the table.
        let beyond = TransferFlags::for_endpoint(9) | TransferFlags::TRANSMIT;
        assert_eq!(
            unsafe { bus.transfer(beyond, data.as_mut_ptr(), 8) },
            Err(UsbError::InvalidEndpoint)
        );
    }

    #[test]
    fn zero_length_transfer_blocks_by_ownership() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        let flags = TransferFlags::for_endpoint(1) | TransferFlags::STATUS_IN;
        unsafe { bus.transfer(flags, core::ptr::null_mut(), 0) }.unwrap();
        // The pipe looks idle, but the armed descriptor doesn't.
        assert_eq!(
            unsafe { bus.transfer(flags, core::ptr::null_mut(), 0) },
            Err(UsbError::WouldBlock)
        );
    }

    #[test]
    fn setup_packet_parsed_and_token_processing_resumed() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.configure_endpoint(0, 8, crate::config::EP0_FLAGS)
            .unwrap();
        bus.arm_setup().unwrap();

        let armed = bus.bdt[0].descriptor(UsbDirection::Out, false);
        assert!(armed.owned_by_hardware());
        assert_eq!(armed.byte_count(), 8);
        assert!(!armed.data01());

        // GET_DESCRIPTOR(DEVICE), wLength 64.
        unsafe {
            *bus.setup.get() = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00];
        }
        complete(&mut bus, 0, UsbDirection::Out, false, 8, bdt::TOK_PID_SETUP);

        let mut saw_setup = false;
        for event in bus.poll() {
            if let UsbEvent::Setup(setup) = event {
                saw_setup = true;
                assert_eq!(setup.request, 0x06);
                assert_eq!(setup.value, 0x0100);
                assert_eq!(setup.length, 64);
            }
        }
        assert!(saw_setup);
        assert_eq!(bus.port.token_resumes, 1);
        // The pipe is free for the next arm immediately.
        bus.arm_setup().unwrap();
    }

    #[test]
    fn flush_reclaims_and_keeps_bank_parity() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        // One bank in flight: parity must flip back on flush.
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::STATUS_IN;
        unsafe { bus.transfer(flags, core::ptr::null_mut(), 0) }.unwrap();
        assert!(bus.pipes[1][1].odd);
        bus.flush(1, UsbDirection::In).unwrap();
        assert!(!bus.pipes[1][1].odd);
        assert!(!bus.bdt[1].pair(UsbDirection::In)[0].owned_by_hardware());

        // Two banks in flight: parity already consistent.
        let mut data = [0u8; 128];
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::TRANSMIT;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 128) }.unwrap();
        assert!(!bus.pipes[1][1].odd);
        bus.flush(1, UsbDirection::In).unwrap();
        assert!(!bus.pipes[1][1].odd);
        assert!(!bus.pipes[1][1].is_busy());

        // Idempotent.
        bus.flush(1, UsbDirection::In).unwrap();
        assert!(!bus.pipes[1][1].odd);

        // Flags don't leak into the next transfer.
        let flags = flags | TransferFlags::ZERO_TERMINATE;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 64) }.unwrap();
        bus.flush(1, UsbDirection::In).unwrap();
        assert!(!bus.pipes[1][1].zlp_pending);
        assert!(!bus.pipes[1][1].zero_terminate);
    }

    #[test]
    fn stall_takes_free_banks_only() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        configure_bulk(&mut bus, 1, UsbDirection::In);

        bus.stall_endpoint(1, UsbDirection::In).unwrap();
        assert!(bus.is_stalled(1, UsbDirection::In).unwrap());
        let pair = bus.bdt[1].pair(UsbDirection::In);
        assert!(pair[0].is_stalled() && pair[1].is_stalled());

        bus.port.endpoint_control[1] |= EpControl::STALL;
        bus.unstall_endpoint(1, UsbDirection::In).unwrap();
        assert!(!bus.is_stalled(1, UsbDirection::In).unwrap());
        assert!(!bus.port.endpoint_control[1].contains(EpControl::STALL));

        // Both banks hardware-owned: nothing left to stall with.
        let mut data = [0u8; 128];
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::TRANSMIT;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 128) }.unwrap();
        assert_eq!(
            bus.stall_endpoint(1, UsbDirection::In),
            Err(UsbError::WouldBlock)
        );
    }

    #[test]
    fn dispatcher_orders_and_acknowledges() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.bus_status =
            BusStatus::RESET | BusStatus::ERROR | BusStatus::IDLE | BusStatus::STALL;
        bus.port.error_status = ErrorStatus::CRC16;

        let mut order = [None; 8];
        let mut n = 0;
        for event in bus.poll() {
            order[n] = Some(event);
            n += 1;
        }
        assert_eq!(order[0], Some(UsbEvent::Reset));
        assert_eq!(order[1], Some(UsbEvent::BusError(ErrorStatus::CRC16)));
        assert_eq!(order[2], Some(UsbEvent::Suspend));
        assert_eq!(order[3], Some(UsbEvent::Stall));
        assert_eq!(n, 4);

        assert!(bus.port.suspended);
        assert!(bus.port.bus_status.is_empty());
        assert!(bus.port.error_status.is_empty());
        assert_eq!(bus.take_error(), ErrorStatus::CRC16);
        assert_eq!(bus.take_error(), ErrorStatus::empty());
    }

    #[test]
    fn resume_status_wakes_port() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.suspended = true;
        bus.port.bus_status = BusStatus::RESUME;
        let mut resumed = false;
        for event in bus.poll() {
            resumed |= event == UsbEvent::Resume;
        }
        assert!(resumed);
        assert!(!bus.port.suspended);
    }

    #[test]
    fn unserviced_status_left_pending() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.bus_status = BusStatus::ATTACH;
        assert_eq!(bus.poll().count(), 0);
        assert_eq!(bus.port.bus_status, BusStatus::ATTACH);
    }

    #[test]
    fn token_faults_surface_as_bus_errors() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);

        // Completion on an endpoint with no configured pipe.
        bus.port.bus_status = BusStatus::TOKEN_DONE;
        bus.port.token_status = TokenStatus {
            endpoint: 2,
            direction: UsbDirection::Out,
            odd: false,
        };
        let mut seen = None;
        for event in bus.poll() {
            if let UsbEvent::BusError(error) = event {
                seen = Some(error);
            }
        }
        assert_eq!(seen, Some(ErrorStatus::NO_PIPE));

        // Completion pointing at a descriptor the engine still owns.
        configure_bulk(&mut bus, 1, UsbDirection::In);
        let mut data = [0u8; 8];
        let flags = TransferFlags::for_endpoint(1) | TransferFlags::TRANSMIT;
        unsafe { bus.transfer(flags, data.as_mut_ptr(), 8) }.unwrap();
        bus.port.bus_status = BusStatus::TOKEN_DONE;
        bus.port.token_status = TokenStatus {
            endpoint: 1,
            direction: UsbDirection::In,
            odd: false,
        };
        let mut seen = None;
        for event in bus.poll() {
            if let UsbEvent::BusError(error) = event {
                seen = Some(error);
            }
        }
        assert_eq!(seen, Some(ErrorStatus::TOKEN_MISMATCH));
        assert_eq!(
            bus.take_error(),
            ErrorStatus::NO_PIPE | ErrorStatus::TOKEN_MISMATCH
        );
    }

    #[test]
    fn attach_debounces_session_power() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.session_valid = true;
        bus.port.ticks = 49;
        for _ in 0..49 {
            assert_eq!(bus.poll().count(), 0);
        }
        // Next tick crosses the debounce threshold.
        bus.port.ticks = 1;
        let mut attached = false;
        for event in bus.poll() {
            attached |= event == UsbEvent::Attach;
        }
        assert!(attached);

        // Power drop reports a detach without waiting for a tick.
        bus.port.session_valid = false;
        let mut detached = false;
        for event in bus.poll() {
            detached |= event == UsbEvent::Detach;
        }
        assert!(detached);
        assert!(!bus.port.connected);
    }

    #[test]
    fn attach_debounce_aborts_when_power_drops() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.session_valid = true;
        bus.port.ticks = 25;
        for _ in 0..25 {
            bus.poll().count();
        }
        bus.port.session_valid = false;
        bus.port.ticks = 1;
        assert_eq!(bus.poll().count(), 0);

        // Power returns: the debounce starts over from zero.
        bus.port.session_valid = true;
        bus.port.ticks = 49;
        for _ in 0..49 {
            assert_eq!(bus.poll().count(), 0);
        }
        bus.port.ticks = 1;
        let mut attached = false;
        for event in bus.poll() {
            attached |= event == UsbEvent::Attach;
        }
        assert!(attached);
    }

    #[test]
    fn resume_signaling_stops_after_window() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.suspended = true;
        bus.signal_resume();
        assert!(bus.port.resume_signaling);
        assert!(!bus.port.suspended);

        bus.port.ticks = 2;
        bus.poll().count();
        assert!(bus.port.resume_signaling);
        bus.poll().count();
        assert!(!bus.port.resume_signaling);
    }

    #[cfg(feature = "sof-events")]
    #[test]
    fn sof_reported_when_enabled() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let mut bus = make(&memory);
        bus.port.bus_status = BusStatus::SOF;
        let mut saw_sof = false;
        for event in bus.poll() {
            saw_sof |= event == UsbEvent::Sof;
        }
        assert!(saw_sof);
        assert!(bus.port.bus_status.is_empty());
    }
}
