//! The device layer: enumeration and event routing
//!
//! [`Device`] consumes the [`Bus`] event batch and turns it into a
//! working USB device. It runs the endpoint zero state machine,
//! answers the chapter 9 standard requests itself, and hands
//! everything else to the [`FunctionDriver`]s named by the endpoint
//! configuration table.
//!
//! Call [`Device::initialize`] once, then [`Device::poll`] from the
//! USB interrupt or a single polling loop. The function driver slice
//! passed to `poll` must keep the same order across calls; the
//! configuration table's `function` field indexes into it.

use usb_device::control::{Recipient, Request, RequestType};
use usb_device::{UsbDirection, UsbError};

use crate::bus::{Bus, Transfers};
use crate::config::{self, EndpointConfig, EP0_FLAGS, EP0_MAX_PACKET_SIZE};
use crate::ep0::{self, Ep0Action, Ep0State};
use crate::function::{Function, UsbEvent, MAX_FUNCTIONS};
use crate::memory::{UsbBuffers, MAX_ENDPOINTS};
use crate::pipe::{Transfer, TransferFlags};
use crate::port::{ErrorStatus, UsbPort};
use crate::setup::{feature, SetupPacket};

bitflags::bitflags! {
    /// Device-level status
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct DeviceFlags: u8 {
        /// Reported to the host in `GET_STATUS`
        const SELF_POWERED = 0x01;
        /// The host granted remote wakeup
        const REMOTE_WAKEUP = 0x02;
        /// The bus is suspended
        const SUSPENDED = 0x04;
        /// Bus power survived the attach debounce
        const ATTACHED = 0x08;
    }
}

/// Descriptor storage for `GET_DESCRIPTOR`
///
/// The stack treats descriptors as opaque bytes; how they're built is
/// the device's business. Return `None` for anything you don't have
/// and the request stalls.
pub trait Descriptors {
    /// The descriptor for `descriptor_type` and `index`
    ///
    /// `language` carries the request's wIndex: the language ID for
    /// string descriptors, zero otherwise.
    fn descriptor(&self, descriptor_type: u8, index: u8, language: u16) -> Option<&'static [u8]>;
}

/// A USB device over a [`UsbPort`]
///
/// The device owns the bus and the control pipe. Function drivers own
/// their endpoints: completions on a configured endpoint go to the
/// driver the configuration table names, and control requests the
/// device doesn't recognize are offered to every active driver.
pub struct Device<'a, P> {
    bus: Bus<'a, P>,
    table: &'a [EndpointConfig],
    descriptors: &'a dyn Descriptors,
    state: Ep0State,
    configuration: u8,
    address: u8,
    flags: DeviceFlags,
    /// Function index serving each endpoint, per the active configuration
    function_of: [u8; MAX_ENDPOINTS],
    /// Bit per function the active configuration brought up
    active: u32,
    #[cfg(feature = "alt-interfaces")]
    alternates: [u8; config::MAX_INTERFACES],
}

impl<'a, P: UsbPort> Device<'a, P> {
    pub fn new(
        port: P,
        buffers: UsbBuffers<'a>,
        table: &'a [EndpointConfig],
        descriptors: &'a dyn Descriptors,
    ) -> Self {
        Device {
            bus: Bus::new(port, buffers),
            table,
            descriptors,
            state: Ep0State::Uninitialized,
            configuration: 0,
            address: 0,
            flags: DeviceFlags::empty(),
            function_of: [0; MAX_ENDPOINTS],
            active: 0,
            #[cfg(feature = "alt-interfaces")]
            alternates: [0; config::MAX_INTERFACES],
        }
    }

    /// Claim the hardware and arm endpoint zero for the first SETUP
    ///
    /// Call once before the first [`poll`](Device::poll). The device
    /// comes up disconnected; once bus power survives the attach
    /// debounce, the pull-up goes out and enumeration starts.
    pub fn initialize(&mut self) -> Result<(), UsbError> {
        self.restart()
    }

    /// Back to the default state: address zero, no configuration
    fn restart(&mut self) -> Result<(), UsbError> {
        self.bus.initialize();
        self.bus
            .configure_endpoint(0, EP0_MAX_PACKET_SIZE, EP0_FLAGS)?;
        self.bus.arm_setup()?;
        self.state = Ep0State::WaitingSetup;
        self.configuration = 0;
        self.address = 0;
        self.function_of = [0; MAX_ENDPOINTS];
        self.active = 0;
        #[cfg(feature = "alt-interfaces")]
        {
            self.alternates = [0; config::MAX_INTERFACES];
        }
        self.flags &= DeviceFlags::SELF_POWERED | DeviceFlags::ATTACHED;
        Ok(())
    }

    /// Service the bus once and dispatch everything it reports
    ///
    /// Call from exactly one context. A failing event doesn't stop the
    /// rest of the batch; the first error comes back after every event
    /// ran. `InvalidState` means a completion arrived that the control
    /// pipe's state cannot explain; the next SETUP packet recovers it.
    pub fn poll(&mut self, functions: &mut [Function<'_>]) -> Result<(), UsbError> {
        let events = self.bus.poll();
        let mut result = Ok(());
        for event in events {
            let outcome = self.handle_event(functions, event);
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }

    fn handle_event(
        &mut self,
        functions: &mut [Function<'_>],
        event: UsbEvent,
    ) -> Result<(), UsbError> {
        match event {
            UsbEvent::Transfer(transfer) if transfer.flags.endpoint() == 0 => {
                self.ep0_done(functions, transfer)
            }
            UsbEvent::Transfer(transfer) => {
                self.endpoint_done(functions, transfer);
                Ok(())
            }
            UsbEvent::Setup(packet) => self.handle_setup(functions, packet),
            UsbEvent::Reset => self.handle_reset(functions),
            UsbEvent::Attach => {
                // Drivers from a previous session hear this before the
                // map clears. Full bring-up precedes the pull-up so the
                // host's first packets land on an armed control pipe.
                self.broadcast(functions, event);
                self.restart()?;
                self.flags.insert(DeviceFlags::ATTACHED);
                self.bus.connect();
                Ok(())
            }
            UsbEvent::Detach => {
                self.flags.remove(DeviceFlags::ATTACHED);
                self.broadcast(functions, event);
                Ok(())
            }
            UsbEvent::Suspend => {
                self.flags.insert(DeviceFlags::SUSPENDED);
                self.broadcast(functions, event);
                Ok(())
            }
            UsbEvent::Resume => {
                self.flags.remove(DeviceFlags::SUSPENDED);
                self.broadcast(functions, event);
                Ok(())
            }
            UsbEvent::Stall => self.handle_stall(functions),
            UsbEvent::BusError(_) => {
                self.broadcast(functions, event);
                Ok(())
            }
            #[cfg(feature = "sof-events")]
            UsbEvent::Sof => {
                self.broadcast(functions, event);
                Ok(())
            }
            // Produced by this layer, never by the engine.
            UsbEvent::EnableRemoteWakeup | UsbEvent::DisableRemoteWakeup => Ok(()),
        }
    }

    /// A transfer finished on endpoint zero
    fn ep0_done(
        &mut self,
        functions: &mut [Function<'_>],
        transfer: Transfer,
    ) -> Result<(), UsbError> {
        let (state, action) = match transfer.flags.direction() {
            UsbDirection::Out => ep0::out_done(self.state)?,
            UsbDirection::In => ep0::in_done(self.state)?,
        };
        self.state = state;
        match action {
            Ep0Action::Ignore => Ok(()),
            Ep0Action::RearmSetup => self.bus.arm_setup(),
            Ep0Action::UnstallRearmSetup => {
                self.bus.unstall_endpoint(0, UsbDirection::In)?;
                self.bus.arm_setup()
            }
            Ep0Action::FlushTxRearmSetup => {
                self.bus.flush(0, UsbDirection::In)?;
                self.bus.arm_setup()
            }
            Ep0Action::CommitAddress(address) => {
                self.bus.set_address(address);
                self.address = address;
                debug!("ADDRESS {}", address);
                self.bus.arm_setup()
            }
            Ep0Action::Forward => {
                if self.claimed(functions, UsbEvent::Transfer(transfer)) {
                    self.state = Ep0State::WaitingSetup;
                    self.bus.arm_setup()?;
                }
                Ok(())
            }
        }
    }

    /// A transfer finished on a function endpoint
    fn endpoint_done(&mut self, functions: &mut [Function<'_>], transfer: Transfer) {
        let endpoint = transfer.flags.endpoint();
        let index = self.function_of[endpoint] as usize;
        if self.active & (1 << index) == 0 {
            warn!("EP{} DONE WITHOUT OWNER", endpoint);
            return;
        }
        if let Some(function) = functions.get_mut(index) {
            function
                .driver
                .handle_event(&mut self.bus, UsbEvent::Transfer(transfer));
        }
    }

    /// Endpoint zero stored a SETUP packet
    ///
    /// A SETUP packet preempts whatever exchange was in flight: any
    /// half-sent data stage is flushed, and a protocol stall ends
    /// here.
    fn handle_setup(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        if self.state == Ep0State::Stalled {
            let _ = self.bus.unstall_endpoint(0, UsbDirection::In);
            let _ = self.bus.unstall_endpoint(0, UsbDirection::Out);
        }
        self.bus.flush(0, UsbDirection::In)?;
        self.state = Ep0State::WaitingSetup;

        match packet.kind() {
            RequestType::Standard => self.standard_request(functions, packet),
            _ => self.function_request(functions, packet),
        }
    }

    fn standard_request(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        match packet.request {
            Request::GET_STATUS => self.get_status(functions, packet),
            Request::CLEAR_FEATURE | Request::SET_FEATURE => {
                self.feature_request(functions, packet)
            }
            Request::SET_ADDRESS => {
                // The address loads after the status stage; the status
                // itself still goes out from the old address.
                self.start_status_in(Ep0State::WaitingAddress((packet.value & 0x7F) as u8))
            }
            Request::GET_DESCRIPTOR => self.get_descriptor(packet),
            Request::GET_CONFIGURATION => self.send_reply(&[self.configuration]),
            Request::SET_CONFIGURATION => self.set_configuration(functions, packet),
            Request::GET_INTERFACE => self.get_interface(packet),
            Request::SET_INTERFACE => self.set_interface(packet),
            // Frame numbering for isochronous resynchronization is a
            // function matter.
            Request::SYNCH_FRAME => self.function_request(functions, packet),
            _ => {
                warn!("EP0 REQUEST {} UNSUPPORTED", packet.request);
                self.protocol_stall()
            }
        }
    }

    fn get_status(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        match packet.recipient() {
            Recipient::Device => {
                let mut status = 0;
                if self.flags.contains(DeviceFlags::SELF_POWERED) {
                    status |= 0x01;
                }
                if self.flags.contains(DeviceFlags::REMOTE_WAKEUP) {
                    status |= 0x02;
                }
                self.send_reply(&[status, 0])
            }
            Recipient::Interface => self.send_reply(&[0, 0]),
            Recipient::Endpoint => {
                match self
                    .bus
                    .is_stalled(packet.endpoint(), packet.endpoint_direction())
                {
                    Ok(halted) => self.send_reply(&[halted as u8, 0]),
                    Err(_) => self.protocol_stall(),
                }
            }
            Recipient::Other => self.function_request(functions, packet),
            Recipient::Reserved => self.protocol_stall(),
        }
    }

    fn feature_request(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        let set = packet.request == Request::SET_FEATURE;
        match (packet.recipient(), packet.value) {
            (Recipient::Endpoint, feature::ENDPOINT_HALT) => {
                let endpoint = packet.endpoint();
                let direction = packet.endpoint_direction();
                if set && endpoint == 0 {
                    // The control pipe itself can't be halted.
                    return self.protocol_stall();
                }
                let result = if set {
                    self.bus.stall_endpoint(endpoint, direction)
                } else if endpoint == 0 {
                    // Reclaim whatever endpoint zero had armed before
                    // handing the descriptors back.
                    self.bus
                        .flush(endpoint, direction)
                        .and_then(|()| self.bus.unstall_endpoint(endpoint, direction))
                } else {
                    self.bus.unstall_endpoint(endpoint, direction)
                };
                match result {
                    Ok(()) => self.start_status_in(Ep0State::WaitingStatusIn),
                    Err(_) => self.protocol_stall(),
                }
            }
            (Recipient::Device, feature::REMOTE_WAKEUP) => {
                if set {
                    self.flags.insert(DeviceFlags::REMOTE_WAKEUP);
                    self.broadcast(functions, UsbEvent::EnableRemoteWakeup);
                } else {
                    self.flags.remove(DeviceFlags::REMOTE_WAKEUP);
                    self.broadcast(functions, UsbEvent::DisableRemoteWakeup);
                }
                self.start_status_in(Ep0State::WaitingStatusIn)
            }
            _ => self.protocol_stall(),
        }
    }

    fn get_descriptor(&mut self, packet: SetupPacket) -> Result<(), UsbError> {
        let (descriptor_type, index) = packet.descriptor_type_index();
        let bytes = match self
            .descriptors
            .descriptor(descriptor_type, index, packet.index)
        {
            Some(bytes) => bytes,
            None => {
                warn!("NO DESCRIPTOR {}/{}", descriptor_type, index);
                return self.protocol_stall();
            }
        };

        let size = bytes.len().min(packet.length as usize);
        let mut flags = TransferFlags::for_endpoint(0)
            | TransferFlags::TRANSMIT
            | TransferFlags::FORCE_TOGGLE
            | TransferFlags::TOGGLE;
        if size < packet.length as usize {
            // Short answers that divide evenly into max packets end
            // with a zero-length packet.
            flags |= TransferFlags::ZERO_TERMINATE;
        }

        // Safety: descriptor storage is 'static, and IN transfers only
        // read the buffer.
        unsafe {
            self.bus.transfer(flags, bytes.as_ptr() as *mut u8, size)?;
        }
        // The host may cut the data stage short, so the status OUT is
        // armed before any data moves.
        self.bus.arm_status_out()?;
        self.state = Ep0State::SendingData;
        Ok(())
    }

    fn set_configuration(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        let configuration = (packet.value & 0xFF) as u8;
        // Recorded before any endpoint work: GET_CONFIGURATION reports
        // what the host picked even when the request then stalls.
        self.configuration = configuration;
        debug!("SET_CONFIGURATION {}", configuration);

        if configuration == 0 {
            // Back to the address state. Endpoints stay as they were;
            // the next configuration rewrites them.
            return self.start_status_in(Ep0State::WaitingStatusIn);
        }

        let mut map = 0u32;
        let mut matched = false;
        for endpoint in 1..self.bus.endpoints() {
            let entry = match config::find_endpoint(self.table, configuration, endpoint as u8) {
                Some(entry) => entry,
                None => continue,
            };
            matched = true;
            if entry.function as usize >= MAX_FUNCTIONS {
                return self.protocol_stall();
            }
            self.bus
                .configure_endpoint(endpoint, entry.max_packet_size, entry.flags)?;
            self.function_of[endpoint] = entry.function;
            map |= 1 << entry.function;
        }
        if !matched {
            warn!("CONFIGURATION {} NOT IN TABLE", configuration);
            return self.protocol_stall();
        }

        #[cfg(feature = "alt-interfaces")]
        {
            self.alternates = [0; config::MAX_INTERFACES];
        }

        for index in 0..MAX_FUNCTIONS {
            if map & (1 << index) == 0 {
                continue;
            }
            let function = match functions.get_mut(index) {
                Some(function) => function,
                None => {
                    warn!("FUNCTION {} MISSING", index);
                    return self.protocol_stall();
                }
            };
            if !function.driver.initialize(&mut self.bus, function.flags) {
                warn!("FUNCTION {} REFUSED CONFIGURATION", index);
                return self.protocol_stall();
            }
        }

        self.active = map;
        debug!("CONFIGURED");
        self.start_status_in(Ep0State::WaitingStatusIn)
    }

    #[cfg(feature = "alt-interfaces")]
    fn get_interface(&mut self, packet: SetupPacket) -> Result<(), UsbError> {
        let interface = (packet.index & 0xFF) as usize;
        if self.configuration == 0 || interface >= config::MAX_INTERFACES {
            return self.protocol_stall();
        }
        self.send_reply(&[self.alternates[interface]])
    }

    #[cfg(not(feature = "alt-interfaces"))]
    fn get_interface(&mut self, _packet: SetupPacket) -> Result<(), UsbError> {
        if self.configuration == 0 {
            return self.protocol_stall();
        }
        // Every interface runs its default setting.
        self.send_reply(&[0])
    }

    #[cfg(feature = "alt-interfaces")]
    fn set_interface(&mut self, packet: SetupPacket) -> Result<(), UsbError> {
        let interface = (packet.index & 0xFF) as u8;
        let alternate = (packet.value & 0xFF) as u8;
        if self.configuration == 0 || interface as usize >= config::MAX_INTERFACES {
            return self.protocol_stall();
        }
        let table = self.table;
        if config::interface_endpoints(table, self.configuration, interface, alternate)
            .next()
            .is_none()
        {
            warn!("NO ALTERNATE {} FOR INTERFACE {}", alternate, interface);
            return self.protocol_stall();
        }

        // The outgoing setting's endpoints go down before the incoming
        // one claims them.
        let outgoing = self.alternates[interface as usize];
        if outgoing != alternate {
            for entry in config::interface_endpoints(table, self.configuration, interface, outgoing)
            {
                self.bus.disable_endpoint(entry.endpoint as usize)?;
            }
        }
        for entry in config::interface_endpoints(table, self.configuration, interface, alternate) {
            if entry.function as usize >= MAX_FUNCTIONS {
                return self.protocol_stall();
            }
            self.bus
                .configure_endpoint(entry.endpoint as usize, entry.max_packet_size, entry.flags)?;
            self.function_of[entry.endpoint as usize] = entry.function;
        }
        self.alternates[interface as usize] = alternate;
        debug!("INTERFACE {} ALTERNATE {}", interface, alternate);
        self.start_status_in(Ep0State::WaitingStatusIn)
    }

    #[cfg(not(feature = "alt-interfaces"))]
    fn set_interface(&mut self, packet: SetupPacket) -> Result<(), UsbError> {
        // Only the default setting of a known interface is selectable.
        let interface = (packet.index & 0xFF) as u8;
        let known = self.table.iter().any(|entry| {
            entry.configuration == self.configuration && entry.interface == interface
        });
        if self.configuration == 0 || packet.value != 0 || !known {
            return self.protocol_stall();
        }
        self.start_status_in(Ep0State::WaitingStatusIn)
    }

    /// Offer a request the device doesn't handle to the functions
    ///
    /// An unclaimed request parks the control pipe with the functions:
    /// one of them started a longer exchange and re-arms it by
    /// claiming a later completion.
    fn function_request(
        &mut self,
        functions: &mut [Function<'_>],
        packet: SetupPacket,
    ) -> Result<(), UsbError> {
        if self.claimed(functions, UsbEvent::Setup(packet)) {
            self.state = Ep0State::WaitingSetup;
            self.bus.arm_setup()
        } else {
            self.state = Ep0State::WaitingFunction;
            Ok(())
        }
    }

    /// Answer a control read out of the SETUP buffer
    ///
    /// Short fixed-size replies are staged in the SETUP buffer itself;
    /// the request is already parsed out of it, and the next SETUP
    /// overwrites it regardless.
    fn send_reply(&mut self, reply: &[u8]) -> Result<(), UsbError> {
        let buffer = self.bus.setup.get().cast::<u8>();
        // Safety: the buffer is the claimed SETUP cell. The engine
        // only writes it for packets endpoint zero is armed to
        // receive, and the receive side is idle until the arm below.
        unsafe {
            core::ptr::copy_nonoverlapping(reply.as_ptr(), buffer, reply.len());
            self.bus.transfer(
                TransferFlags::for_endpoint(0)
                    | TransferFlags::TRANSMIT
                    | TransferFlags::FORCE_TOGGLE
                    | TransferFlags::TOGGLE,
                buffer,
                reply.len(),
            )?;
        }
        self.bus.arm_status_out()?;
        self.state = Ep0State::WaitingStatusOut;
        Ok(())
    }

    /// Start the zero-length status IN that ends a control write
    fn start_status_in(&mut self, next: Ep0State) -> Result<(), UsbError> {
        // Safety: zero-length transfers never touch the buffer.
        unsafe {
            self.bus
                .transfer(TransferFlags::STATUS_IN, core::ptr::null_mut(), 0)?;
        }
        self.state = next;
        Ok(())
    }

    /// Answer the current request with STALL
    ///
    /// The transmit side stalls; the receive side re-arms so the next
    /// SETUP, which ends the condition, has a descriptor waiting.
    fn protocol_stall(&mut self) -> Result<(), UsbError> {
        self.bus.stall_endpoint(0, UsbDirection::In)?;
        self.bus.arm_setup()?;
        self.state = Ep0State::Stalled;
        Ok(())
    }

    /// The engine answered some token with STALL
    fn handle_stall(&mut self, functions: &mut [Function<'_>]) -> Result<(), UsbError> {
        if self.state == Ep0State::Stalled {
            // The protocol stall did its job. The next SETUP is
            // already armed; only the transmit side needs reclaiming.
            self.bus.unstall_endpoint(0, UsbDirection::In)
        } else {
            self.broadcast(functions, UsbEvent::Stall);
            Ok(())
        }
    }

    fn handle_reset(&mut self, functions: &mut [Function<'_>]) -> Result<(), UsbError> {
        debug!("RESET");
        // Active drivers hear the reset before the map clears.
        self.broadcast(functions, UsbEvent::Reset);
        self.restart()
    }

    /// Offer an event to every active function, in slice order
    ///
    /// True if any driver reported it handled.
    fn claimed(&mut self, functions: &mut [Function<'_>], event: UsbEvent) -> bool {
        let mut handled = false;
        for (index, function) in functions.iter_mut().enumerate().take(MAX_FUNCTIONS) {
            if self.active & (1 << index) != 0 {
                handled |= function.driver.handle_event(&mut self.bus, event);
            }
        }
        handled
    }

    fn broadcast(&mut self, functions: &mut [Function<'_>], event: UsbEvent) {
        let _ = self.claimed(functions, event);
    }

    /// Signal remote wakeup upstream
    ///
    /// Errors with `InvalidState` unless the bus is suspended and the
    /// host granted remote wakeup.
    pub fn remote_wakeup(&mut self) -> Result<(), UsbError> {
        if !self
            .flags
            .contains(DeviceFlags::REMOTE_WAKEUP | DeviceFlags::SUSPENDED)
        {
            return Err(UsbError::InvalidState);
        }
        self.bus.signal_resume();
        self.flags.remove(DeviceFlags::SUSPENDED);
        Ok(())
    }

    /// Report self-powered in `GET_STATUS`
    pub fn set_self_powered(&mut self, self_powered: bool) {
        self.flags.set(DeviceFlags::SELF_POWERED, self_powered);
    }

    /// Transaction errors accumulated since the last call
    ///
    /// Reading clears the word. The same faults already arrived as
    /// [`UsbEvent::BusError`]s; this is the poll-it-later view.
    pub fn take_error(&mut self) -> ErrorStatus {
        self.bus.take_error()
    }

    /// The transfer surface, for scheduling outside an event callback
    pub fn transfers(&mut self) -> &mut dyn Transfers {
        &mut self.bus
    }

    /// The configuration value the host last selected
    pub fn configuration(&self) -> u8 {
        self.configuration
    }

    /// The assigned bus address
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Phase of the control pipe
    pub fn ep0_state(&self) -> Ep0State {
        self.state
    }

    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }
}
