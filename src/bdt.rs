//! Buffer descriptors (BD)
//!
//! A buffer descriptor is two words of plain memory that software and the
//! transfer engine pass back and forth. Word zero carries the status byte
//! and the byte count; word one points at the packet buffer. The engine
//! walks descriptors on its own, so all accesses are volatile, and the
//! ownership bit decides who may touch the rest.
//!
//! The layout is fixed by hardware. Each endpoint owns four descriptors,
//! an even / odd bank per direction, gathered into an [`EndpointEntry`].

#![allow(non_snake_case, non_upper_case_globals)]

use crate::vcell::VCell;
use ral_registers as ral;
use usb_device::UsbDirection;

/// Token PID for an OUT data transaction, as written back in `TOK_PID`.
pub const TOK_PID_OUT: u32 = 0x1;
/// Token PID for an IN data transaction, as written back in `TOK_PID`.
pub const TOK_PID_IN: u32 = 0x9;
/// Token PID for a SETUP transaction, as written back in `TOK_PID`.
pub const TOK_PID_SETUP: u32 = 0xD;

/// One buffer descriptor: status word, then buffer address
#[repr(C)]
pub struct BufferDescriptor {
    pub CTRL: VCell,
    pub ADDR: VCell,
}

pub mod CTRL {
    /// The whole status byte
    ///
    /// Software writes ownership, data toggle, and the stall and toggle
    /// sync controls here. The engine writes back the token PID of the
    /// completed transaction.
    pub mod STAT {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Buffer stall: the engine answers tokens for this bank with STALL
    pub mod BSTALL {
        pub const offset: u32 = 2;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Data toggle synchronization: reject packets with the wrong toggle
    pub mod DTS {
        pub const offset: u32 = 3;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// No increment: the engine doesn't advance the buffer address
    pub mod NINC {
        pub const offset: u32 = 4;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Keep: the engine retains ownership after the transaction
    pub mod KEEP {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Token PID write-back; overlays `BSTALL` through `KEEP`
    pub mod TOK_PID {
        pub const offset: u32 = 2;
        pub const mask: u32 = 0xF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Expected (software write) or received (engine write-back) data toggle
    pub mod DATA01 {
        pub const offset: u32 = 6;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Ownership: set means the engine owns this descriptor
    pub mod UOWN {
        pub const offset: u32 = 7;
        pub const mask: u32 = 1 << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
    /// Byte count: bytes to transfer, or bytes actually transferred
    pub mod BC {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x3FF << offset;
        pub mod R {}
        pub mod W {}
        pub mod RW {}
    }
}

impl BufferDescriptor {
    pub const fn new() -> Self {
        BufferDescriptor {
            CTRL: VCell::new(0),
            ADDR: VCell::new(0),
        }
    }

    /// Returns `true` when the transfer engine owns this descriptor
    ///
    /// While the engine owns a descriptor, software must not touch any
    /// other descriptor field.
    pub fn owned_by_hardware(&self) -> bool {
        ral::read_reg!(crate::bdt, self, CTRL, UOWN) != 0
    }

    /// Returns `true` if this bank is set up to answer tokens with STALL
    pub fn is_stalled(&self) -> bool {
        ral::read_reg!(crate::bdt, self, CTRL, BSTALL) != 0
    }

    /// Token PID the engine wrote back for the completed transaction
    ///
    /// Only meaningful after the engine released the descriptor to us.
    pub fn token_pid(&self) -> u32 {
        ral::read_reg!(crate::bdt, self, CTRL, TOK_PID)
    }

    /// Data toggle the engine observed on the completed transaction
    pub fn data01(&self) -> bool {
        ral::read_reg!(crate::bdt, self, CTRL, DATA01) != 0
    }

    /// Bytes actually moved by a completed transaction, or the packet
    /// size limit staged by `set_buffer`
    pub fn byte_count(&self) -> usize {
        ral::read_reg!(crate::bdt, self, CTRL, BC) as usize
    }

    /// Stage the packet buffer address and transaction size
    ///
    /// Call before [`hand_to_hardware`](Self::hand_to_hardware); the
    /// engine ignores both fields until it owns the descriptor.
    pub fn set_buffer(&self, address: u32, len: usize) {
        ral::write_reg!(crate::bdt, self, ADDR, address);
        ral::modify_reg!(crate::bdt, self, CTRL, BC: len as u32);
    }

    /// Give the descriptor to the transfer engine
    ///
    /// Rewrites the whole status byte in one volatile store, so ownership,
    /// toggle checking, and the expected data toggle change together and
    /// stale PID write-backs are wiped. The byte count is preserved.
    pub fn hand_to_hardware(&self, data1: bool) {
        let stat = CTRL::UOWN::mask | CTRL::DTS::mask | ((data1 as u32) << CTRL::DATA01::offset);
        ral::modify_reg!(crate::bdt, self, CTRL, STAT: stat);
    }

    /// Hand the descriptor to the engine configured to STALL every token
    ///
    /// Clears the byte count; the engine never touches the buffer while
    /// answering with STALL.
    pub fn stall(&self) {
        ral::write_reg!(crate::bdt, self, CTRL, UOWN: 1, BSTALL: 1);
    }

    /// Reclaim the descriptor for software, resetting its status word
    pub fn release(&self) {
        ral::write_reg!(crate::bdt, self, CTRL, 0);
    }
}

/// The four buffer descriptors of one bidirectional endpoint
///
/// Even bank first, then odd, receive before transmit. This ordering is
/// how the transfer engine indexes the descriptor table.
#[repr(C)]
pub struct EndpointEntry {
    pub rx: [BufferDescriptor; 2],
    pub tx: [BufferDescriptor; 2],
}

impl EndpointEntry {
    pub const fn new() -> Self {
        EndpointEntry {
            rx: [BufferDescriptor::new(), BufferDescriptor::new()],
            tx: [BufferDescriptor::new(), BufferDescriptor::new()],
        }
    }

    /// The even / odd descriptor pair serving `direction`
    pub fn pair(&self, direction: UsbDirection) -> &[BufferDescriptor; 2] {
        match direction {
            UsbDirection::Out => &self.rx,
            UsbDirection::In => &self.tx,
        }
    }

    /// One descriptor, selected by direction and bank
    pub fn descriptor(&self, direction: UsbDirection, odd: bool) -> &BufferDescriptor {
        &self.pair(direction)[odd as usize]
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<BufferDescriptor>() == 8) as usize];
const _: [(); 1] = [(); (core::mem::size_of::<EndpointEntry>() == 32) as usize];
