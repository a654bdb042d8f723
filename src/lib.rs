//! A USB 2.0 full-speed device stack for BDT-based controllers
//!
//! `khci-usbd` drives the KHCI controller family found in Kinetis and
//! PIC32 parts, where software and hardware trade transaction buffers
//! through a shared buffer descriptor table (BDT) and the controller
//! interrupts once per completed transaction. The crate owns
//! everything from the transaction engine up through the chapter 9
//! standard requests; you bring the register access and the function
//! logic.
//!
//! The layers, bottom up:
//!
//! - [`UsbPort`] is the hardware seam: a narrow trait over the
//!   controller's registers. Implement it once per chip.
//! - [`Bus`] is the transaction engine. It owns the BDT, splits
//!   transfers into packets, and turns controller conditions into
//!   [`UsbEvent`]s.
//! - [`Device`] consumes those events. It enumerates against a static
//!   [`EndpointConfig`] table and [`Descriptors`] storage, and routes
//!   everything else to your [`FunctionDriver`]s.
//!
//! BDT and SETUP memory comes from a `static` [`UsbMemory`], claimed
//! once at startup. [`Shared`] parks the built device where the USB
//! interrupt handler can reach it.
//!
//! Control request vocabulary (request kinds, recipients, directions)
//! comes from the [`usb_device`] crate, re-exported here.
//!
//! [`usb_device`]: https://crates.io/crates/usb-device

#![no_std]

#[macro_use]
mod log;

mod bdt;
mod bus;
mod config;
mod device;
mod ep0;
mod function;
mod memory;
mod pipe;
mod port;
mod setup;
mod shared;
mod vcell;

pub use crate::bus::{Bus, Events, Transfers};
pub use crate::config::{
    EndpointConfig, EndpointFlags, EP0_FLAGS, EP0_MAX_PACKET_SIZE, MAX_INTERFACES,
};
pub use crate::device::{Descriptors, Device, DeviceFlags};
pub use crate::ep0::Ep0State;
pub use crate::function::{Function, FunctionDriver, UsbEvent, MAX_FUNCTIONS};
pub use crate::memory::{UsbBuffers, UsbMemory, MAX_ENDPOINTS};
pub use crate::pipe::{Transfer, TransferFlags};
pub use crate::port::{BusStatus, EpControl, ErrorStatus, TokenStatus, UsbPort};
pub use crate::setup::{feature, SetupPacket};
pub use crate::shared::Shared;

pub use usb_device;
pub use usb_device::{UsbDirection, UsbError};
