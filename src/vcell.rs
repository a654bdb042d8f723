//! Volatile cell with the register API the RAL macros expect
//!
//! Buffer descriptor words are plain memory that the transfer engine
//! reads and writes behind our back, so every access is volatile.

use core::cell::UnsafeCell;

/// One 32-bit buffer descriptor word
#[repr(transparent)]
pub struct VCell(UnsafeCell<u32>);

impl VCell {
    pub const fn new(val: u32) -> Self {
        VCell(UnsafeCell::new(val))
    }
    pub fn read(&self) -> u32 {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: u32) {
        unsafe { self.0.get().write_volatile(val) }
    }
}
