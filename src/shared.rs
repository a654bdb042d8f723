//! Interrupt-safe storage for the device
//!
//! [`Device`](crate::Device) is usually built at runtime and then
//! serviced from the USB interrupt. [`Shared`] parks it in a `static`
//! and hands out access inside a critical section, so the interrupt
//! handler and thread-mode code never observe it concurrently.

use core::cell::RefCell;

use cortex_m::interrupt::{self, Mutex};

/// A value shared between thread mode and an interrupt handler
///
/// ```
/// use khci_usbd::Shared;
///
/// static COUNTER: Shared<u32> = Shared::new();
/// ```
pub struct Shared<T>(Mutex<RefCell<Option<T>>>);

impl<T> Shared<T> {
    /// An empty slot, usable as a `static` initializer
    pub const fn new() -> Self {
        Shared(Mutex::new(RefCell::new(None)))
    }

    /// Park a value, returning whatever was parked before
    pub fn put(&self, value: T) -> Option<T> {
        interrupt::free(|cs| self.0.borrow(cs).replace(Some(value)))
    }

    /// Take the value back out
    pub fn take(&self) -> Option<T> {
        interrupt::free(|cs| self.0.borrow(cs).take())
    }

    /// Run `func` on the parked value inside a critical section
    ///
    /// Returns `None` without running `func` if the slot is empty.
    /// Don't call from within another [`with`](Shared::with) on the
    /// same slot; the inner borrow panics.
    pub fn with<R>(&self, func: impl FnOnce(&mut T) -> R) -> Option<R> {
        interrupt::free(|cs| self.0.borrow(cs).borrow_mut().as_mut().map(func))
    }
}

impl<T> Default for Shared<T> {
    fn default() -> Self {
        Self::new()
    }
}
