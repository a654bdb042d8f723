//! Driver memory: the buffer descriptor table and the SETUP buffer
//!
//! The transfer engine reads descriptors from a 512-byte-aligned table
//! in memory it can reach. [`UsbMemory`] reserves that table, plus the
//! backing buffer for endpoint zero SETUP packets, so the user can
//! place it in a `static` (and, with a linker section attribute, in a
//! specific RAM bank).

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::bdt::EndpointEntry;
use crate::setup::SetupPacket;

/// Endpoints a full descriptor table serves
pub const MAX_ENDPOINTS: usize = 16;

#[repr(C, align(512))]
struct Bdt<const ENDPOINTS: usize>([EndpointEntry; ENDPOINTS]);

/// Backing memory for one USB controller
///
/// Define one as a `static`, then [`take()`](Self::take) it to feed the
/// bus. Shrink the `ENDPOINTS` parameter if your device uses fewer
/// endpoints than the controller supports; the first table entry is
/// always endpoint zero, so `ENDPOINTS` must be at least one.
///
/// ```
/// use khci_usbd::UsbMemory;
///
/// static MEMORY: UsbMemory<4> = UsbMemory::new();
///
/// let buffers = MEMORY.take().unwrap();
/// assert!(MEMORY.take().is_none());
/// ```
pub struct UsbMemory<const ENDPOINTS: usize = MAX_ENDPOINTS> {
    bdt: Bdt<ENDPOINTS>,
    setup: UnsafeCell<[u8; SetupPacket::LENGTH]>,
    taken: AtomicBool,
}

// Safety: the interior is only reachable through `take`, which succeeds
// once. The single `UsbBuffers` claim is the only path to the cells.
unsafe impl<const ENDPOINTS: usize> Sync for UsbMemory<ENDPOINTS> {}

impl<const ENDPOINTS: usize> UsbMemory<ENDPOINTS> {
    pub const fn new() -> Self {
        const ENTRY: EndpointEntry = EndpointEntry::new();
        UsbMemory {
            bdt: Bdt([ENTRY; ENDPOINTS]),
            setup: UnsafeCell::new([0; SetupPacket::LENGTH]),
            taken: AtomicBool::new(false),
        }
    }

    /// Claim the memory
    ///
    /// Returns `None` on every call after the first.
    pub fn take(&self) -> Option<UsbBuffers<'_>> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        if taken {
            None
        } else {
            Some(UsbBuffers {
                bdt: &self.bdt.0,
                setup: &self.setup,
            })
        }
    }
}

/// The exclusive claim on a [`UsbMemory`]
pub struct UsbBuffers<'a> {
    pub(crate) bdt: &'a [EndpointEntry],
    pub(crate) setup: &'a UnsafeCell<[u8; SetupPacket::LENGTH]>,
}

#[cfg(test)]
mod tests {
    use super::UsbMemory;

    #[test]
    fn take_once() {
        let memory: UsbMemory = UsbMemory::new();
        assert!(memory.take().is_some());
        assert!(memory.take().is_none());
        assert!(memory.take().is_none());
    }

    #[test]
    fn table_shape() {
        let memory: UsbMemory<4> = UsbMemory::new();
        let buffers = memory.take().unwrap();
        assert_eq!(buffers.bdt.len(), 4);
        assert_eq!(buffers.bdt.as_ptr() as usize % 512, 0);

        let first = &buffers.bdt[0] as *const _ as usize;
        let second = &buffers.bdt[1] as *const _ as usize;
        assert_eq!(second - first, 32);
    }

    #[test]
    fn default_table_is_full_size() {
        let memory: UsbMemory = UsbMemory::new();
        let buffers = memory.take().unwrap();
        assert_eq!(buffers.bdt.len(), super::MAX_ENDPOINTS);
    }
}
