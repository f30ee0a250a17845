//! Raw reader/writer lock cell.
//!
//! [`Lock`] pairs a raw `spin::RwLock<()>` with an [`UnsafeCell`] holding
//! the protected data. Acquire and release are decoupled so a guard type
//! built on top can outlive the borrow a normal guard would impose, and
//! so a frozen layer can hand out access without touching the raw lock
//! at all. All safety obligations sit with the caller, which in this
//! crate is exactly one type: `inode::InodeGuard`.

use core::cell::UnsafeCell;
use core::mem;

use spin::RwLock;

pub struct Lock<T> {
    raw: RwLock<()>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is mediated by `raw` (or by the frozen-layer
// exclusivity contract), so sharing `Lock` across threads is sound
// whenever the data itself may be sent.
unsafe impl<T: Send> Sync for Lock<T> {}

impl<T> Lock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            raw: RwLock::new(()),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquires the raw lock in the requested mode. The acquisition is
    /// recorded only by the lock word itself; pair with [`Lock::release`]
    /// on every exit path.
    pub fn acquire(&self, exclusive: bool) {
        if exclusive {
            mem::forget(self.raw.write());
        } else {
            mem::forget(self.raw.read());
        }
    }

    /// Releases an acquisition made by [`Lock::acquire`].
    ///
    /// # Safety
    ///
    /// The caller must have acquired the lock in the same mode and not
    /// yet released it.
    pub unsafe fn release(&self, exclusive: bool) {
        if exclusive {
            self.raw.force_write_unlock();
        } else {
            self.raw.force_read_decrement();
        }
    }

    /// # Safety
    ///
    /// The caller must hold the lock in some mode, or otherwise
    /// guarantee no writer is active.
    pub unsafe fn get(&self) -> &T {
        &*self.data.get()
    }

    /// # Safety
    ///
    /// The caller must hold the lock exclusively, or otherwise guarantee
    /// no other access is possible.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self) -> &mut T {
        &mut *self.data.get()
    }

}
