//! Owning wrapper for kernel object handles.

use windows_sys::Win32::Foundation::{
    CloseHandle, SetHandleInformation, HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE,
};

use super::Win32Error;

/// A kernel object handle that is closed exactly once on drop.
///
/// Handles that cross a process boundary are *moved*: [`OwnedHandle::into_raw`]
/// releases ownership without closing, and the receiving side (the child
/// process) is then responsible for the object's lifetime. Everything else
/// goes through `Drop`.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// HANDLE is a kernel object reference, not a pointer into this process;
// moving it between threads is fine.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// Take ownership of a raw handle.
    ///
    /// # Safety
    ///
    /// `raw` must be a valid handle that no other owner will close.
    #[must_use]
    pub const unsafe fn from_raw(raw: HANDLE) -> Self {
        Self(raw)
    }

    /// The raw handle value, still owned by `self`.
    #[must_use]
    pub const fn raw(&self) -> HANDLE {
        self.0
    }

    /// Release ownership without closing.
    #[must_use]
    pub fn into_raw(self) -> HANDLE {
        let raw = self.0;
        std::mem::forget(self);
        raw
    }

    /// Mark the handle inheritable (or not) by child processes.
    ///
    /// # Errors
    ///
    /// Returns the last-error code if `SetHandleInformation` fails.
    pub fn set_inheritable(&self, inherit: bool) -> Result<(), Win32Error> {
        let flags = if inherit { HANDLE_FLAG_INHERIT } else { 0 };
        // SAFETY: self.0 is a valid handle owned by this wrapper.
        let ok = unsafe { SetHandleInformation(self.0, HANDLE_FLAG_INHERIT, flags) };
        if ok == 0 {
            return Err(Win32Error::last());
        }
        Ok(())
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if self.0 != 0 && self.0 != INVALID_HANDLE_VALUE {
            // SAFETY: we are the unique owner; close exactly once.
            unsafe { CloseHandle(self.0) };
        }
    }
}
