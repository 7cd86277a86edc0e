//! Client-side open of a named pipe.
//!
//! The server side is owned by tokio; only the client half is opened raw,
//! because it must be a plain synchronous handle the child can inherit and
//! use as an ordinary file descriptor.

use windows_sys::Win32::Foundation::{GENERIC_READ, GENERIC_WRITE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, OPEN_EXISTING};

use super::handle::OwnedHandle;
use super::{to_wide, Win32Error};

/// Open the client end of the named pipe `name` for duplex byte I/O.
///
/// The handle is deliberately opened without overlapped I/O so the child's
/// runtime can drive it with ordinary blocking reads and writes.
///
/// # Errors
///
/// Returns the last-error code if the open fails.
pub fn open_pipe_client(name: &str) -> Result<OwnedHandle, Win32Error> {
    let name_w = to_wide(name);
    // SAFETY: name_w outlives the call; no security attributes or template.
    let handle = unsafe {
        CreateFileW(
            name_w.as_ptr(),
            GENERIC_READ | GENERIC_WRITE,
            0,
            std::ptr::null(),
            OPEN_EXISTING,
            0,
            0,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(Win32Error::last());
    }
    // SAFETY: CreateFileW succeeded; we are the unique owner.
    Ok(unsafe { OwnedHandle::from_raw(handle) })
}
