//! User environment enumeration via the profile API.

use windows_sys::Win32::Foundation::{FALSE, HANDLE};
use windows_sys::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};

use super::Win32Error;

/// Fetch the double-NUL-terminated wide environment block for `token`.
///
/// The block is copied into an owned buffer (including both terminating
/// NULs) and the OS allocation is destroyed before returning.
///
/// # Errors
///
/// Returns the last-error code if the block cannot be created.
pub fn environment_block_for(token: HANDLE) -> Result<Vec<u16>, Win32Error> {
    let mut block: *mut core::ffi::c_void = std::ptr::null_mut();
    // SAFETY: block receives a pointer owned by the profile API on success;
    // bInherit = FALSE so the service's own environment is never mixed in.
    let ok = unsafe { CreateEnvironmentBlock(&mut block, token, FALSE) };
    if ok == 0 || block.is_null() {
        return Err(Win32Error::last());
    }

    // Walk NAME=VALUE\0 entries until the empty string that terminates the
    // block. Copy while the OS allocation is still alive.
    let mut copied = Vec::new();
    let mut cursor = block.cast::<u16>();
    // SAFETY: the block is a valid double-NUL-terminated UTF-16 region for
    // the duration of this loop.
    unsafe {
        loop {
            let wch = cursor.read();
            copied.push(wch);
            if wch == 0 {
                // Entry terminator; a second NUL right behind it ends the block.
                if cursor.add(1).read() == 0 {
                    copied.push(0);
                    break;
                }
            }
            cursor = cursor.add(1);
        }
        DestroyEnvironmentBlock(block);
    }

    Ok(copied)
}
