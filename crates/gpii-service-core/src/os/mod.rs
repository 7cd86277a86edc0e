//! Typed wrappers over the native session, token, environment, process,
//! pipe, handle and TCP-table calls.
//!
//! Every wrapper returns a `Result` carrying the last-error code on failure;
//! nothing in this module interprets errors beyond the documented soft
//! outcomes of the user-token query. Handles are owned by [`handle::OwnedHandle`]
//! and closed exactly once.

#[cfg(windows)]
pub mod env;
#[cfg(windows)]
pub mod handle;
#[cfg(windows)]
pub mod pipe;
#[cfg(windows)]
pub mod process;
#[cfg(windows)]
pub mod session;
#[cfg(windows)]
pub mod tcp;

/// A native call failed; `code` is the thread's last-error value at the
/// point of failure.
///
/// The code is kept numeric end to end so callers can match on specific
/// conditions (`ERROR_NO_TOKEN`, `ERROR_ACCESS_DENIED`, ...) instead of
/// parsing strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("system call failed (last error {code})")]
pub struct Win32Error {
    /// The `GetLastError` value captured when the call failed.
    pub code: u32,
}

impl Win32Error {
    /// Wrap a known error code.
    #[must_use]
    pub const fn new(code: u32) -> Self {
        Self { code }
    }

    /// Capture the calling thread's last-error value.
    #[cfg(windows)]
    #[must_use]
    pub fn last() -> Self {
        // SAFETY: GetLastError reads thread-local state and cannot fail.
        Self {
            code: unsafe { windows_sys::Win32::Foundation::GetLastError() },
        }
    }
}

/// Encode a string as a NUL-terminated UTF-16 buffer for Win32 calls.
#[cfg(windows)]
#[must_use]
pub(crate) fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}
