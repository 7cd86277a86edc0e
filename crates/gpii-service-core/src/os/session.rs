//! Console session resolution and access-token acquisition.

use windows_sys::Win32::Foundation::{
    ERROR_ACCESS_DENIED, ERROR_NO_TOKEN, ERROR_PRIVILEGE_NOT_HELD, ERROR_SUCCESS, HANDLE,
};
use windows_sys::Win32::Security::{
    DuplicateTokenEx, SecurityIdentification, TokenPrimary, TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE,
    TOKEN_QUERY,
};
use windows_sys::Win32::System::RemoteDesktop::{WTSGetActiveConsoleSessionId, WTSQueryUserToken};
use windows_sys::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

use super::handle::OwnedHandle;
use super::Win32Error;

/// Session id reported when no session is attached to the console.
const NO_SESSION: u32 = 0xFFFF_FFFF;

/// Rights required for a token that will be handed to create-process-as-user.
const PRIMARY_TOKEN_RIGHTS: u32 = TOKEN_ASSIGN_PRIMARY | TOKEN_DUPLICATE | TOKEN_QUERY;

/// The session currently attached to the physical console, if any.
#[must_use]
pub fn active_console_session_id() -> Option<u32> {
    // SAFETY: no arguments; returns 0xFFFFFFFF when no session is attached.
    let id = unsafe { WTSGetActiveConsoleSessionId() };
    (id != NO_SESSION).then_some(id)
}

/// Query the primary token of the user logged on to `session_id`.
///
/// Returns `Ok(None)` for the outcomes that are expected at the lock screen
/// and before first logon: `ERROR_NO_TOKEN`, `ERROR_ACCESS_DENIED`,
/// `ERROR_PRIVILEGE_NOT_HELD`, and a failing call that nevertheless reports
/// `ERROR_SUCCESS`. All other codes are hard errors.
///
/// # Errors
///
/// Returns the last-error code on any other failure.
pub fn query_user_token(session_id: u32) -> Result<Option<OwnedHandle>, Win32Error> {
    let mut token: HANDLE = 0;
    // SAFETY: token receives a new handle on success; the caller of
    // WTSQueryUserToken must hold SE_TCB (true for LocalSystem).
    let ok = unsafe { WTSQueryUserToken(session_id, &mut token) };
    if ok == 0 {
        let err = Win32Error::last();
        return match err.code {
            ERROR_NO_TOKEN | ERROR_ACCESS_DENIED | ERROR_PRIVILEGE_NOT_HELD | ERROR_SUCCESS => {
                Ok(None)
            }
            _ => Err(err),
        };
    }
    // SAFETY: WTSQueryUserToken succeeded, so token is valid and ours.
    Ok(Some(unsafe { OwnedHandle::from_raw(token) }))
}

/// Duplicate the current process's own token into a primary token with the
/// rights needed by the launcher.
///
/// Used when the host is not a service: the "console user" is then simply
/// the user this process runs as.
///
/// # Errors
///
/// Returns the last-error code if the open or the duplication fails.
pub fn current_process_token() -> Result<OwnedHandle, Win32Error> {
    let mut process_token: HANDLE = 0;
    // SAFETY: GetCurrentProcess returns a pseudo-handle that needs no close.
    let ok = unsafe {
        OpenProcessToken(GetCurrentProcess(), TOKEN_DUPLICATE | TOKEN_QUERY, &mut process_token)
    };
    if ok == 0 {
        return Err(Win32Error::last());
    }
    // SAFETY: OpenProcessToken succeeded; this wrapper closes it on all paths.
    let process_token = unsafe { OwnedHandle::from_raw(process_token) };

    let mut primary: HANDLE = 0;
    // SAFETY: process_token is valid; primary receives a new handle on success.
    let ok = unsafe {
        DuplicateTokenEx(
            process_token.raw(),
            PRIMARY_TOKEN_RIGHTS,
            std::ptr::null(),
            SecurityIdentification,
            TokenPrimary,
            &mut primary,
        )
    };
    if ok == 0 {
        return Err(Win32Error::last());
    }
    // SAFETY: DuplicateTokenEx succeeded.
    Ok(unsafe { OwnedHandle::from_raw(primary) })
}
