//! Process creation under a foreign token, liveness probing, termination,
//! and parent-relationship snapshots.

use std::collections::HashMap;

use windows_sys::Win32::Foundation::{
    HANDLE, INVALID_HANDLE_VALUE, STILL_ACTIVE, WAIT_FAILED, WAIT_OBJECT_0,
};
use windows_sys::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessAsUserW, GetExitCodeProcess, OpenProcess, TerminateProcess, WaitForSingleObject,
    CREATE_NEW_CONSOLE, CREATE_UNICODE_ENVIRONMENT, INFINITE, PROCESS_INFORMATION,
    PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_TERMINATE, STARTF_USESTDHANDLES, STARTUPINFOW,
};

use super::handle::OwnedHandle;
use super::{to_wide, Win32Error};

/// CRT file-open flag for entries in the inherited-handle blob.
const FOPEN: u8 = 0x01;

/// Desktop the child is attached to inside the user's session.
const CHILD_DESKTOP: &str = "winsta0\\default";

/// A process created by [`spawn_as_user`].
pub struct SpawnedProcess {
    /// OS process id.
    pub pid: u32,
    /// Waitable process handle.
    pub process: OwnedHandle,
}

/// Build the packed handle-inheritance blob the child's C runtime decodes
/// into file descriptors: `{ int count; u8 flags[count]; u64 handles[count]; }`.
///
/// The first three entries are the standard handles, so extra handles start
/// at fd 3 in the child.
fn handle_blob(std_handles: [HANDLE; 3], extra: &[HANDLE]) -> Vec<u8> {
    let count = std_handles.len() + extra.len();
    let mut blob = Vec::with_capacity(4 + count + count * 8);
    #[allow(clippy::cast_possible_truncation)] // handful of handles
    blob.extend_from_slice(&(count as u32).to_le_bytes());
    blob.extend(std::iter::repeat(FOPEN).take(count));
    for handle in std_handles.iter().chain(extra) {
        blob.extend_from_slice(&(*handle as u64).to_le_bytes());
    }
    blob
}

/// Create a process running as the user identified by `token`.
///
/// `token == 0` falls back to the ordinary current-user create-process path.
/// `env_block` is the double-NUL-terminated wide environment; `inherit`
/// lists extra handles the child materializes as fds 3.. via the reserved-2
/// blob. Handles in `inherit` are marked inheritable here; the caller keeps
/// ownership and closes its copies after this returns.
///
/// # Errors
///
/// Returns the last-error code if process creation fails.
pub fn spawn_as_user(
    token: HANDLE,
    command: &str,
    env_block: &[u16],
    current_dir: Option<&str>,
    inherit: &[&OwnedHandle],
) -> Result<SpawnedProcess, Win32Error> {
    // CreateProcessW-family may rewrite the command-line buffer in place.
    let mut command_w = to_wide(command);
    let desktop_w = to_wide(CHILD_DESKTOP);
    let dir_w = current_dir.map(to_wide);

    // SAFETY: zeroed STARTUPINFOW is the documented "no preferences" state.
    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    {
        startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    }
    startup.lpDesktop = desktop_w.as_ptr().cast_mut();

    let mut blob;
    if !inherit.is_empty() {
        for handle in inherit {
            handle.set_inheritable(true)?;
        }
        // SAFETY: GetStdHandle has no preconditions; a service may report
        // 0 or INVALID_HANDLE_VALUE here, which the child tolerates.
        let std_handles = unsafe {
            [
                GetStdHandle(STD_INPUT_HANDLE),
                GetStdHandle(STD_OUTPUT_HANDLE),
                GetStdHandle(STD_ERROR_HANDLE),
            ]
        };
        startup.dwFlags |= STARTF_USESTDHANDLES;
        startup.hStdInput = std_handles[0];
        startup.hStdOutput = std_handles[1];
        startup.hStdError = std_handles[2];

        let raw: Vec<HANDLE> = inherit.iter().map(|h| h.raw()).collect();
        blob = handle_blob(std_handles, &raw);
        #[allow(clippy::cast_possible_truncation)] // blob is a few dozen bytes
        {
            startup.cbReserved2 = blob.len() as u16;
        }
        startup.lpReserved2 = blob.as_mut_ptr();
    }

    // SAFETY: zeroed PROCESS_INFORMATION is filled in on success.
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    // SAFETY: all pointers outlive the call; env_block is double-NUL
    // terminated and CREATE_UNICODE_ENVIRONMENT says it is UTF-16.
    let ok = unsafe {
        CreateProcessAsUserW(
            token,
            std::ptr::null(),
            command_w.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            i32::from(!inherit.is_empty()),
            CREATE_UNICODE_ENVIRONMENT | CREATE_NEW_CONSOLE,
            env_block.as_ptr().cast(),
            dir_w.as_ref().map_or(std::ptr::null(), |d| d.as_ptr()),
            &startup,
            &mut info,
        )
    };
    if ok == 0 {
        return Err(Win32Error::last());
    }

    // The primary thread handle is never used; close it now.
    // SAFETY: info handles are valid after a successful create.
    drop(unsafe { OwnedHandle::from_raw(info.hThread) });
    let process = unsafe { OwnedHandle::from_raw(info.hProcess) };

    Ok(SpawnedProcess {
        pid: info.dwProcessId,
        process,
    })
}

/// Block until the process signals, then collect its exit code.
///
/// Intended for a blocking worker thread; the supervisor observes the
/// completion as an event.
///
/// # Errors
///
/// Returns the last-error code if the wait or the exit-code query fails.
pub fn wait_for_exit(process: &OwnedHandle) -> Result<u32, Win32Error> {
    // SAFETY: process is a valid waitable handle owned by the caller.
    let waited = unsafe { WaitForSingleObject(process.raw(), INFINITE) };
    if waited == WAIT_FAILED {
        return Err(Win32Error::last());
    }
    debug_assert_eq!(waited, WAIT_OBJECT_0);

    let mut code: u32 = 0;
    // SAFETY: process is valid; code receives the exit status.
    let ok = unsafe { GetExitCodeProcess(process.raw(), &mut code) };
    if ok == 0 {
        return Err(Win32Error::last());
    }
    Ok(code)
}

/// Probe whether `pid` names a live process.
///
/// This is the no-op-signal liveness check: it proves a process with that
/// pid exists, not that it is the expected application.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: OpenProcess returns 0 when the pid is gone or inaccessible.
    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle == 0 {
        return false;
    }
    // SAFETY: handle is valid here and closed by the wrapper.
    let handle = unsafe { OwnedHandle::from_raw(handle) };
    let mut code: u32 = 0;
    // SAFETY: handle is valid; code receives the exit status.
    let ok = unsafe { GetExitCodeProcess(handle.raw(), &mut code) };
    #[allow(clippy::cast_sign_loss)]
    {
        ok != 0 && code == STILL_ACTIVE as u32
    }
}

/// Best-effort termination by pid.
///
/// # Errors
///
/// Returns the last-error code if the process cannot be opened or killed.
pub fn kill(pid: u32) -> Result<(), Win32Error> {
    // SAFETY: OpenProcess returns 0 on failure.
    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, 0, pid) };
    if handle == 0 {
        return Err(Win32Error::last());
    }
    // SAFETY: handle is valid here and closed by the wrapper.
    let handle = unsafe { OwnedHandle::from_raw(handle) };
    // SAFETY: handle was opened with PROCESS_TERMINATE.
    let ok = unsafe { TerminateProcess(handle.raw(), 1) };
    if ok == 0 {
        return Err(Win32Error::last());
    }
    Ok(())
}

/// Snapshot the process table as a child-pid to parent-pid map.
///
/// # Errors
///
/// Returns the last-error code if the snapshot cannot be taken or walked.
pub fn parent_map() -> Result<HashMap<u32, u32>, Win32Error> {
    // SAFETY: a process snapshot takes no input handles.
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Err(Win32Error::last());
    }
    // SAFETY: snapshot is valid here and closed by the wrapper.
    let snapshot = unsafe { OwnedHandle::from_raw(snapshot) };

    // SAFETY: zeroed entry with dwSize set is the documented init state.
    let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
    #[allow(clippy::cast_possible_truncation)]
    {
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;
    }

    let mut map = HashMap::new();
    // SAFETY: snapshot and entry are valid for the duration of the walk.
    unsafe {
        if Process32FirstW(snapshot.raw(), &mut entry) == 0 {
            return Err(Win32Error::last());
        }
        loop {
            map.insert(entry.th32ProcessID, entry.th32ParentProcessID);
            if Process32NextW(snapshot.raw(), &mut entry) == 0 {
                break;
            }
        }
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_layout_is_count_flags_handles() {
        let blob = handle_blob([1, 2, 3], &[7]);
        // count
        assert_eq!(&blob[..4], &4u32.to_le_bytes());
        // one FOPEN flag per handle
        assert_eq!(&blob[4..8], &[FOPEN; 4]);
        // handles packed as u64, std handles first
        assert_eq!(&blob[8..16], &1u64.to_le_bytes());
        assert_eq!(&blob[32..40], &7u64.to_le_bytes());
        assert_eq!(blob.len(), 4 + 4 + 4 * 8);
    }

    #[test]
    fn current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn parent_map_contains_us() {
        let map = parent_map().unwrap();
        assert!(map.contains_key(&std::process::id()));
    }
}
