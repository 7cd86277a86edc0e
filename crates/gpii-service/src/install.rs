//! Service registration and removal via the service control manager.

use anyhow::{Context, Result};
use gpii_service_core::Win32Error;
use tracing::info;
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, CreateServiceW, DeleteService, OpenSCManagerW, OpenServiceW,
    SC_MANAGER_CONNECT, SC_MANAGER_CREATE_SERVICE, SERVICE_AUTO_START, SERVICE_ERROR_NORMAL,
    SERVICE_QUERY_STATUS, SERVICE_WIN32_OWN_PROCESS,
};

const DELETE: u32 = 0x0001_0000;

/// Display name shown in the services console.
const DISPLAY_NAME: &str = "GPII Service";

/// SCM handle closed exactly once on drop.
struct ScHandle(isize);

impl Drop for ScHandle {
    fn drop(&mut self) {
        if self.0 != 0 {
            // SAFETY: we are the unique owner.
            unsafe { CloseServiceHandle(self.0) };
        }
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Register the service, auto-start, running as LocalSystem.
///
/// `arguments` are baked into the registered command line; the SCM invokes
/// the binary with them on every start.
///
/// # Errors
///
/// Fails if the SCM refuses the connection or the creation.
pub fn install(service_name: &str, arguments: &[String]) -> Result<()> {
    let exe = std::env::current_exe().context("cannot resolve own executable path")?;
    let bin_path = format!("\"{}\" {}", exe.display(), arguments.join(" "));

    // SAFETY: null machine/database select the local active SCM database.
    let scm = unsafe { OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_CREATE_SERVICE) };
    if scm == 0 {
        return Err(Win32Error::last()).context("cannot open the service control manager");
    }
    let scm = ScHandle(scm);

    let name_w = to_wide(service_name);
    let display_w = to_wide(DISPLAY_NAME);
    let path_w = to_wide(&bin_path);
    // SAFETY: all strings are NUL-terminated and outlive the call; null
    // account/password means LocalSystem.
    let service = unsafe {
        CreateServiceW(
            scm.0,
            name_w.as_ptr(),
            display_w.as_ptr(),
            SERVICE_QUERY_STATUS,
            SERVICE_WIN32_OWN_PROCESS,
            SERVICE_AUTO_START,
            SERVICE_ERROR_NORMAL,
            path_w.as_ptr(),
            std::ptr::null(),
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if service == 0 {
        return Err(Win32Error::last())
            .with_context(|| format!("cannot create service '{service_name}'"));
    }
    drop(ScHandle(service));

    info!(service = %service_name, %bin_path, "service installed");
    Ok(())
}

/// Remove the service registration.
///
/// # Errors
///
/// Fails if the service does not exist or cannot be deleted.
pub fn uninstall(service_name: &str) -> Result<()> {
    // SAFETY: null machine/database select the local active SCM database.
    let scm = unsafe { OpenSCManagerW(std::ptr::null(), std::ptr::null(), SC_MANAGER_CONNECT) };
    if scm == 0 {
        return Err(Win32Error::last()).context("cannot open the service control manager");
    }
    let scm = ScHandle(scm);

    let name_w = to_wide(service_name);
    // SAFETY: name_w is NUL-terminated and outlives the call.
    let service = unsafe { OpenServiceW(scm.0, name_w.as_ptr(), DELETE) };
    if service == 0 {
        return Err(Win32Error::last())
            .with_context(|| format!("cannot open service '{service_name}'"));
    }
    let service = ScHandle(service);

    // SAFETY: the handle was opened with DELETE access.
    if unsafe { DeleteService(service.0) } == 0 {
        return Err(Win32Error::last())
            .with_context(|| format!("cannot delete service '{service_name}'"));
    }

    info!(service = %service_name, "service uninstalled");
    Ok(())
}
