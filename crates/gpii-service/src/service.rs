//! Service control manager integration.
//!
//! `run` hands this process to the SCM dispatcher; the registered control
//! handler translates control codes into bus events, and the supervisor
//! consumes them like any other subscriber. Control callbacks are plain C
//! functions, so the pieces they need (bus, child command, service name)
//! live in a process-wide context that is written exactly once before the
//! dispatcher starts.

use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use gpii_service_core::bus::EventBus;
use gpii_service_core::supervisor::{EVENT_SERVICE_START, EVENT_SERVICE_STOP, EVENT_SESSION_CHANGE};
use gpii_service_core::{HostRole, Win32Error};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use windows_sys::Win32::Foundation::{ERROR_CALL_NOT_IMPLEMENTED, NO_ERROR};
use windows_sys::Win32::System::RemoteDesktop::{
    WTSSESSION_NOTIFICATION, WTS_CONSOLE_CONNECT, WTS_CONSOLE_DISCONNECT, WTS_REMOTE_CONNECT,
    WTS_REMOTE_DISCONNECT, WTS_SESSION_LOCK, WTS_SESSION_LOGOFF, WTS_SESSION_LOGON,
    WTS_SESSION_REMOTE_CONTROL, WTS_SESSION_UNLOCK,
};
use windows_sys::Win32::System::Services::{
    RegisterServiceCtrlHandlerExW, SetServiceStatus, StartServiceCtrlDispatcherW, SERVICE_ACCEPT_SESSIONCHANGE,
    SERVICE_ACCEPT_SHUTDOWN, SERVICE_ACCEPT_STOP, SERVICE_CONTROL_INTERROGATE,
    SERVICE_CONTROL_SESSIONCHANGE, SERVICE_CONTROL_SHUTDOWN, SERVICE_CONTROL_STOP,
    SERVICE_RUNNING, SERVICE_START_PENDING, SERVICE_STATUS, SERVICE_STOPPED,
    SERVICE_STOP_PENDING, SERVICE_TABLE_ENTRYW, SERVICE_WIN32_OWN_PROCESS,
};

/// Everything the C callbacks need; written once in [`run`].
struct ServiceContext {
    name: String,
    command: String,
    bus: EventBus,
}

static CONTEXT: OnceLock<ServiceContext> = OnceLock::new();
static STATUS_HANDLE: AtomicIsize = AtomicIsize::new(0);

fn to_wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Hand this process to the SCM dispatcher. Blocks until the service stops.
///
/// # Errors
///
/// Fails if the dispatcher cannot start (e.g. the process was not launched
/// by the SCM).
pub fn run(service_name: String, command: String) -> Result<()> {
    let context = ServiceContext {
        name: service_name.clone(),
        command,
        bus: EventBus::new(),
    };
    if CONTEXT.set(context).is_err() {
        bail!("service dispatcher started twice");
    }

    let mut name_w = to_wide(&service_name);
    let table = [
        SERVICE_TABLE_ENTRYW {
            lpServiceName: name_w.as_mut_ptr(),
            lpServiceProc: Some(service_main),
        },
        // zeroed terminator entry
        SERVICE_TABLE_ENTRYW {
            lpServiceName: std::ptr::null_mut(),
            lpServiceProc: None,
        },
    ];

    info!(service = %service_name, "handing off to the service dispatcher");
    // SAFETY: the table is terminated by a null entry and outlives the
    // call; StartServiceCtrlDispatcherW blocks until the service exits.
    let ok = unsafe { StartServiceCtrlDispatcherW(table.as_ptr()) };
    if ok == 0 {
        return Err(Win32Error::last()).context("service dispatcher failed to start");
    }
    Ok(())
}

/// Entry the SCM invokes on its own thread.
unsafe extern "system" fn service_main(_argc: u32, _argv: *mut *mut u16) {
    let Some(context) = CONTEXT.get() else {
        return;
    };

    let name_w = to_wide(&context.name);
    let handle =
        RegisterServiceCtrlHandlerExW(name_w.as_ptr(), Some(control_handler), std::ptr::null_mut());
    if handle == 0 {
        error!(err = %Win32Error::last(), "control handler registration failed");
        return;
    }
    STATUS_HANDLE.store(handle, Ordering::SeqCst);
    set_status(SERVICE_START_PENDING);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "runtime construction failed");
            set_status(SERVICE_STOPPED);
            return;
        }
    };

    // Subscribe (via construction) before any event is published.
    let supervisor = crate::runner::build_supervisor(
        context.bus.clone(),
        HostRole::WindowsService,
        context.command.clone(),
    );

    set_status(SERVICE_RUNNING);
    context.bus.publish(EVENT_SERVICE_START, Value::Null);

    runtime.block_on(supervisor.run());

    info!("supervisor finished; reporting stopped");
    set_status(SERVICE_STOPPED);
}

/// Control callback, invoked on the dispatcher thread.
unsafe extern "system" fn control_handler(
    control: u32,
    event_type: u32,
    event_data: *mut core::ffi::c_void,
    _context: *mut core::ffi::c_void,
) -> u32 {
    let Some(context) = CONTEXT.get() else {
        return ERROR_CALL_NOT_IMPLEMENTED;
    };
    match control {
        SERVICE_CONTROL_STOP | SERVICE_CONTROL_SHUTDOWN => {
            set_status(SERVICE_STOP_PENDING);
            context.bus.publish(EVENT_SERVICE_STOP, Value::Null);
            NO_ERROR
        }
        SERVICE_CONTROL_SESSIONCHANGE => {
            let session_id = if event_data.is_null() {
                None
            } else {
                // SAFETY: for SESSIONCHANGE the event data is a
                // WTSSESSION_NOTIFICATION for the duration of the call.
                Some((*event_data.cast::<WTSSESSION_NOTIFICATION>()).dwSessionId)
            };
            let sub = session_change_name(event_type);
            context.bus.publish(
                EVENT_SESSION_CHANGE,
                json!({ "type": sub, "sessionId": session_id }),
            );
            NO_ERROR
        }
        SERVICE_CONTROL_INTERROGATE => NO_ERROR,
        other => {
            warn!(control = other, "unhandled service control");
            ERROR_CALL_NOT_IMPLEMENTED
        }
    }
}

fn session_change_name(event_type: u32) -> &'static str {
    match event_type {
        WTS_CONSOLE_CONNECT => "console-connect",
        WTS_CONSOLE_DISCONNECT => "console-disconnect",
        WTS_REMOTE_CONNECT => "remote-connect",
        WTS_REMOTE_DISCONNECT => "remote-disconnect",
        WTS_SESSION_LOGON => "session-logon",
        WTS_SESSION_LOGOFF => "session-logoff",
        WTS_SESSION_LOCK => "session-lock",
        WTS_SESSION_UNLOCK => "session-unlock",
        WTS_SESSION_REMOTE_CONTROL => "session-remote-control",
        _ => "unknown",
    }
}

fn set_status(state: u32) {
    let handle = STATUS_HANDLE.load(Ordering::SeqCst);
    if handle == 0 {
        return;
    }
    let controls = if state == SERVICE_RUNNING {
        SERVICE_ACCEPT_STOP | SERVICE_ACCEPT_SHUTDOWN | SERVICE_ACCEPT_SESSIONCHANGE
    } else {
        0
    };
    let status = SERVICE_STATUS {
        dwServiceType: SERVICE_WIN32_OWN_PROCESS,
        dwCurrentState: state,
        dwControlsAccepted: controls,
        dwWin32ExitCode: NO_ERROR,
        dwServiceSpecificExitCode: 0,
        dwCheckPoint: 0,
        dwWaitHint: 0,
    };
    // SAFETY: handle came from RegisterServiceCtrlHandlerExW.
    if unsafe { SetServiceStatus(handle, &status) } == 0 {
        warn!(err = %Win32Error::last(), state, "status report failed");
    }
}
