//! The child's pid file: a hint, never an authority.
//!
//! The user process writes a single decimal pid to `<APPDATA>\gpii\gpii.pid`
//! while it runs; this service only ever reads it. Two questions are asked
//! of it:
//!
//! - at start: does a live (possibly externally started) instance exist?
//! - at child exit: did the child die unexpectedly (file still names the
//!   dead pid) or shut down cleanly (file gone or renamed)?
//!
//! A pid can be reused by the OS between the write and our read, so a "live
//! instance" answer can be wrong in that window. That is accepted behavior;
//! nothing here verifies the process image.

use std::path::Path;

/// File name of the pid file inside the user data directory.
pub const PID_FILE_NAME: &str = "gpii.pid";

/// How a child exit is classified against the pid file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// The pid file still named the dead process: it never got to clean up.
    Crashed,
    /// The pid file is absent or names someone else: deliberate shutdown.
    Clean,
}

/// Read and parse the pid file, if it exists and holds a decimal pid.
#[must_use]
pub fn read_pid(path: &Path) -> Option<u32> {
    let text = std::fs::read_to_string(path).ok()?;
    text.trim().parse().ok()
}

/// Classify the exit of `dead_pid` against the pid file.
#[must_use]
pub fn classify_exit(path: &Path, dead_pid: u32) -> ExitClass {
    match read_pid(path) {
        Some(pid) if pid == dead_pid => ExitClass::Crashed,
        _ => ExitClass::Clean,
    }
}

/// The pid of a live instance recorded in the pid file, if any.
///
/// `alive` is the liveness probe (a no-op-signal check); it is injected so
/// the policy stays testable without real processes.
#[must_use]
pub fn live_instance(path: &Path, alive: impl Fn(u32) -> bool) -> Option<u32> {
    let pid = read_pid(path)?;
    (pid != 0 && alive(pid)).then_some(pid)
}
