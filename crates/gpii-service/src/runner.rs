//! Shared supervisor bootstrap for foreground and service modes.

use anyhow::Result;

/// Build a supervisor wired to the real platform launcher.
#[cfg(windows)]
pub fn build_supervisor(
    bus: gpii_service_core::bus::EventBus,
    role: gpii_service_core::HostRole,
    command: String,
) -> gpii_service_core::supervisor::Supervisor {
    use std::sync::Arc;

    use gpii_service_core::launcher::WindowsLauncher;
    use gpii_service_core::supervisor::{RestartPolicy, Supervisor};
    use gpii_service_core::token::SessionTokens;

    let launcher = Arc::new(WindowsLauncher::new(SessionTokens::new(role)));
    Supervisor::new(bus, launcher, role, command, RestartPolicy::default())
}

/// Run in the foreground as the current user until Ctrl-C.
#[cfg(windows)]
pub fn run_foreground(command: String) -> Result<()> {
    use gpii_service_core::bus::EventBus;
    use gpii_service_core::supervisor::{EVENT_SERVICE_START, EVENT_SERVICE_STOP};
    use gpii_service_core::HostRole;
    use serde_json::Value;
    use tracing::info;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let bus = EventBus::new();
        let supervisor = build_supervisor(bus.clone(), HostRole::ForegroundUser, command);
        let run = tokio::spawn(supervisor.run());

        info!("running in the foreground; Ctrl-C stops");
        bus.publish(EVENT_SERVICE_START, Value::Null);

        tokio::signal::ctrl_c().await?;
        info!("interrupt received; stopping");
        bus.publish(EVENT_SERVICE_STOP, Value::Null);

        run.await?;
        Ok(())
    })
}

/// Foreground mode needs the platform launcher, which only exists on
/// Windows.
#[cfg(not(windows))]
pub fn run_foreground(_command: String) -> Result<()> {
    anyhow::bail!("gpii-service requires Windows")
}
