//! gpii-service - Windows service supervising the per-user GPII helper.
//!
//! The same executable serves four roles, selected by `--mode`:
//!
//! - `--mode install` / `--mode uninstall`: register or remove the Windows
//!   service via the service control manager.
//! - `--mode service`: the entry the SCM invokes; hands control to the
//!   service dispatcher.
//! - unset: run in the foreground as the current user, for development.
//!
//! `main` stays synchronous; the tokio runtime is constructed explicitly by
//! whichever mode needs one.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use gpii_service_core::PRODUCT;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[cfg(windows)]
mod install;
mod runner;
#[cfg(windows)]
mod service;

/// Default name the service is registered under.
const DEFAULT_SERVICE_NAME: &str = "gpii-service";

/// gpii-service - supervises the per-user GPII process
#[derive(Parser, Debug)]
#[command(name = "gpii-service")]
#[command(version, about, long_about = None)]
struct Args {
    /// What to do; unset runs in the foreground as the current user
    #[arg(long, value_enum)]
    mode: Option<Mode>,

    /// Comma-separated arguments appended to the user process command line
    #[arg(long = "programArgs", value_delimiter = ',')]
    program_args: Vec<String>,

    /// Comma-separated arguments for the host runtime
    #[arg(long = "nodeArgs", value_delimiter = ',')]
    node_args: Vec<String>,

    /// Path to the user-mode application
    #[arg(long = "gpii")]
    gpii: Option<PathBuf>,

    /// Service name for install/uninstall
    #[arg(long = "serviceName", default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log file; service mode defaults to %ProgramData%\gpii\gpii-service.log
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Mode {
    /// Register the Windows service
    Install,
    /// Remove the Windows service
    Uninstall,
    /// Entry used by the service control manager
    Service,
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.mode {
        Some(Mode::Install) => {
            init_logging(&args.log_level, None)?;
            dispatch_install(&args)
        }
        Some(Mode::Uninstall) => {
            init_logging(&args.log_level, None)?;
            dispatch_uninstall(&args)
        }
        Some(Mode::Service) => dispatch_service(args),
        None => {
            init_logging(&args.log_level, args.log_file.as_deref())?;
            runner::run_foreground(child_command(&args))
        }
    }
}

#[cfg(windows)]
fn dispatch_install(args: &Args) -> Result<()> {
    install::install(&args.service_name, &install_arguments(args))
}

#[cfg(windows)]
fn dispatch_uninstall(args: &Args) -> Result<()> {
    install::uninstall(&args.service_name)
}

#[cfg(windows)]
fn dispatch_service(args: Args) -> Result<()> {
    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(default_service_log_file);
    init_logging(&args.log_level, Some(&log_file))?;
    service::run(args.service_name.clone(), child_command(&args))
}

#[cfg(not(windows))]
fn dispatch_install(_args: &Args) -> Result<()> {
    anyhow::bail!("service installation requires Windows")
}

#[cfg(not(windows))]
fn dispatch_uninstall(_args: &Args) -> Result<()> {
    anyhow::bail!("service removal requires Windows")
}

#[cfg(not(windows))]
fn dispatch_service(_args: Args) -> Result<()> {
    anyhow::bail!("service mode requires Windows")
}

/// `%ProgramData%\gpii\gpii-service.log`.
#[cfg_attr(not(windows), allow(dead_code))]
fn default_service_log_file() -> PathBuf {
    let program_data =
        std::env::var("ProgramData").unwrap_or_else(|_| "C:\\ProgramData".to_string());
    PathBuf::from(program_data)
        .join(PRODUCT)
        .join("gpii-service.log")
}

/// Initialize tracing; with a file the output is append-only plain text.
fn init_logging(level: &str, log_file: Option<&std::path::Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("failed to create log directory")?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .context("failed to open log file")?;

        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
    Ok(())
}

/// Build the child command line from the CLI arguments.
///
/// Shape: `<nodeArgs> "<gpii>" <programArgs> <pipe>`; the trailing `<pipe>`
/// placeholder is replaced by the launcher with the endpoint name. An empty
/// result makes the launcher synthesize its default command.
fn child_command(args: &Args) -> String {
    let Some(gpii) = &args.gpii else {
        return String::new();
    };
    let mut parts: Vec<String> = Vec::new();
    parts.extend(args.node_args.iter().cloned());
    parts.push(format!("\"{}\"", gpii.display()));
    parts.extend(args.program_args.iter().cloned());
    parts.push(gpii_service_core::launcher::PIPE_PLACEHOLDER.to_string());
    parts.join(" ")
}

/// Arguments baked into the service's registered command line so the
/// service-mode process reconstructs the same child command.
#[cfg_attr(not(windows), allow(dead_code))]
fn install_arguments(args: &Args) -> Vec<String> {
    let mut out = vec!["--mode".to_string(), "service".to_string()];
    if !args.program_args.is_empty() {
        out.push(format!("--programArgs={}", args.program_args.join(",")));
    }
    if !args.node_args.is_empty() {
        out.push(format!("--nodeArgs={}", args.node_args.join(",")));
    }
    if let Some(gpii) = &args.gpii {
        out.push(format!("--gpii={}", gpii.display()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("gpii-service").chain(argv.iter().copied()))
    }

    #[test]
    fn no_gpii_means_empty_command() {
        assert_eq!(child_command(&args(&[])), "");
    }

    #[test]
    fn command_carries_node_args_gpii_and_program_args() {
        let args = args(&[
            "--nodeArgs=--inspect,--max-old-space-size=256",
            "--gpii=C:\\gpii\\gpii.js",
            "--programArgs=--cloud,https://example.com",
        ]);
        assert_eq!(
            child_command(&args),
            "--inspect --max-old-space-size=256 \"C:\\gpii\\gpii.js\" --cloud https://example.com <pipe>"
        );
    }

    #[test]
    fn install_arguments_round_trip_the_flags() {
        let args = args(&[
            "--mode=install",
            "--gpii=C:\\gpii\\gpii.js",
            "--programArgs=a,b",
        ]);
        assert_eq!(
            install_arguments(&args),
            vec![
                "--mode".to_string(),
                "service".to_string(),
                "--programArgs=a,b".to_string(),
                "--gpii=C:\\gpii\\gpii.js".to_string(),
            ]
        );
    }

    #[test]
    fn uninstall_defaults_the_service_name() {
        let args = args(&["--mode=uninstall"]);
        assert_eq!(args.service_name, "gpii-service");
    }
}
