//! PTY Session - launch diagnostics
//!
//! Launches the configured shell on a new PTY session, reports what the
//! parent ends up holding, then hangs up the terminal and reports how the
//! child went away. Useful for checking PTY support on a machine.

use std::io;
use std::process::ExitCode;

use clap::Parser;
use nix::unistd::getsid;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pty_session::config::{CliArgs, LaunchConfig};
use pty_session::{ChildExit, ChildStep, SessionLauncher};

/// What the launcher produced
#[derive(Debug, Serialize)]
struct SessionReport {
    program: String,
    policy: String,
    child_pid: i32,
    child_session: Option<i32>,
    parent_session: Option<i32>,
    master_fd: i32,
    slave_path: String,
    nonblocking: bool,
    exit: String,
}

fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Fatal error: {}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(args: &CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = LaunchConfig::load_with_args(args)?;
    let launcher = SessionLauncher::from_config(&config);

    tracing::info!(
        "Launching {} (policy: {})",
        config.effective_shell(),
        config.shell_policy
    );

    let handle = launcher.launch(&config.shell)?;

    // Give the child a moment to reach exec; its first output means it got there
    let _ = handle.poll_read(1000);

    let report = SessionReport {
        program: config.effective_shell().to_string(),
        policy: config.shell_policy.to_string(),
        child_pid: handle.child_pid().as_raw(),
        child_session: getsid(Some(handle.child_pid())).ok().map(|p| p.as_raw()),
        parent_session: getsid(None).ok().map(|p| p.as_raw()),
        master_fd: handle.master_fd(),
        slave_path: handle.slave_path().to_string(),
        nonblocking: handle.is_nonblocking()?,
        // Last, since hanging up consumes the handle
        exit: describe_exit(handle.hang_up()?),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn describe_exit(exit: ChildExit) -> String {
    match exit {
        ChildExit::Exited(code) => match ChildStep::from_exit_code(code) {
            Some(step) => format!("exited with code {} ({} failed)", code, step),
            None => format!("exited with code {}", code),
        },
        ChildExit::Signaled(signal) => format!("terminated by signal {}", signal),
    }
}

fn print_report(report: &SessionReport) {
    let show = |id: Option<i32>| id.map_or_else(|| "unknown".to_string(), |id| id.to_string());

    println!("program:        {}", report.program);
    println!("policy:         {}", report.policy);
    println!("child pid:      {}", report.child_pid);
    println!("child session:  {}", show(report.child_session));
    println!("parent session: {}", show(report.parent_session));
    println!("master fd:      {}", report.master_fd);
    println!("slave path:     {}", report.slave_path);
    println!("non-blocking:   {}", report.nonblocking);
    println!("exit:           {}", report.exit);
}
