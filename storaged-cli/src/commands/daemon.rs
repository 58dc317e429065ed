//! `storaged daemon` — run the daemon in the foreground or query it.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};

use storaged_daemon::{request_status, request_stop, start_blocking, DaemonError};

use crate::Session;

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (socket server + device watcher).
    Run(RunArgs),
    /// Request graceful daemon shutdown over the Unix socket.
    Stop,
    /// Query daemon runtime status over the Unix socket.
    Status,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Keep running with no clients and no jobs.
    #[arg(long)]
    pub persist: bool,
}

pub fn run(ctx: Session, command: DaemonCommand) -> Result<()> {
    match command {
        DaemonCommand::Run(args) => {
            let mut config = ctx.config;
            config.persist |= args.persist;
            start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Stop => match request_stop(ctx.socket()) {
            Ok(()) => println!("daemon stop requested"),
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running");
            }
            Err(err) => return Err(err).context("failed to stop daemon"),
        },
        DaemonCommand::Status => match request_status(ctx.socket()) {
            Ok(status) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&status)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let payload = serde_json::json!({
                    "running": false,
                    "socket": ctx.socket().display().to_string(),
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render daemon status JSON")?
                );
            }
            Err(err) => return Err(err).context("failed to query daemon status"),
        },
    }

    Ok(())
}
