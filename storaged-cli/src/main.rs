//! storaged — privileged storage management daemon and its client.
//!
//! # Usage
//!
//! ```text
//! storaged daemon run [--persist]
//! storaged daemon stop|status
//! storaged objects [--json]
//! storaged jobs [--json]
//! storaged cancel <job-path> [--no-user-interaction]
//! storaged resync
//! storaged call <object> <interface> <method> [--args <json>]
//! ```
//!
//! Every command accepts `--config <path>` and `--socket <path>`.

mod commands;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use commands::{
    call::CallArgs, daemon::DaemonCommand, jobs::CancelArgs, jobs::JobsArgs, status::ObjectsArgs,
};
use storaged_core::config::{self, DaemonConfig, DEFAULT_CONFIG_PATH};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "storaged",
    version,
    about = "Privileged storage management daemon",
    long_about = None,
)]
struct Cli {
    /// Daemon configuration file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the socket path named in the configuration.
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run or query the daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// List published storage objects.
    Objects(ObjectsArgs),

    /// List running jobs.
    Jobs(JobsArgs),

    /// Cancel a running job.
    Cancel(CancelArgs),

    /// Ask the daemon to resynchronize its objects now.
    Resync,

    /// Make a raw method call and print the JSON result.
    Call(CallArgs),
}

/// Configuration and socket every command works against.
#[derive(Debug, Clone)]
pub struct Session {
    pub config: DaemonConfig,
}

impl Session {
    fn load(config_path: &Path, socket: Option<PathBuf>) -> Result<Self> {
        let mut config = config::load_at(config_path)
            .with_context(|| format!("failed to load {}", config_path.display()))?;
        if let Some(socket) = socket {
            config.socket_path = socket;
        }
        Ok(Self { config })
    }

    pub fn socket(&self) -> &Path {
        &self.config.socket_path
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    let ctx = Session::load(&cli.config, cli.socket)?;
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(ctx, command),
        Commands::Objects(args) => args.run(&ctx),
        Commands::Jobs(args) => args.run(&ctx),
        Commands::Cancel(args) => args.run(&ctx),
        Commands::Resync => commands::status::resync(&ctx),
        Commands::Call(args) => args.run(&ctx),
    }
}
