//! `storaged jobs` and `storaged cancel`.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use storaged_core::ObjectPath;
use storaged_daemon::{request_cancel, request_jobs, DaemonError, JobInfo, MethodError};

use crate::commands::status::format_age;
use crate::Session;

/// Arguments for `storaged jobs`.
#[derive(Args, Debug)]
pub struct JobsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `storaged cancel`.
#[derive(Args, Debug)]
pub struct CancelArgs {
    /// Object path of the job, e.g. `/org/storaged/jobs/3`.
    pub job: String,

    /// Fail instead of prompting for authentication.
    #[arg(long)]
    pub no_user_interaction: bool,
}

#[derive(Tabled)]
struct JobTableRow {
    #[tabled(rename = "job")]
    path: String,
    #[tabled(rename = "operation")]
    operation: String,
    #[tabled(rename = "uid")]
    uid: u32,
    #[tabled(rename = "progress")]
    progress: String,
    #[tabled(rename = "started")]
    started: String,
}

impl JobsArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let raw = request_jobs(ctx.socket()).context("failed to list jobs")?;
        let jobs: Vec<JobInfo> =
            serde_json::from_value(raw).context("daemon sent a malformed job list")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&jobs).context("failed to serialize job JSON")?
            );
            return Ok(());
        }

        if jobs.is_empty() {
            println!("No jobs running.");
            return Ok(());
        }
        let now = Utc::now();
        let rows: Vec<JobTableRow> = jobs
            .into_iter()
            .map(|job| JobTableRow {
                path: job.path.to_string(),
                operation: if job.cancelled {
                    format!("{} (cancelling)", job.operation)
                } else {
                    job.operation
                },
                uid: job.started_by_uid,
                progress: job
                    .progress
                    .map_or_else(|| "-".to_string(), |p| format!("{:.0}%", p * 100.0)),
                started: format_age(job.started_at, now),
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

impl CancelArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let job = ObjectPath::from(self.job.as_str());
        match request_cancel(ctx.socket(), &job, self.no_user_interaction) {
            Ok(()) => {
                println!("{} {job}", "cancelled".green());
                Ok(())
            }
            Err(DaemonError::Method(err @ MethodError::AlreadyCancelled(_))) => {
                println!("{} {}", "already cancelled:".yellow(), err.message());
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("failed to cancel {job}")),
        }
    }
}
