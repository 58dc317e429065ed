//! `storaged call` — raw method call for scripting and debugging.

use anyhow::{Context, Result};
use clap::Args;
use serde_json::Value;

use storaged_daemon::{send_request, MethodCall};

use crate::Session;

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Target object path.
    pub object: String,
    /// Interface name, e.g. `org.storaged.Manager`.
    pub interface: String,
    /// Method name, e.g. `Status`.
    pub method: String,

    /// Arguments as a JSON object.
    #[arg(long)]
    pub args: Option<String>,
}

impl CallArgs {
    pub fn run(self, ctx: &Session) -> Result<()> {
        let mut call = MethodCall::new(self.object.as_str(), &self.interface, &self.method);
        if let Some(raw) = self.args.as_deref() {
            let args: Value = serde_json::from_str(raw).context("--args must be valid JSON")?;
            call = call.with_args(args);
        }

        let response = send_request(ctx.socket(), &call).context("call failed")?;
        let member = call.member();
        match response.into_result() {
            Ok(data) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&data).context("failed to render result JSON")?
                );
                Ok(())
            }
            Err(err) => anyhow::bail!("{member}: {} ({})", err.message(), err.name()),
        }
    }
}
