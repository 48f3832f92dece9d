//! Process restart: the phase-transition primitive after a handoff.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result};

/// Wait `delay`, then replace this process with a fresh copy of itself,
/// same arguments. Only returns if the exec fails.
pub async fn restart_after(delay: Duration) -> Result<()> {
    tracing::info!(delay_ms = delay.as_millis() as u64, "restarting");
    tokio::time::sleep(delay).await;

    let exe = std::env::current_exe().context("cannot locate own executable")?;
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let err = Command::new(&exe).args(&args).exec();
    Err(err).with_context(|| format!("exec {} failed", exe.display()))
}
