//! Minimal worker that echoes its input back as output.
//!
//! Used to exercise the controller/worker protocol end to end. An input of
//! `{"fail": "reason"}` makes the execution fail with that reason.

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::Parser;
use fabric_app::{Callbacks, WorkerArgs, run_worker};
use fabric_config::FabricConfig;
use fabric_types::Ray;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "fabric-echo-worker")]
#[command(about = "Echo worker for the controller/worker protocol")]
struct Cli {
    #[command(flatten)]
    worker: WorkerArgs,
    /// Configuration file; defaults to the usual search path.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Exit once idle instead of waiting for more work.
    #[arg(long)]
    suspend_when_idle: bool,
    /// Report CRASHED instead of serving.
    #[arg(long)]
    crash_on_load: bool,
    /// Report CRASHED unless this file exists, creating it first.
    #[arg(long)]
    crash_once: Option<PathBuf>,
}

fn echo(input: &Value, ray: &mut Ray) -> Result<Option<Value>> {
    if let Some(reason) = input.get("fail").and_then(Value::as_str) {
        bail!("{reason}");
    }
    ray.progress("default", 1.0, 2.0);
    Ok(Some(input.clone()))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => FabricConfig::load_from(path)?,
        None => FabricConfig::load_or_default(),
    };

    let suspend_when_idle = cli.suspend_when_idle;
    let crash_on_load = cli.crash_on_load;
    let crash_once = cli.crash_once;
    run_worker(&cli.worker, &config.worker, move || {
        if crash_on_load {
            bail!("refusing to load");
        }
        if let Some(marker) = &crash_once
            && !marker.exists()
        {
            std::fs::write(marker, b"crashed")?;
            bail!("refusing to load the first time");
        }
        let callbacks = Callbacks::new(echo).with_configure(|settings| {
            tracing::info!(keys = settings.len(), "Settings reloaded");
            Ok(())
        });
        Ok(if suspend_when_idle {
            callbacks.with_suspend(|_| true)
        } else {
            callbacks
        })
    })
}
