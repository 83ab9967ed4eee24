//! Worker process: attaches to one supervisor slot and renders until it
//! receives SIGTERM (or SIGINT). Logs go to stderr; stdout carries IPC.

use std::io::{stdin, stdout, Read};
use std::sync::Arc;

use anyhow::{Context, Result};
use tandem_engine::ipc::{IpcTransport, WorkerBootstrap, WorkerEvent};
use tandem_engine::worker::{WorkerRuntime, WorkerSignals};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    let signals = Arc::new(WorkerSignals::new());
    let handler_signals = Arc::clone(&signals);
    ctrlc::set_handler(move || handler_signals.request_stop())
        .context("failed to install termination handler")?;

    let transport = IpcTransport::new(stdin(), stdout());
    let bootstrap: WorkerBootstrap = transport.recv().context("failed to read bootstrap")?;
    let (slot, generation) = (bootstrap.slot, bootstrap.generation);

    let mut runtime = WorkerRuntime::attach(&bootstrap)?;
    transport.send(&WorkerEvent::Attached {
        pid: std::process::id(),
    })?;

    if let Err(err) = runtime.prime() {
        error!(slot, generation, error = ?err, "priming failed");
        transport.send(&WorkerEvent::PrimingFailed {
            reason: format!("{err:#}"),
        })?;
        std::process::exit(2);
    }
    transport.send(&WorkerEvent::Primed)?;

    // Nothing else arrives on stdin; EOF means the supervisor is gone.
    let orphan_signals = Arc::clone(&signals);
    std::thread::Builder::new()
        .name("tandem-stdin-watch".into())
        .spawn(move || {
            let mut byte = [0u8; 1];
            while matches!(stdin().read(&mut byte), Ok(n) if n > 0) {}
            orphan_signals.request_stop();
        })
        .context("failed to spawn stdin watcher")?;

    let report = runtime.run(&signals)?;
    info!(slot, generation, rendered = report.rendered, "worker exiting");
    Ok(())
}
