use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::Sender;
use tracing::{debug, warn};

use super::{SlotEvent, WorkerLauncher, WorkerProcess};
use crate::ipc::{IpcTransport, WorkerBootstrap, WorkerEvent};

/// Spawns each worker as a `tandem-worker` child process.
///
/// The bootstrap record goes down the child's stdin; lifecycle events come
/// back on its stdout. A waiter thread blocks in `Child::wait` so a dead
/// worker is reported as soon as the OS reaps it.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
}

impl ProcessLauncher {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &PathBuf {
        &self.executable
    }
}

fn spawn_waiter(
    mut child: Child,
    slot: usize,
    generation: u32,
    exited: Arc<AtomicBool>,
    events: Sender<SlotEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("tandem-waiter-{slot}"))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(slot, generation, %err, "failed to wait on worker");
                    None
                }
            };
            exited.store(true, Ordering::Release);
            let _ = events.send(SlotEvent::Exited {
                slot,
                generation,
                code,
            });
        })
        .context("failed to spawn worker waiter thread")?;
    Ok(())
}

fn spawn_reader(
    transport: IpcTransport<ChildStdout, ChildStdin>,
    slot: usize,
    generation: u32,
    events: Sender<SlotEvent>,
) -> Result<()> {
    thread::Builder::new()
        .name(format!("tandem-events-{slot}"))
        .spawn(move || {
            while let Ok(event) = transport.recv::<WorkerEvent>() {
                let event = match event {
                    WorkerEvent::Attached { pid } => SlotEvent::Attached {
                        slot,
                        generation,
                        pid,
                    },
                    WorkerEvent::Primed => SlotEvent::Primed { slot, generation },
                    WorkerEvent::PrimingFailed { reason } => SlotEvent::PrimingFailed {
                        slot,
                        generation,
                        reason,
                    },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
            debug!(slot, generation, "worker event stream closed");
        })
        .context("failed to spawn worker event thread")?;
    Ok(())
}

impl WorkerLauncher for ProcessLauncher {
    fn name(&self) -> &'static str {
        "process"
    }

    fn launch(
        &self,
        bootstrap: WorkerBootstrap,
        events: Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let (slot, generation) = (bootstrap.slot, bootstrap.generation);
        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn worker at {:?}", self.executable))?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("worker stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("worker stdin not captured"))?;

        let exited = Arc::new(AtomicBool::new(false));
        spawn_waiter(child, slot, generation, Arc::clone(&exited), events.clone())?;

        let transport = IpcTransport::new(stdout, stdin);
        let sent = transport.send(&bootstrap);
        spawn_reader(transport, slot, generation, events)?;
        let mut worker = ChildWorker { pid, exited };
        if let Err(err) = sent {
            let _ = worker.kill();
            return Err(err.context("failed to send worker bootstrap"));
        }
        debug!(slot, generation, pid, executable = ?self.executable, "worker spawned");
        Ok(Box::new(worker))
    }
}

struct ChildWorker {
    pid: u32,
    exited: Arc<AtomicBool>,
}

impl ChildWorker {
    fn signal(&self, signal: libc::c_int) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let pid = libc::pid_t::try_from(self.pid).context("pid out of range")?;
        // A child reaped since the check above answers ESRCH.
        let rc = unsafe { libc::kill(pid, signal) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err).with_context(|| format!("failed to signal worker {}", self.pid));
            }
        }
        Ok(())
    }
}

impl WorkerProcess for ChildWorker {
    fn id(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> Result<()> {
        self.signal(libc::SIGTERM)
    }

    fn kill(&mut self) -> Result<()> {
        self.signal(libc::SIGKILL)
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}
