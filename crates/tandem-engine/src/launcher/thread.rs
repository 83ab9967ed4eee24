use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use tracing::{error, warn};

use super::{SlotEvent, WorkerLauncher, WorkerProcess};
use crate::ipc::WorkerBootstrap;
use crate::worker::{WorkerRuntime, WorkerSignals};

const THREAD_ID_BASE: u32 = 0x8000_0000;

/// Runs workers as threads of the current process.
///
/// Workers still attach to their slot through the shared-memory
/// descriptors, exactly like a child process would. Useful without a worker
/// binary and for fault injection in tests (`hang`, `crash`).
#[derive(Debug, Clone, Default)]
pub struct ThreadLauncher {
    live: Arc<Mutex<HashMap<usize, Arc<WorkerSignals>>>>,
    next_id: Arc<AtomicU32>,
}

impl ThreadLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Freezes the worker in `slot`: no heartbeats, no buffers.
    pub fn hang(&self, slot: usize) -> bool {
        match self.live.lock().get(&slot) {
            Some(signals) => {
                signals.hang.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// Ends the worker in `slot` abruptly.
    pub fn crash(&self, slot: usize) -> bool {
        match self.live.lock().get(&slot) {
            Some(signals) => {
                signals.request_stop();
                true
            }
            None => false,
        }
    }
}

struct ExitGuard {
    slot: usize,
    generation: u32,
    events: Sender<SlotEvent>,
    exited: Arc<AtomicBool>,
    code: Option<i32>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.exited.store(true, Ordering::Release);
        let _ = self.events.send(SlotEvent::Exited {
            slot: self.slot,
            generation: self.generation,
            code: self.code,
        });
    }
}

fn run_worker(bootstrap: WorkerBootstrap, signals: Arc<WorkerSignals>, guard: &mut ExitGuard) {
    let (slot, generation) = (bootstrap.slot, bootstrap.generation);
    let mut runtime = match WorkerRuntime::attach(&bootstrap) {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(slot, generation, error = ?err, "worker failed to attach");
            guard.code = Some(1);
            return;
        }
    };
    let _ = guard.events.send(SlotEvent::Attached {
        slot,
        generation,
        pid: std::process::id(),
    });
    if let Err(err) = runtime.prime() {
        warn!(slot, generation, error = ?err, "priming failed");
        let _ = guard.events.send(SlotEvent::PrimingFailed {
            slot,
            generation,
            reason: format!("{err:#}"),
        });
        guard.code = Some(2);
        return;
    }
    let _ = guard.events.send(SlotEvent::Primed { slot, generation });
    match runtime.run(&signals) {
        Ok(_) => guard.code = Some(0),
        Err(err) => {
            error!(slot, generation, error = ?err, "worker loop failed");
            guard.code = Some(1);
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn launch(
        &self,
        bootstrap: WorkerBootstrap,
        events: Sender<SlotEvent>,
    ) -> Result<Box<dyn WorkerProcess>> {
        let signals = Arc::new(WorkerSignals::new());
        let exited = Arc::new(AtomicBool::new(false));
        let slot = bootstrap.slot;
        let id = THREAD_ID_BASE | self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.lock().insert(slot, Arc::clone(&signals));

        let mut guard = ExitGuard {
            slot,
            generation: bootstrap.generation,
            events,
            exited: Arc::clone(&exited),
            code: None,
        };
        let thread_signals = Arc::clone(&signals);
        let handle = std::thread::Builder::new()
            .name(format!("tandem-worker-{slot}"))
            .spawn(move || run_worker(bootstrap, thread_signals, &mut guard))
            .context("failed to spawn worker thread")?;

        Ok(Box::new(ThreadWorker {
            id,
            slot,
            signals,
            exited,
            live: Arc::clone(&self.live),
            handle: Some(handle),
        }))
    }
}

struct ThreadWorker {
    id: u32,
    slot: usize,
    signals: Arc<WorkerSignals>,
    exited: Arc<AtomicBool>,
    live: Arc<Mutex<HashMap<usize, Arc<WorkerSignals>>>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerProcess for ThreadWorker {
    fn id(&self) -> u32 {
        self.id
    }

    fn terminate(&mut self) -> Result<()> {
        self.signals.request_stop();
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.signals.request_stop();
        Ok(())
    }

    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::Acquire)
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        self.signals.request_stop();
        {
            let mut live = self.live.lock();
            if live
                .get(&self.slot)
                .is_some_and(|current| Arc::ptr_eq(current, &self.signals))
            {
                live.remove(&self.slot);
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
