use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::Mutex;

use super::Supervisor;

/// Background thread that drives [`Supervisor::poll`] at a fixed interval.
pub struct MonitorHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(1);

    pub fn spawn(supervisor: Arc<Mutex<Supervisor>>, interval: Duration) -> anyhow::Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("tandem-monitor".into())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    supervisor.lock().poll();
                    thread::sleep(interval);
                }
            })
            .context("failed to spawn monitor thread")?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Stops polling and waits for the thread to finish.
    pub fn stop(mut self) -> anyhow::Result<()> {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow!("monitor thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if let Err(err) = thread.join() {
                tracing::error!(?err, "failed to join monitor thread");
            }
        }
    }
}
