//! Out-of-band pipe between the supervisor and a worker process.
//!
//! Carries the bootstrap record and lifecycle events only. Audio and
//! commands travel through the shared rings; shutdown is a signal.

use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::patch::PatchPlan;
use crate::ring::RingDescriptor;
use crate::slot_control::ControlDescriptor;
use crate::worker::WorkerSettings;

/// Everything a worker needs to attach to its slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerBootstrap {
    pub slot: usize,
    pub generation: u32,
    pub audio: RingDescriptor,
    pub commands: RingDescriptor,
    pub control: ControlDescriptor,
    pub plan: PatchPlan,
    pub settings: WorkerSettings,
}

/// Lifecycle events a worker reports back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum WorkerEvent {
    Attached { pid: u32 },
    Primed,
    PrimingFailed { reason: String },
}

/// Bidirectional bincode transport over a pair of byte streams.
#[derive(Debug)]
pub struct IpcTransport<R, W>
where
    R: Read,
    W: Write,
{
    reader: Arc<parking_lot::Mutex<BufReader<R>>>,
    writer: Arc<parking_lot::Mutex<BufWriter<W>>>,
}

impl<R, W> Clone for IpcTransport<R, W>
where
    R: Read + Send,
    W: Write + Send,
{
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<R, W> IpcTransport<R, W>
where
    R: Read,
    W: Write,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Arc::new(parking_lot::Mutex::new(BufReader::new(reader))),
            writer: Arc::new(parking_lot::Mutex::new(BufWriter::new(writer))),
        }
    }

    pub fn send<T: Serialize>(&self, value: &T) -> Result<()> {
        let mut writer = self.writer.lock();
        bincode::serialize_into(&mut *writer, value).context("failed to serialize ipc message")?;
        writer.flush().context("failed to flush ipc message")?;
        Ok(())
    }

    pub fn recv<T: DeserializeOwned>(&self) -> Result<T> {
        let mut reader = self.reader.lock();
        let value = bincode::deserialize_from(&mut *reader).context("failed to read ipc message")?;
        Ok(value)
    }
}
