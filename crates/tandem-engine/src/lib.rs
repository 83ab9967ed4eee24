//! tandem engine
//! =============
//! A realtime synthesis engine that keeps two worker processes rendering the
//! same module chain. The audio callback reads from whichever worker's
//! shared-memory ring is active; when that worker dies or stalls the
//! supervisor flips the callback to the standby ring, then tears down and
//! replaces the failed worker.

pub mod backend;
pub mod buffer;
pub mod callback;
pub mod command;
pub mod config;
pub mod control;
pub mod error;
pub mod host;
pub mod ipc;
pub mod launcher;
pub mod ledger;
pub mod metrics;
pub mod modules;
pub mod patch;
pub mod recording;
pub mod ring;
pub mod shm;
pub mod slot_control;
pub mod snapshot;
pub mod supervisor;
pub mod worker;

pub use backend::HeadlessDriver;
#[cfg(feature = "native")]
pub use backend::{start_output, OutputStream};
pub use buffer::{AudioBuffer, MAX_BUFFER_LEN};
pub use callback::{AudioCallback, CallbackFence};
pub use command::{Command, CommandKind, Ident, Opcode, PatchOp, Value};
pub use config::EngineConfig;
pub use control::ControlMessage;
pub use error::{ConfigError, EngineError, GraphError, ProtocolError, RingError, SnapshotError};
pub use host::ModuleHost;
pub use launcher::{SlotEvent, ThreadLauncher, WorkerLauncher, WorkerProcess};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use modules::{Module, ModuleKind};
pub use patch::{PatchBuilder, PatchPlan, PlannedModule};
pub use recording::{Recorder, RecordingTap};
pub use ring::{Overflow, RingDescriptor, SharedRing};
pub use snapshot::EngineSnapshot;
pub use supervisor::{
    EngineHealth, EngineStatus, MonitorHandle, SlotId, SlotState, SlotStatus, Supervisor,
};
pub use worker::{WorkerRuntime, WorkerSettings};

#[cfg(unix)]
pub use launcher::ProcessLauncher;

#[cfg(feature = "fuzzing")]
pub fn fuzz_control_boundary(data: &[u8]) {
    if let Ok(text) = std::str::from_utf8(data) {
        if let Ok(message) = ControlMessage::parse(text) {
            if let Ok(command) = message.to_command() {
                let _ = command.decode();
            }
        }
    }
}

#[cfg(feature = "fuzzing")]
pub fn fuzz_command_record(data: &[u8]) {
    if data.len() >= std::mem::size_of::<Command>() {
        let command: Command = bytemuck::pod_read_unaligned(&data[..std::mem::size_of::<Command>()]);
        let _ = command.decode();
    }
}
