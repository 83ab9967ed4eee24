use std::path::PathBuf;

use thiserror::Error;

/// Failures creating or attaching a shared-memory region.
#[derive(Debug, Error)]
pub enum RingError {
    #[error("io error on shared region {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("shared region {path:?} is {actual} bytes, expected at least {expected}")]
    TooSmall {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
    #[error("shared region {0:?} does not carry a tandem header")]
    BadMagic(PathBuf),
    #[error("slot size mismatch: region holds {region} byte slots, caller expects {expected}")]
    SlotSize { region: usize, expected: usize },
    #[error("ring capacity must be at least {min}, got {actual}")]
    Capacity { min: usize, actual: usize },
}

/// Protocol faults, rejected at the control boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("identifier {0:?} must match [a-z0-9_]{{1,16}}")]
    InvalidIdent(String),
    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),
    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),
    #[error("unknown patch operation {0:?}")]
    UnknownPatchOp(String),
    #[error("malformed address {0:?}")]
    MalformedAddress(String),
    #[error("address {address:?} expects {expected}")]
    BadArguments {
        address: String,
        expected: &'static str,
    },
    #[error("value for {param} is not finite")]
    NonFinite { param: String },
}

/// Graph faults, rejected when a patch is committed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("patch contains no modules")]
    EmptyPatch,
    #[error("module {0} declared twice")]
    DuplicateModule(String),
    #[error("module {0} does not exist")]
    UnknownModule(String),
    #[error("unknown module type {0:?}")]
    UnknownKind(String),
    #[error("patch has a cycle through module {module}")]
    Cycle { module: String },
    #[error("patch has {count} modules, the host holds at most {max}")]
    TooManyModules { count: usize, max: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("buffer_len must be between 1 and {max}, got {actual}")]
    BufferLen { max: usize, actual: usize },
    #[error("sample_rate must be positive")]
    SampleRate,
    #[error("cushion must be at least 2, got {0}")]
    Cushion(usize),
    #[error("ring_capacity {capacity} leaves no room beyond cushion {cushion} and prefill {prefill}")]
    RingCapacity {
        capacity: usize,
        cushion: usize,
        prefill: usize,
    },
    #[error("command_capacity {capacity} cannot hold the {needed} commands that seed a worker for this patch")]
    CommandCapacity { needed: usize, capacity: usize },
    #[error("{field} must be non-zero")]
    Zero { field: &'static str },
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("io error on snapshot: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("snapshot version {found} is not supported (expected {expected})")]
    Version { found: u32, expected: u32 },
    #[error("snapshot patch is invalid: {0}")]
    Graph(#[from] GraphError),
}

/// Process and fatal faults surfaced by the supervisor.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("failed to spawn worker for slot {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("slot {slot} did not finish priming within {timeout_ms} ms")]
    PrimingTimeout { slot: usize, timeout_ms: u64 },
    #[error("no slot is able to produce audio")]
    Fatal,
    #[error("a patch commit is already in progress")]
    CommitInProgress,
    #[error("engine has not been started")]
    NotStarted,
}
