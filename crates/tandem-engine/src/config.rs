use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::buffer::MAX_BUFFER_LEN;
use crate::error::ConfigError;

pub const WORKER_BIN_ENV: &str = "TANDEM_WORKER_BIN";
pub const WORKER_BIN_NAME: &str = "tandem-worker";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: f32,
    pub buffer_len: usize,
    /// Slots in each worker's audio ring.
    pub ring_capacity: usize,
    /// Slots in each worker's command ring and in the host command queue.
    pub command_capacity: usize,
    /// Consumed buffers the callback keeps out of the producer's reach.
    pub cushion: usize,
    /// Buffers a worker writes before reporting ready.
    pub prefill: usize,
    pub priming_buffers: usize,
    pub priming_timeout_ms: u64,
    pub heartbeat_timeout_ms: u64,
    /// Busy-wait tail before each worker deadline.
    pub spin_us: u64,
    pub max_spawn_attempts: u32,
    pub gain_smoothing_ms: f32,
    pub filter_smoothing_ms: f32,
    pub worker_executable: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000.0,
            buffer_len: 256,
            ring_capacity: 16,
            command_capacity: 256,
            cushion: 2,
            prefill: 4,
            priming_buffers: 8,
            priming_timeout_ms: 2_000,
            heartbeat_timeout_ms: 50,
            spin_us: 300,
            max_spawn_attempts: 3,
            gain_smoothing_ms: 5.0,
            filter_smoothing_ms: 30.0,
            worker_executable: std::env::var_os(WORKER_BIN_ENV).map(PathBuf::from),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse engine config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(ConfigError::SampleRate);
        }
        if self.buffer_len == 0 || self.buffer_len > MAX_BUFFER_LEN {
            return Err(ConfigError::BufferLen {
                max: MAX_BUFFER_LEN,
                actual: self.buffer_len,
            });
        }
        if self.cushion < 2 {
            return Err(ConfigError::Cushion(self.cushion));
        }
        if self.prefill == 0 {
            return Err(ConfigError::Zero { field: "prefill" });
        }
        if self.ring_capacity <= self.cushion + self.prefill {
            return Err(ConfigError::RingCapacity {
                capacity: self.ring_capacity,
                cushion: self.cushion,
                prefill: self.prefill,
            });
        }
        for (field, value) in [
            ("command_capacity", self.command_capacity as u64),
            ("priming_buffers", self.priming_buffers as u64),
            ("priming_timeout_ms", self.priming_timeout_ms),
            ("heartbeat_timeout_ms", self.heartbeat_timeout_ms),
            ("max_spawn_attempts", self.max_spawn_attempts as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        Ok(())
    }

    /// Wall-clock length of one buffer.
    pub fn buffer_period(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_len as f64 / self.sample_rate as f64)
    }

    pub fn priming_timeout(&self) -> Duration {
        Duration::from_millis(self.priming_timeout_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Locates the worker binary: explicit setting, then a `tandem-worker`
    /// next to the running executable (or one directory up, for test
    /// binaries living in `deps/`).
    pub fn resolve_worker_executable(&self) -> Option<PathBuf> {
        if let Some(path) = &self.worker_executable {
            return Some(path.clone());
        }
        let exe = std::env::current_exe().ok()?;
        let file_name = format!("{WORKER_BIN_NAME}{}", std::env::consts::EXE_SUFFIX);
        let mut dir = exe.parent();
        for _ in 0..2 {
            let candidate = dir?.join(&file_name);
            if candidate.is_file() {
                return Some(candidate);
            }
            dir = dir?.parent();
        }
        None
    }
}
