use bytemuck::{Pod, Zeroable};

/// Largest block the engine renders in one chain pass.
pub const MAX_BUFFER_LEN: usize = 512;

/// One mono audio block as it travels through a shared ring.
///
/// The record is plain old data so it can be copied in and out of a mapped
/// region; only `samples[..frames]` carries audio.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct AudioBuffer {
    /// Per-worker render counter, wraps.
    pub sequence: u32,
    pub frames: u32,
    pub samples: [f32; MAX_BUFFER_LEN],
}

impl Default for AudioBuffer {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl std::fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("sequence", &self.sequence)
            .field("frames", &self.frames)
            .finish_non_exhaustive()
    }
}

impl AudioBuffer {
    pub fn silent(frames: usize) -> Self {
        let mut buffer = Self::zeroed();
        buffer.frames = frames.min(MAX_BUFFER_LEN) as u32;
        buffer
    }

    #[inline]
    pub fn len(&self) -> usize {
        (self.frames as usize).min(MAX_BUFFER_LEN)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.frames == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.samples[..self.len()]
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        let len = self.len();
        &mut self.samples[..len]
    }

    pub fn copy_from(&mut self, samples: &[f32]) {
        let len = samples.len().min(MAX_BUFFER_LEN);
        self.samples[..len].copy_from_slice(&samples[..len]);
        self.frames = len as u32;
    }
}
