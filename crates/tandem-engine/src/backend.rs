//! Drivers that invoke [`AudioCallback::render`] on a period: a cpal output
//! stream, or a plain thread when no device is wanted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};

use crate::callback::AudioCallback;

/// Interleaved samples converted per chunk when the device format is not f32.
#[cfg(feature = "native")]
const CONVERT_CHUNK: usize = 4096;

/// A running device stream. Dropping it stops playback.
#[cfg(feature = "native")]
pub struct OutputStream {
    _stream: cpal::Stream,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Opens the default output device and drives `callback` from its stream.
#[cfg(feature = "native")]
pub fn start_output(
    callback: AudioCallback,
    sample_rate: f32,
    buffer_len: usize,
) -> anyhow::Result<OutputStream> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, SampleFormat, StreamConfig};

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("failed to acquire default output device")?;
    let sample_rate = sample_rate.round().clamp(1.0, u32::MAX as f32) as u32;
    let supported = choose_stream_config(&device, sample_rate)?;
    let mut stream_config: StreamConfig = supported.config();
    if stream_config.sample_rate.0 != sample_rate {
        tracing::warn!(
            device_rate = stream_config.sample_rate.0,
            engine_rate = sample_rate,
            "device sample rate differs from engine configuration"
        );
    }
    let frames = u32::try_from(buffer_len.max(1)).unwrap_or(u32::MAX);
    stream_config.buffer_size = BufferSize::Fixed(frames);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => build_output_stream::<f32>(&device, &stream_config, callback),
        SampleFormat::I16 => build_output_stream::<i16>(&device, &stream_config, callback),
        SampleFormat::U16 => build_output_stream::<u16>(&device, &stream_config, callback),
        other => Err(anyhow!("unsupported sample format: {other:?}")),
    }?;
    stream.play().context("failed to start output stream")?;
    tracing::info!(
        sample_rate = stream_config.sample_rate.0,
        channels = stream_config.channels,
        "output stream started"
    );
    Ok(OutputStream {
        sample_rate: stream_config.sample_rate.0,
        channels: stream_config.channels as usize,
        _stream: stream,
    })
}

#[cfg(feature = "native")]
fn build_output_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut callback: AudioCallback,
) -> anyhow::Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32> + Send + 'static,
{
    use cpal::traits::DeviceTrait;

    let channels = config.channels as usize;
    let stride = channels.max(1);
    let mut scratch = vec![0.0f32; (CONVERT_CHUNK / stride).max(1) * stride];
    let stream = device.build_output_stream(
        config,
        move |output: &mut [T], _info| {
            tandem_dsp::utils::flush_denormals();
            for chunk in output.chunks_mut(scratch.len()) {
                let scratch = &mut scratch[..chunk.len()];
                callback.render(scratch, channels);
                for (sample, value) in chunk.iter_mut().zip(scratch.iter()) {
                    *sample = T::from_sample(*value);
                }
            }
        },
        move |err| {
            tracing::error!(?err, "cpal output stream error");
        },
        None,
    )?;
    Ok(stream)
}

#[cfg(feature = "native")]
fn choose_stream_config(
    device: &cpal::Device,
    sample_rate: u32,
) -> anyhow::Result<cpal::SupportedStreamConfig> {
    use cpal::traits::DeviceTrait;
    use cpal::{SampleFormat, SampleRate};

    let desired_rate = SampleRate(sample_rate.max(1));
    if let Ok(configs) = device.supported_output_configs() {
        for range in configs {
            if range.sample_format() == SampleFormat::F32
                && range.min_sample_rate() <= desired_rate
                && desired_rate <= range.max_sample_rate()
            {
                return Ok(range.with_sample_rate(desired_rate));
            }
        }
    }
    if let Ok(configs) = device.supported_output_configs() {
        for range in configs {
            if range.min_sample_rate() <= desired_rate && desired_rate <= range.max_sample_rate() {
                return Ok(range.with_sample_rate(desired_rate));
            }
        }
    }
    device
        .default_output_config()
        .context("failed to fetch default output config")
}

/// Calls the audio callback from a thread at the device period, for runs
/// without an audio device. Output is discarded; recording still works.
pub struct HeadlessDriver {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<AudioCallback>>,
}

impl HeadlessDriver {
    pub fn spawn(
        mut callback: AudioCallback,
        sample_rate: f32,
        frames: usize,
        channels: usize,
    ) -> anyhow::Result<Self> {
        let frames = frames.max(1);
        let channels = channels.max(1);
        let period = Duration::from_secs_f64(frames as f64 / f64::from(sample_rate.max(1.0)));
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("tandem-headless-output".into())
            .spawn(move || {
                let _denormals = tandem_dsp::utils::NoDenormalsGuard::new();
                tandem_dsp::utils::flush_denormals();
                let mut out = vec![0.0f32; frames * channels];
                let mut deadline = Instant::now();
                while flag.load(Ordering::Relaxed) {
                    callback.render(&mut out, channels);
                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else {
                        deadline = now;
                    }
                }
                callback
            })
            .context("failed to spawn headless output thread")?;
        Ok(Self {
            running,
            thread: Some(thread),
        })
    }

    /// Stops the driver and hands the callback back.
    pub fn stop(mut self) -> anyhow::Result<AudioCallback> {
        self.running.store(false, Ordering::Relaxed);
        let thread = self
            .thread
            .take()
            .ok_or_else(|| anyhow!("headless driver already stopped"))?;
        thread
            .join()
            .map_err(|_| anyhow!("headless output thread panicked"))
    }
}

impl Drop for HeadlessDriver {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("failed to join headless output thread");
            }
        }
    }
}
