//! Output device abstraction.
//!
//! The engine pushes fixed-size cycles of interleaved samples into an
//! `OutputDevice`. A full device reports backpressure instead of blocking;
//! the engine then parks in `wait_for_drain` until the device has consumed
//! audio. The default implementation feeds a cpal stream through an `rtrb`
//! ring buffer.
use crate::playback::track_buffer::OutputSpec;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rtrb::{Consumer, Producer, RingBuffer};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, trace};

/// Frames per engine cycle on the cpal device
const CYCLE_FRAMES: usize = 1024;
/// Ring capacity in cycles
const RING_CYCLES: usize = 4;

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Audio device not found")]
    DeviceNotFound,
    #[error("Stream config error: {0}")]
    StreamConfig(String),
    #[error("Stream build error: {0}")]
    StreamBuild(String),
    #[error("Stream play error: {0}")]
    StreamPlay(String),
    #[error("Audio device disconnected")]
    Disconnected,
}

/// Result of offering a cycle to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The whole cycle was queued
    Accepted,
    /// Nothing was queued; retry the same cycle after a drain
    Backpressure,
}

/// A started output stream.
///
/// Lives on the engine thread; it does not need to be `Send` (cpal streams
/// are not on every platform).
pub trait OutputDevice {
    fn spec(&self) -> OutputSpec;

    /// Interleaved samples the engine renders per cycle
    fn cycle_samples(&self) -> usize;

    /// Queue a whole cycle, or none of it
    fn write(&mut self, samples: &[f32]) -> Result<WriteOutcome, AudioError>;

    /// Block until the device has consumed some audio, or `timeout` passes
    fn wait_for_drain(&mut self, timeout: Duration);

    /// Samples written but not yet handed to the hardware
    fn queued_samples(&self) -> usize;
}

/// Opens output devices on demand
pub trait OutputFactory: Send {
    fn acquire(&mut self) -> Result<Box<dyn OutputDevice>, AudioError>;
}

/// Default output device through cpal
#[derive(Debug, Default)]
pub struct CpalOutputFactory;

impl OutputFactory for CpalOutputFactory {
    fn acquire(&mut self) -> Result<Box<dyn OutputDevice>, AudioError> {
        Ok(Box::new(CpalOutput::open()?))
    }
}

pub struct CpalOutput {
    _stream: cpal::Stream,
    producer: Producer<f32>,
    capacity: usize,
    spec: OutputSpec,
    failed: Arc<AtomicBool>,
}

impl CpalOutput {
    /// Open the default output device and start its stream.
    ///
    /// Must be called on the thread that will write to it: the stream's
    /// callback unparks the calling thread whenever it drains samples.
    pub fn open() -> Result<Self, AudioError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or(AudioError::DeviceNotFound)?;
        let default_config = device
            .default_output_config()
            .map_err(|e| AudioError::StreamConfig(e.to_string()))?;
        let stream_config = cpal::StreamConfig::from(default_config);
        let spec = OutputSpec::new(stream_config.channels, stream_config.sample_rate.0);
        info!(
            "Audio device: {} ({} channels, {} Hz)",
            device.name().unwrap_or_else(|_| "unknown".to_string()),
            spec.channels,
            spec.sample_rate
        );

        let capacity = CYCLE_FRAMES * spec.channels as usize * RING_CYCLES;
        let (producer, consumer) = RingBuffer::<f32>::new(capacity);
        let failed = Arc::new(AtomicBool::new(false));
        let failed_for_errors = failed.clone();
        let mut drain = DrainCallback {
            consumer,
            writer: std::thread::current(),
        };

        let stream = device
            .build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| drain.fill(data),
                move |err| {
                    error!("Audio stream error: {:?}", err);
                    failed_for_errors.store(true, Ordering::Relaxed);
                },
                None,
            )
            .map_err(|e| AudioError::StreamBuild(e.to_string()))?;
        stream
            .play()
            .map_err(|e| AudioError::StreamPlay(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            producer,
            capacity,
            spec,
            failed,
        })
    }
}

/// State owned by the real-time callback
struct DrainCallback {
    consumer: Consumer<f32>,
    writer: Thread,
}

impl DrainCallback {
    fn fill(&mut self, data: &mut [f32]) {
        let mut underrun = 0usize;
        for sample in data.iter_mut() {
            *sample = match self.consumer.pop() {
                Ok(value) => value,
                Err(_) => {
                    underrun += 1;
                    0.0
                }
            };
        }
        if underrun > 0 {
            trace!("Output underrun: {} samples of silence", underrun);
        }
        self.writer.unpark();
    }
}

impl OutputDevice for CpalOutput {
    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn cycle_samples(&self) -> usize {
        CYCLE_FRAMES * self.spec.channels as usize
    }

    fn write(&mut self, samples: &[f32]) -> Result<WriteOutcome, AudioError> {
        if self.failed.load(Ordering::Relaxed) {
            return Err(AudioError::Disconnected);
        }
        if self.producer.slots() < samples.len() {
            return Ok(WriteOutcome::Backpressure);
        }
        for &sample in samples {
            if self.producer.push(sample).is_err() {
                // Slots were checked above and only this side pushes
                return Err(AudioError::Disconnected);
            }
        }
        Ok(WriteOutcome::Accepted)
    }

    fn wait_for_drain(&mut self, timeout: Duration) {
        std::thread::park_timeout(timeout);
    }

    fn queued_samples(&self) -> usize {
        self.capacity - self.producer.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_callback_pads_underrun_and_unparks() {
        let (mut producer, consumer) = RingBuffer::<f32>::new(8);
        let mut drain = DrainCallback {
            consumer,
            writer: std::thread::current(),
        };
        producer.push(0.5).unwrap();
        producer.push(-0.5).unwrap();

        let mut data = [1.0f32; 4];
        drain.fill(&mut data);
        assert_eq!(data, [0.5, -0.5, 0.0, 0.0]);
        assert_eq!(producer.slots(), 8);

        // The unpark token is pending, so this returns immediately
        std::thread::park_timeout(Duration::from_secs(5));
    }
}
