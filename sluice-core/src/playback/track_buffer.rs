//! Shared decoded-track arena.
//!
//! `TrackBuffer` pairs a `SampleBuffer` holding the whole track's device-rate
//! PCM with a `SegmentMap` recording which fixed-duration segments have been
//! written. Both are plain arrays of atomics so the decoder side and the
//! real-time engine can share them without locks:
//! - writers copy samples first, then `mark_range` (release store)
//! - the reader checks the segment flags (acquire load) before touching samples

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::warn;

const UNLOADED: u8 = 0;
const LOADED: u8 = 1;

/// Channel count and sample rate of the output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSpec {
    pub channels: u16,
    pub sample_rate: u32,
}

impl OutputSpec {
    pub fn new(channels: u16, sample_rate: u32) -> Self {
        Self {
            channels,
            sample_rate,
        }
    }

    /// Interleaved samples per second
    pub fn samples_per_second(&self) -> f64 {
        self.sample_rate as f64 * self.channels as f64
    }
}

/// One readiness flag per segment. Flags only ever go from 0 to 1.
pub struct SegmentMap {
    segments: Box<[AtomicU8]>,
    frames_per_segment: u64,
}

impl SegmentMap {
    pub fn new(segment_count: usize, frames_per_segment: u64) -> Self {
        Self {
            segments: (0..segment_count.max(1))
                .map(|_| AtomicU8::new(UNLOADED))
                .collect(),
            frames_per_segment: frames_per_segment.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn frames_per_segment(&self) -> u64 {
        self.frames_per_segment
    }

    /// Segment containing `frame`, clamped to the last segment.
    pub fn segment_of_frame(&self, frame: u64) -> usize {
        ((frame / self.frames_per_segment) as usize).min(self.segments.len() - 1)
    }

    pub fn segment_start_frame(&self, segment: usize) -> u64 {
        segment as u64 * self.frames_per_segment
    }

    /// Mark every segment intersecting `[start_frame, end_frame)` as loaded.
    pub fn mark_range(&self, start_frame: u64, end_frame: u64) {
        if end_frame <= start_frame {
            return;
        }
        let first = self.segment_of_frame(start_frame);
        let last = self.segment_of_frame(end_frame - 1);
        for flag in &self.segments[first..=last] {
            flag.store(LOADED, Ordering::Release);
        }
    }

    /// Mark a single segment loaded (used for the end-of-track guard).
    pub fn mark_segment(&self, segment: usize) {
        if let Some(flag) = self.segments.get(segment) {
            flag.store(LOADED, Ordering::Release);
        }
    }

    pub fn is_loaded(&self, segment: usize) -> bool {
        self.segments
            .get(segment)
            .map(|flag| flag.load(Ordering::Acquire) == LOADED)
            .unwrap_or(false)
    }

    /// Whether every segment covering `[start_frame, end_frame)` is loaded.
    pub fn is_range_loaded(&self, start_frame: u64, end_frame: u64) -> bool {
        if end_frame <= start_frame {
            return true;
        }
        let first = self.segment_of_frame(start_frame);
        let last = self.segment_of_frame(end_frame - 1);
        (first..=last).all(|segment| self.is_loaded(segment))
    }

    /// Full scan. Not for the real-time path.
    pub fn all_loaded(&self) -> bool {
        self.segments
            .iter()
            .all(|flag| flag.load(Ordering::Acquire) == LOADED)
    }

    /// Snapshot of every flag for progress reporting.
    pub fn progress(&self) -> Vec<u8> {
        self.segments
            .iter()
            .map(|flag| flag.load(Ordering::Acquire))
            .collect()
    }

    /// First unloaded segment at or after `from`.
    pub fn first_unloaded_from(&self, from: usize) -> Option<usize> {
        (from..self.segments.len()).find(|&segment| !self.is_loaded(segment))
    }

    /// First loaded segment at or after `from`, or `len()` if none.
    pub fn next_loaded_from(&self, from: usize) -> usize {
        (from..self.segments.len())
            .find(|&segment| self.is_loaded(segment))
            .unwrap_or(self.segments.len())
    }
}

/// Flat interleaved f32 samples stored as bit patterns in atomics.
pub struct SampleBuffer {
    samples: Box<[AtomicU32]>,
    overflow_logged: AtomicBool,
}

impl SampleBuffer {
    pub fn new(len: usize) -> Self {
        Self {
            samples: (0..len).map(|_| AtomicU32::new(0)).collect(),
            overflow_logged: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Write samples starting at `offset`, returning how many landed.
    ///
    /// Anything past the end is dropped; the first overflow is logged.
    pub fn write_at(&self, offset: usize, data: &[f32]) -> usize {
        let available = self.samples.len().saturating_sub(offset);
        let count = data.len().min(available);
        if count < data.len() && !self.overflow_logged.swap(true, Ordering::Relaxed) {
            warn!(
                "Sample buffer overflow: dropping {} samples at offset {} (capacity {})",
                data.len() - count,
                offset,
                self.samples.len()
            );
        }
        for (slot, sample) in self.samples[offset.min(self.samples.len())..]
            .iter()
            .zip(&data[..count])
        {
            slot.store(sample.to_bits(), Ordering::Relaxed);
        }
        count
    }

    /// Copy samples starting at `offset` into `out`, returning how many were copied.
    pub fn read_into(&self, offset: usize, out: &mut [f32]) -> usize {
        let available = self.samples.len().saturating_sub(offset);
        let count = out.len().min(available);
        for (dst, slot) in out[..count]
            .iter_mut()
            .zip(&self.samples[offset.min(self.samples.len())..])
        {
            *dst = f32::from_bits(slot.load(Ordering::Relaxed));
        }
        count
    }
}

/// Decoded track arena shared by the ingestion side and the playback engine.
pub struct TrackBuffer {
    pub samples: SampleBuffer,
    pub segments: SegmentMap,
    spec: OutputSpec,
    duration_secs: f64,
    segment_duration_secs: f64,
}

impl TrackBuffer {
    /// Size the arena for `duration_secs` of audio at the device's format.
    pub fn new(duration_secs: f64, spec: OutputSpec, segment_duration_secs: f64) -> Self {
        let duration_secs = duration_secs.max(0.0);
        let total_frames = (duration_secs * spec.sample_rate as f64).ceil() as usize;
        let segment_count = (duration_secs / segment_duration_secs).ceil().max(1.0) as usize;
        let frames_per_segment = (segment_duration_secs * spec.sample_rate as f64).round() as u64;
        Self {
            samples: SampleBuffer::new(total_frames * spec.channels as usize),
            segments: SegmentMap::new(segment_count, frames_per_segment),
            spec,
            duration_secs,
            segment_duration_secs,
        }
    }

    pub fn spec(&self) -> OutputSpec {
        self.spec
    }

    pub fn channels(&self) -> usize {
        self.spec.channels as usize
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn segment_duration_secs(&self) -> f64 {
        self.segment_duration_secs
    }

    pub fn total_frames(&self) -> u64 {
        (self.samples.len() / self.channels().max(1)) as u64
    }

    /// Start time of a segment in seconds
    pub fn segment_start_secs(&self, segment: usize) -> f64 {
        segment as f64 * self.segment_duration_secs
    }

    /// Segment index for a time, clamped to the track.
    pub fn segment_at_secs(&self, secs: f64) -> usize {
        let segment = (secs.max(0.0) / self.segment_duration_secs).floor() as usize;
        segment.min(self.segments.len() - 1)
    }

    /// Whether every segment covering the interleaved sample range is loaded.
    pub fn is_sample_range_loaded(&self, start_sample: usize, end_sample: usize) -> bool {
        let channels = self.channels().max(1);
        let start_frame = (start_sample / channels) as u64;
        let end_frame = end_sample.div_ceil(channels) as u64;
        self.segments.is_range_loaded(start_frame, end_frame)
    }
}

/// Track buffer shared across the decoder and audio threads.
pub type SharedTrackBuffer = Arc<TrackBuffer>;

pub fn create_track_buffer(
    duration_secs: f64,
    spec: OutputSpec,
    segment_duration_secs: f64,
) -> SharedTrackBuffer {
    Arc::new(TrackBuffer::new(duration_secs, spec, segment_duration_secs))
}
