//! Ingestion for one track.
//!
//! An `AudioSource` keeps decoder windows running until every segment of the
//! track buffer is loaded. Gaps are filled from a starting segment forward,
//! wrapping to the start of the track; a seek simply restarts the gap fill
//! from the seek target, leaving loaded segments alone.
use crate::config::Config;
use crate::playback::decoder_process::{
    DecodeEvent, DecodeExit, DecodeHandle, DecodeInput, DecodeWindow, DecoderProcess,
};
use crate::playback::flac_prefetch::RemoteFlac;
use crate::playback::progress::PlaybackProgress;
use crate::playback::track_buffer::{SegmentMap, SharedTrackBuffer};
use crate::playback::waveform::WaveformBuilder;
use crate::playback::PlaybackError;
use crate::retry::backoff_delay;
use sluice_common::SourceType;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// A window ending this close to the track end counts as reaching it
const END_TOLERANCE_SECS: f64 = 0.05;

/// How a source's decoder input is obtained
pub enum SourceKind {
    Local { path: PathBuf },
    RemoteFlac { remote: Arc<RemoteFlac> },
}

impl SourceKind {
    pub fn source_type(&self) -> SourceType {
        match self {
            SourceKind::Local { .. } => SourceType::Local,
            SourceKind::RemoteFlac { .. } => SourceType::Remote,
        }
    }

    /// Start a decoder for `window` writing into `buffer`
    pub async fn spawn_decode_window(
        &self,
        window: DecodeWindow,
        decoder: &DecoderProcess,
        buffer: SharedTrackBuffer,
    ) -> Result<DecodeHandle, PlaybackError> {
        let input = match self {
            SourceKind::Local { path } => DecodeInput::File(path.clone()),
            SourceKind::RemoteFlac { remote } => remote.fetch_window(&window).await?,
        };
        decoder.spawn(window, input, buffer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Filling,
    FullyLoaded,
    Cancelled,
}

enum SourceCommand {
    Seek(f64),
    Cancel,
}

/// Next gap to decode at or after `from`, wrapping to the start:
/// `[first unloaded, next loaded or end)`.
pub fn next_gap(segments: &SegmentMap, from: usize) -> Option<(usize, usize)> {
    let from = from.min(segments.len().saturating_sub(1));
    let start = segments
        .first_unloaded_from(from)
        .or_else(|| segments.first_unloaded_from(0))?;
    Some((start, segments.next_loaded_from(start + 1)))
}

/// Whether a running decode over `[active_start, active_end)` should be
/// replaced to reach segment `target` sooner.
pub fn should_restart(
    active_start: usize,
    active_end: usize,
    target: usize,
    previous_loaded: bool,
) -> bool {
    target <= active_start || target >= active_end || !previous_loaded
}

/// Control handle for a running `AudioSource`
pub struct AudioSourceHandle {
    commands: mpsc::UnboundedSender<SourceCommand>,
    state: watch::Receiver<SourceState>,
    task: Option<JoinHandle<()>>,
    waveform: Option<JoinHandle<()>>,
}

impl AudioSourceHandle {
    pub fn seek(&self, secs: f64) {
        let _ = self.commands.send(SourceCommand::Seek(secs));
    }

    pub fn state(&self) -> SourceState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SourceState> {
        self.state.clone()
    }

    /// Stop all decoding and wait until no process of this source is alive.
    /// Safe to call more than once.
    pub async fn cancel(&mut self) {
        if let Some(waveform) = self.waveform.take() {
            waveform.abort();
            let _ = waveform.await;
        }
        let _ = self.commands.send(SourceCommand::Cancel);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!("Audio source task failed: {}", e);
            }
        }
    }
}

impl Drop for AudioSourceHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(waveform) = self.waveform.take() {
            waveform.abort();
        }
    }
}

/// Gap-fill state machine for one track
pub struct AudioSource {
    track: String,
    kind: SourceKind,
    buffer: SharedTrackBuffer,
    decoder: DecoderProcess,
    progress_tx: mpsc::UnboundedSender<PlaybackProgress>,
    state_tx: watch::Sender<SourceState>,
    active: Option<DecodeHandle>,
    loaded_at_spawn: usize,
    failures: u32,
    max_retries: u32,
    retry_at: Option<(Instant, usize)>,
    report_interval: Duration,
    last_reported: Vec<u8>,
}

impl AudioSource {
    /// Start filling `buffer` in the background.
    pub fn start(
        track: String,
        kind: SourceKind,
        buffer: SharedTrackBuffer,
        config: &Config,
        progress_tx: mpsc::UnboundedSender<PlaybackProgress>,
    ) -> AudioSourceHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SourceState::Idle);

        let waveform = match &kind {
            SourceKind::Local { path } => {
                let builder = WaveformBuilder::new(
                    config.decoder_path.clone(),
                    config.cache_dir.clone(),
                    config.waveform_points,
                );
                let path = path.clone();
                let track = track.clone();
                let progress_tx = progress_tx.clone();
                Some(tokio::spawn(async move {
                    match builder.load_or_compute(&path).await {
                        Ok(peaks) => {
                            let _ = progress_tx.send(PlaybackProgress::Waveform { track, peaks });
                        }
                        Err(e) => warn!("Waveform for {} unavailable: {}", path.display(), e),
                    }
                }))
            }
            SourceKind::RemoteFlac { .. } => None,
        };

        let source = AudioSource {
            track,
            kind,
            buffer,
            decoder: DecoderProcess::new(config.decoder_path.clone()),
            progress_tx,
            state_tx,
            active: None,
            loaded_at_spawn: 0,
            failures: 0,
            max_retries: config.max_decode_retries,
            retry_at: None,
            report_interval: config.report_interval,
            last_reported: Vec::new(),
        };
        let task = tokio::spawn(source.run(commands_rx));

        AudioSourceHandle {
            commands: commands_tx,
            state: state_rx,
            task: Some(task),
            waveform,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SourceCommand>) {
        info!(
            "Loading {} ({:?}, {} segments)",
            self.track,
            self.kind.source_type(),
            self.buffer.segments.len()
        );
        self.set_state(SourceState::Filling);
        self.fill_missing_segments(0).await;

        let mut report = tokio::time::interval(self.report_interval);
        report.set_missed_tick_behavior(MissedTickBehavior::Skip);

        while *self.state_tx.borrow() == SourceState::Filling {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SourceCommand::Seek(secs)) => self.seek(secs).await,
                    Some(SourceCommand::Cancel) | None => {
                        self.cancel().await;
                        return;
                    }
                },
                event = active_event(&mut self.active) => match event {
                    DecodeEvent::Chunk(chunk) => {
                        trace!("{}: decoded up to frame {}", self.track, chunk.frames_end);
                    }
                    DecodeEvent::Exit(exit) => {
                        if let Some(handle) = self.active.take() {
                            self.on_window_exit(handle.window(), exit).await;
                        }
                    }
                },
                from = retry_due(self.retry_at) => {
                    self.retry_at = None;
                    self.fill_missing_segments(from).await;
                }
                _ = report.tick() => self.report_progress(false),
            }
        }
        self.report_progress(true);
    }

    fn set_state(&self, state: SourceState) {
        self.state_tx.send_replace(state);
    }

    fn loaded_count(&self) -> usize {
        self.buffer
            .segments
            .progress()
            .iter()
            .filter(|&&flag| flag == 1)
            .count()
    }

    fn report_progress(&mut self, force: bool) {
        let progress = self.buffer.segments.progress();
        if force || progress != self.last_reported {
            let _ = self.progress_tx.send(PlaybackProgress::LoadProgress {
                segment_progress: progress.clone(),
            });
            self.last_reported = progress;
        }
    }

    /// Decode the first gap at or after `from`, replacing the running decode
    /// only when it would not reach that gap promptly.
    async fn fill_missing_segments(&mut self, from: usize) {
        let Some((start, end)) = next_gap(&self.buffer.segments, from) else {
            self.finish_loading().await;
            return;
        };

        if let Some(active) = &self.active {
            let window = active.window();
            let segment_secs = self.buffer.segment_duration_secs();
            let active_start = self.buffer.segment_at_secs(window.start_secs);
            let active_end = (window.end_secs / segment_secs).ceil() as usize;
            let previous_loaded = start == 0 || self.buffer.segments.is_loaded(start - 1);
            if !should_restart(active_start, active_end, start, previous_loaded) {
                trace!(
                    "Running decode {}-{} will reach segment {}",
                    active_start,
                    active_end,
                    start
                );
                return;
            }
            self.stop_active().await;
        }

        self.retry_at = None;
        let window = DecodeWindow::new(
            self.buffer.segment_start_secs(start),
            self.buffer
                .segment_start_secs(end)
                .min(self.buffer.duration_secs()),
        );
        self.spawn_window(window).await;
    }

    async fn spawn_window(&mut self, window: DecodeWindow) {
        self.loaded_at_spawn = self.loaded_count();
        debug!(
            "{}: decoding {:.3}s-{:.3}s",
            self.track, window.start_secs, window.end_secs
        );
        match self
            .kind
            .spawn_decode_window(window, &self.decoder, self.buffer.clone())
            .await
        {
            Ok(handle) => self.active = Some(handle),
            Err(e) => {
                warn!("{}: could not start decode window: {}", self.track, e);
                self.register_failure(window);
            }
        }
    }

    async fn on_window_exit(&mut self, window: DecodeWindow, exit: DecodeExit) {
        match &exit {
            DecodeExit::Stopped => return,
            DecodeExit::Finished {
                frames_end,
                success,
            } => debug!(
                "{}: window {:.3}s-{:.3}s ended at frame {} (clean: {})",
                self.track, window.start_secs, window.end_secs, frames_end, success
            ),
            DecodeExit::Failed(message) => {
                warn!("{}: decode window failed: {}", self.track, message)
            }
        }

        if exit.is_clean()
            && window.end_secs >= self.buffer.duration_secs() - END_TOLERANCE_SECS
        {
            // Rounding can leave the last few frames unwritten
            self.buffer
                .segments
                .mark_segment(self.buffer.segments.len() - 1);
        }

        if self.loaded_count() > self.loaded_at_spawn {
            self.failures = 0;
            let next = self.buffer.segment_at_secs(window.end_secs);
            self.fill_missing_segments(next).await;
        } else {
            self.register_failure(window);
        }
    }

    fn register_failure(&mut self, window: DecodeWindow) {
        self.failures += 1;
        if self.failures > self.max_retries {
            error!(
                "{}: giving up on {:.3}s-{:.3}s after {} fruitless attempts",
                self.track, window.start_secs, window.end_secs, self.failures
            );
            return;
        }
        let delay = backoff_delay(self.failures);
        debug!("{}: retrying in {:?}", self.track, delay);
        self.retry_at = Some((
            Instant::now() + delay,
            self.buffer.segment_at_secs(window.start_secs),
        ));
    }

    /// Restart the gap fill from `secs`. Loaded segments are kept.
    async fn seek(&mut self, secs: f64) {
        let segment = self.buffer.segment_at_secs(secs);
        debug!("{}: seek to {:.3}s (segment {})", self.track, secs, segment);
        self.failures = 0;
        self.fill_missing_segments(segment).await;
    }

    async fn stop_active(&mut self) {
        if let Some(handle) = self.active.take() {
            let window = handle.window();
            let exit = handle.stop().await;
            trace!(
                "{}: stopped window {:.3}s-{:.3}s ({:?})",
                self.track,
                window.start_secs,
                window.end_secs,
                exit
            );
        }
    }

    async fn finish_loading(&mut self) {
        self.stop_active().await;
        self.retry_at = None;
        info!("{}: fully loaded", self.track);
        self.set_state(SourceState::FullyLoaded);
    }

    async fn cancel(&mut self) {
        self.stop_active().await;
        self.retry_at = None;
        debug!("{}: cancelled", self.track);
        self.set_state(SourceState::Cancelled);
    }
}

async fn active_event(active: &mut Option<DecodeHandle>) -> DecodeEvent {
    match active {
        Some(handle) => handle.next_event().await,
        None => std::future::pending().await,
    }
}

async fn retry_due(retry_at: Option<(Instant, usize)>) -> usize {
    match retry_at {
        Some((at, from)) => {
            tokio::time::sleep_until(at).await;
            from
        }
        None => std::future::pending().await,
    }
}
