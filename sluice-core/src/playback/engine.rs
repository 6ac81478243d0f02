//! Real-time playback engine.
//!
//! `Renderer` holds the transport state: the current session, fade envelope,
//! volume and the wall-clock anchored playhead. It fills one device cycle at
//! a time, only ever reading segments the ingestion side has marked ready.
//!
//! `PlaybackEngine` owns the output device on a dedicated thread. It drains
//! commands without blocking, renders a cycle, and offers it to the device;
//! on backpressure it parks until the device drains and retries the same
//! cycle, so nothing is skipped or duplicated.
use crate::config::Config;
use crate::playback::output::{AudioError, OutputDevice, OutputFactory, WriteOutcome};
use crate::playback::progress::{PlaybackProgress, StateSnapshot};
use crate::playback::track_buffer::{OutputSpec, SharedTrackBuffer};
use crate::playback::PlaybackError;
use sluice_common::PlaybackState;
use std::f32::consts::PI;
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc as tokio_mpsc, oneshot};
use tracing::{debug, error, info, trace, warn};

/// Gain at full slider
pub const MAX_DB: f32 = 0.0;

/// Map a `[0, 1]` volume slider onto a dB scale and return linear amplitude.
///
/// Slider 0 is `min_db`, not silence.
pub fn slider_to_amplitude(slider: f32, min_db: f32) -> f32 {
    let slider = slider.clamp(0.0, 1.0);
    let db = min_db + (MAX_DB - min_db) * slider;
    10.0_f32.powf(db / 20.0)
}

/// Commands processed on the engine thread
pub enum EngineCommand {
    /// Make sure an output device is open and report its format
    AcquireDevice {
        reply: oneshot::Sender<Result<OutputSpec, PlaybackError>>,
    },
    /// Start playing a new track buffer
    Load {
        track: String,
        buffer: SharedTrackBuffer,
        start_secs: f64,
    },
    /// Stop referencing the current buffer
    Unload,
    Seek(f64),
    /// Slider position in `[0, 1]`
    SetVolume(f32),
    PauseOrResume,
    SetFocus(bool),
    Shutdown,
}

#[derive(Debug, Clone, Copy)]
struct Fade {
    from: f32,
    to: f32,
    total_frames: u64,
    progress_frames: u64,
}

impl Fade {
    fn new(from: f32, to: f32, total_frames: u64) -> Self {
        Self {
            from,
            to,
            total_frames,
            progress_frames: 0,
        }
    }

    /// Cosine-shaped envelope level at the current position
    fn level(&self) -> f32 {
        if self.total_frames == 0 {
            return self.to;
        }
        let t = (self.progress_frames as f32 / self.total_frames as f32).min(1.0);
        let shaped = (1.0 - (PI * t).cos()) / 2.0;
        self.from + (self.to - self.from) * shaped
    }

    fn advance(&mut self) -> f32 {
        let level = self.level();
        self.progress_frames = (self.progress_frames + 1).min(self.total_frames);
        level
    }

    fn is_done(&self) -> bool {
        self.progress_frames >= self.total_frames
    }
}

/// Playback position reconstructed from an anchor plus elapsed wall time
#[derive(Debug, Clone, Copy)]
struct Playhead {
    anchor_samples: f64,
    anchored_at: Instant,
    running: bool,
}

impl Playhead {
    fn new(now: Instant) -> Self {
        Self {
            anchor_samples: 0.0,
            anchored_at: now,
            running: false,
        }
    }

    fn freeze(&mut self, samples: f64, now: Instant) {
        self.anchor_samples = samples;
        self.anchored_at = now;
        self.running = false;
    }

    fn run_from(&mut self, samples: f64, now: Instant) {
        self.anchor_samples = samples;
        self.anchored_at = now;
        self.running = true;
    }

    fn position(&self, now: Instant, samples_per_second: f64) -> f64 {
        if self.running {
            let elapsed = now.saturating_duration_since(self.anchored_at).as_secs_f64();
            self.anchor_samples + elapsed * samples_per_second
        } else {
            self.anchor_samples
        }
    }
}

struct Session {
    track: String,
    buffer: SharedTrackBuffer,
    read_offset: usize,
    ended: bool,
}

impl Session {
    /// Frame-aligned sample offset for a time, clamped to the buffer
    fn offset_for(&self, secs: f64) -> usize {
        let spec = self.buffer.spec();
        let frame = (secs.max(0.0) * spec.sample_rate as f64).floor() as u64;
        let frame = frame.min(self.buffer.total_frames());
        frame as usize * spec.channels as usize
    }
}

/// Transport state and per-cycle rendering
pub struct Renderer {
    session: Option<Session>,
    state: PlaybackState,
    fade: Option<Fade>,
    amplitude: f32,
    min_db: f32,
    fade_duration: Duration,
    waiting: bool,
    playhead: Playhead,
    state_changed: bool,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
}

impl Renderer {
    pub fn new(
        config: &Config,
        progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
        now: Instant,
    ) -> Self {
        Self {
            session: None,
            state: PlaybackState::Paused,
            fade: None,
            amplitude: 1.0,
            min_db: config.min_db,
            fade_duration: config.fade_duration,
            waiting: false,
            playhead: Playhead::new(now),
            state_changed: false,
            progress_tx,
        }
    }

    pub fn state(&self) -> PlaybackState {
        self.state
    }

    pub fn is_waiting_for_data(&self) -> bool {
        self.waiting
    }

    pub fn amplitude(&self) -> f32 {
        self.amplitude
    }

    /// Read position in interleaved samples
    pub fn read_offset(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.read_offset)
    }

    pub fn has_ended(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.ended)
    }

    /// Whether a state report is owed since the last call
    pub fn take_state_changed(&mut self) -> bool {
        std::mem::take(&mut self.state_changed)
    }

    fn samples_per_second(&self) -> f64 {
        self.session
            .as_ref()
            .map(|s| s.buffer.spec().samples_per_second())
            .unwrap_or(0.0)
    }

    pub fn load(&mut self, track: String, buffer: SharedTrackBuffer, start_secs: f64, now: Instant) {
        let mut session = Session {
            track,
            buffer,
            read_offset: 0,
            ended: false,
        };
        session.read_offset = session.offset_for(start_secs);
        debug!(
            "Engine loaded {} at sample {}",
            session.track, session.read_offset
        );
        self.playhead.run_from(session.read_offset as f64, now);
        self.session = Some(session);
        self.state = PlaybackState::Playing;
        self.fade = None;
        self.waiting = false;
        self.state_changed = true;
    }

    pub fn unload(&mut self, now: Instant) {
        self.session = None;
        self.state = PlaybackState::Paused;
        self.fade = None;
        self.waiting = false;
        self.playhead.freeze(0.0, now);
        self.state_changed = true;
    }

    pub fn seek(&mut self, secs: f64, now: Instant) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.read_offset = session.offset_for(secs);
        session.ended = false;
        self.waiting = false;
        if self.state.is_audible() {
            self.playhead.run_from(session.read_offset as f64, now);
        } else {
            self.playhead.freeze(session.read_offset as f64, now);
        }
        self.state_changed = true;
    }

    pub fn set_volume(&mut self, slider: f32) {
        self.amplitude = slider_to_amplitude(slider, self.min_db);
    }

    /// Current envelope level, before user volume
    fn envelope_level(&self) -> f32 {
        match &self.fade {
            Some(fade) => fade.level(),
            None if self.state.is_audible() => 1.0,
            None => 0.0,
        }
    }

    fn fade_frames(&self) -> u64 {
        self.session
            .as_ref()
            .map(|s| (self.fade_duration.as_secs_f64() * s.buffer.spec().sample_rate as f64) as u64)
            .unwrap_or(0)
    }

    /// Toggle between playing and paused through a fade. Returns the new state.
    pub fn pause_or_resume(&mut self, queued_samples: usize, now: Instant) -> PlaybackState {
        let level = self.envelope_level();
        let next = self.state.toggled();
        if next == PlaybackState::FadingIn && self.state == PlaybackState::Paused && !self.waiting {
            if let Some(session) = &self.session {
                let anchor = session.read_offset.saturating_sub(queued_samples);
                self.playhead.run_from(anchor as f64, now);
            }
        }
        let target = if next == PlaybackState::FadingIn { 1.0 } else { 0.0 };
        self.fade = Some(Fade::new(level, target, self.fade_frames()));
        self.state = next;
        self.state_changed = true;

        // Nothing will drive the fade forward
        let stalled = self.session.as_ref().is_none_or(|s| s.ended);
        if stalled || self.fade.is_some_and(|f| f.is_done()) {
            self.finish_fade(now);
        }
        self.state
    }

    fn finish_fade(&mut self, now: Instant) {
        self.fade = None;
        let settled = self.state.settle();
        if settled == PlaybackState::Paused && self.playhead.running {
            let position = self.playhead.position(now, self.samples_per_second());
            self.playhead.freeze(position, now);
        }
        self.state = settled;
        self.state_changed = true;
    }

    /// Drop to paused immediately, e.g. when the device goes away
    pub fn force_pause(&mut self, now: Instant) {
        if self.state != PlaybackState::Paused {
            self.state = PlaybackState::FadingOut;
            self.finish_fade(now);
        }
    }

    /// Fill one device cycle. Advances the read offset only when every
    /// segment covering the cycle is loaded.
    pub fn render(&mut self, out: &mut [f32], queued_samples: usize, now: Instant) {
        out.fill(0.0);
        if self.state == PlaybackState::Paused {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.ended {
            return;
        }

        let buffer = &session.buffer;
        let len = buffer.samples.len();
        let start = session.read_offset;
        let end = (start + out.len()).min(len);

        if !buffer.is_sample_range_loaded(start, end) {
            if !self.waiting {
                trace!("Waiting for data at sample {}", start);
                self.waiting = true;
                self.playhead.freeze(start as f64, now);
                self.state_changed = true;
            }
            if self.state == PlaybackState::FadingOut {
                // Silent anyway; don't leave the fade hanging
                self.finish_fade(now);
            }
            return;
        }

        if self.waiting {
            trace!("Data available again at sample {}", start);
            self.waiting = false;
            self.playhead
                .run_from(start.saturating_sub(queued_samples) as f64, now);
            self.state_changed = true;
        }

        let copied = buffer.samples.read_into(start, &mut out[..end - start]);
        apply_gain(
            &mut out[..copied],
            buffer.channels().max(1),
            &mut self.fade,
            self.amplitude,
        );

        let mut ended_track = None;
        session.read_offset = (start + out.len()).min(len);
        if session.read_offset >= len {
            info!("Reached end of {}", session.track);
            session.ended = true;
            self.playhead.freeze(len as f64, now);
            self.state_changed = true;
            ended_track = Some(session.track.clone());
        }

        if self.fade.is_some_and(|f| f.is_done()) {
            self.finish_fade(now);
        }
        if let Some(track) = ended_track {
            let _ = self.progress_tx.send(PlaybackProgress::TrackEnded { track });
        }
    }

    pub fn snapshot(&self, now: Instant, queued_samples: usize, device_active: bool) -> StateSnapshot {
        let samples_per_second = self.samples_per_second();
        let (current_track, duration, len, ended) = match &self.session {
            Some(s) => (
                Some(s.track.clone()),
                s.buffer.duration_secs(),
                s.buffer.samples.len() as f64,
                s.ended,
            ),
            None => (None, 0.0, 0.0, false),
        };
        let seconds = |samples: f64| {
            if samples_per_second > 0.0 {
                samples / samples_per_second
            } else {
                0.0
            }
        };
        let position = self.playhead.position(now, samples_per_second).min(len);
        StateSnapshot {
            playback_running: device_active
                && current_track.is_some()
                && !ended
                && self.state.is_audible(),
            current_track,
            current_time_seconds: seconds(position),
            waiting_for_data: self.waiting,
            user_paused: self.state.is_user_paused(),
            duration,
            latency_seconds: seconds(queued_samples as f64),
        }
    }
}

fn apply_gain(samples: &mut [f32], channels: usize, fade: &mut Option<Fade>, amplitude: f32) {
    match fade {
        Some(fade) => {
            for frame in samples.chunks_mut(channels) {
                let gain = fade.advance() * amplitude;
                for sample in frame {
                    *sample *= gain;
                }
            }
        }
        None => {
            for sample in samples {
                *sample *= amplitude;
            }
        }
    }
}

/// What one engine step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Written,
    /// The device was full; the cycle is kept for the next step
    Suspended,
    /// The device failed and was released
    Failed,
    /// No device
    Idle,
}

/// Owns the output device and runs the cycle loop
pub struct PlaybackEngine {
    renderer: Renderer,
    factory: Box<dyn OutputFactory>,
    device: Option<Box<dyn OutputDevice>>,
    cycle: Vec<f32>,
    pending: bool,
    drain_timeout: Duration,
    focused: bool,
    idle_since: Option<Instant>,
    idle_timeout: Duration,
    last_report: Option<Instant>,
    report_interval: Duration,
    commands: mpsc::Receiver<EngineCommand>,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
}

impl PlaybackEngine {
    pub fn new(
        config: &Config,
        factory: Box<dyn OutputFactory>,
        commands: mpsc::Receiver<EngineCommand>,
        progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    ) -> Self {
        Self {
            renderer: Renderer::new(config, progress_tx.clone(), Instant::now()),
            factory,
            device: None,
            cycle: Vec::new(),
            pending: false,
            drain_timeout: Duration::from_millis(50),
            focused: true,
            idle_since: None,
            idle_timeout: config.idle_timeout,
            last_report: None,
            report_interval: config.report_interval,
            commands,
            progress_tx,
        }
    }

    pub fn renderer(&self) -> &Renderer {
        &self.renderer
    }

    pub fn has_device(&self) -> bool {
        self.device.is_some()
    }

    fn queued_samples(&self) -> usize {
        self.device.as_ref().map(|d| d.queued_samples()).unwrap_or(0)
    }

    pub fn run(mut self) {
        info!("Playback engine started");
        loop {
            let command = if self.device.is_some() {
                match self.commands.try_recv() {
                    Ok(command) => Some(command),
                    Err(mpsc::TryRecvError::Empty) => None,
                    Err(mpsc::TryRecvError::Disconnected) => break,
                }
            } else {
                match self.commands.recv_timeout(self.report_interval) {
                    Ok(command) => Some(command),
                    Err(mpsc::RecvTimeoutError::Timeout) => None,
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            };
            if let Some(command) = command {
                if !self.handle_command(command, Instant::now()) {
                    break;
                }
                continue;
            }
            let now = Instant::now();
            self.step(now);
            self.housekeeping(now);
        }
        self.release_device();
        info!("Playback engine stopped");
    }

    /// Apply one command. Returns false on shutdown.
    pub fn handle_command(&mut self, command: EngineCommand, now: Instant) -> bool {
        match command {
            EngineCommand::AcquireDevice { reply } => {
                let result = self.ensure_device().map_err(PlaybackError::device);
                let _ = reply.send(result);
            }
            EngineCommand::Load {
                track,
                buffer,
                start_secs,
            } => {
                if let Some(device) = &self.device {
                    if device.spec() != buffer.spec() {
                        warn!(
                            "Buffer format {:?} differs from device format {:?}",
                            buffer.spec(),
                            device.spec()
                        );
                    }
                }
                self.pending = false;
                self.renderer.load(track, buffer, start_secs, now);
                self.acquire_or_pause(now);
            }
            EngineCommand::Unload => {
                self.pending = false;
                self.renderer.unload(now);
            }
            EngineCommand::Seek(secs) => {
                self.pending = false;
                self.renderer.seek(secs, now);
            }
            EngineCommand::SetVolume(slider) => self.renderer.set_volume(slider),
            EngineCommand::PauseOrResume => {
                let queued = self.queued_samples();
                if self.renderer.pause_or_resume(queued, now).is_audible() {
                    self.acquire_or_pause(now);
                }
            }
            EngineCommand::SetFocus(focused) => {
                self.focused = focused;
                if focused {
                    if let Err(e) = self.ensure_device() {
                        self.report_device_error(&e);
                    }
                }
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    fn ensure_device(&mut self) -> Result<OutputSpec, AudioError> {
        if let Some(device) = &self.device {
            return Ok(device.spec());
        }
        let device = self.factory.acquire()?;
        let spec = device.spec();
        let cycle_samples = device.cycle_samples().max(1);
        self.cycle = vec![0.0; cycle_samples];
        self.pending = false;
        self.drain_timeout =
            Duration::from_secs_f64(2.0 * cycle_samples as f64 / spec.samples_per_second().max(1.0));
        self.idle_since = None;
        self.device = Some(device);
        info!(
            "Output device acquired ({} channels, {} Hz)",
            spec.channels, spec.sample_rate
        );
        Ok(spec)
    }

    fn acquire_or_pause(&mut self, now: Instant) {
        if let Err(e) = self.ensure_device() {
            self.report_device_error(&e);
            self.renderer.force_pause(now);
        }
    }

    fn report_device_error(&self, e: &AudioError) {
        error!("Output device unavailable: {}", e);
        let _ = self.progress_tx.send(PlaybackProgress::DeviceError {
            message: e.to_string(),
        });
    }

    fn release_device(&mut self) {
        if self.device.take().is_some() {
            self.pending = false;
            info!("Output device released");
        }
    }

    /// Render a cycle if none is pending and offer it to the device.
    pub fn step(&mut self, now: Instant) -> StepOutcome {
        let Some(device) = self.device.as_mut() else {
            return StepOutcome::Idle;
        };
        if !self.pending {
            let queued = device.queued_samples();
            self.renderer.render(&mut self.cycle, queued, now);
            self.pending = true;
        }
        match device.write(&self.cycle) {
            Ok(WriteOutcome::Accepted) => {
                self.pending = false;
                StepOutcome::Written
            }
            Ok(WriteOutcome::Backpressure) => {
                device.wait_for_drain(self.drain_timeout);
                StepOutcome::Suspended
            }
            Err(e) => {
                self.device = None;
                self.pending = false;
                self.report_device_error(&e);
                self.renderer.force_pause(now);
                StepOutcome::Failed
            }
        }
    }

    /// Periodic state reports and idle device release
    pub fn housekeeping(&mut self, now: Instant) {
        let changed = self.renderer.take_state_changed();
        let ended = self.renderer.has_ended();
        let due = self.renderer.state().is_audible()
            && !ended
            && self
                .last_report
                .is_none_or(|at| now.saturating_duration_since(at) >= self.report_interval);
        if changed || due {
            let snapshot =
                self.renderer
                    .snapshot(now, self.queued_samples(), self.device.is_some());
            let _ = self.progress_tx.send(PlaybackProgress::State(snapshot));
            self.last_report = Some(now);
        }

        let idle = ended || self.renderer.state() == PlaybackState::Paused;
        if self.device.is_some() && idle && !self.focused {
            let since = *self.idle_since.get_or_insert(now);
            if now.saturating_duration_since(since) >= self.idle_timeout {
                info!("Idle for {:?}, releasing output device", self.idle_timeout);
                self.release_device();
                self.idle_since = None;
            }
        } else {
            self.idle_since = None;
        }
    }
}

/// Handle to the engine thread
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl EngineHandle {
    /// Start the engine on its own thread. The device is opened lazily.
    pub fn spawn(
        config: &Config,
        factory: Box<dyn OutputFactory>,
        progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    ) -> Result<Self, PlaybackError> {
        let (commands_tx, commands_rx) = mpsc::channel();
        let config = config.clone();
        let thread = std::thread::Builder::new()
            .name("sluice-engine".to_string())
            .spawn(move || {
                PlaybackEngine::new(&config, factory, commands_rx, progress_tx).run();
            })?;
        Ok(Self {
            commands: commands_tx,
            thread: Some(thread),
        })
    }

    /// Fire-and-forget. Returns false once the engine has stopped.
    pub fn send(&self, command: EngineCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Ask for the device format, waiting at most `timeout`
    pub async fn acquire_device(&self, timeout: Duration) -> Result<OutputSpec, PlaybackError> {
        let (reply, reply_rx) = oneshot::channel();
        if !self.send(EngineCommand::AcquireDevice { reply }) {
            return Err(PlaybackError::device("playback engine is not running"));
        }
        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PlaybackError::device("playback engine dropped the request")),
            Err(_) => Err(PlaybackError::Timeout("device info from playback engine")),
        }
    }

    /// Stop the engine thread and wait for it to release the device
    pub async fn shutdown(&mut self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
        if let Some(thread) = self.thread.take() {
            match tokio::task::spawn_blocking(move || thread.join()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => error!("Playback engine thread panicked"),
                Err(e) => error!("Failed to join playback engine: {}", e),
            }
        }
    }
}
