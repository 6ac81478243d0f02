use crate::config::Config;
use crate::flac;
use crate::playback::audio_source::{AudioSource, AudioSourceHandle, SourceKind};
use crate::playback::engine::{EngineCommand, EngineHandle};
use crate::playback::flac_prefetch::{HttpRangeFetcher, RangeFetcher, RemoteFlac};
use crate::playback::output::{CpalOutputFactory, OutputFactory};
use crate::playback::progress::{PlaybackProgress, PlaybackProgressHandle};
use crate::playback::track_buffer::{create_track_buffer, SharedTrackBuffer};
use crate::playback::PlaybackError;
use sluice_common::SourceType;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{error, info};

/// Playback commands sent to the service
#[derive(Debug, Clone)]
pub enum PlaybackCommand {
    /// Load a source and start playing it from the beginning.
    /// A duration of zero or less is read from the file where possible.
    Load {
        source: String,
        duration: f64,
        source_type: SourceType,
    },
    Seek(f64),
    /// Volume slider position in [0, 1]
    SetVolume(f32),
    PauseOrResume,
    SetFocus(bool),
    Shutdown,
}

/// Handle to the playback service for sending commands
#[derive(Clone)]
pub struct PlaybackHandle {
    command_tx: tokio_mpsc::UnboundedSender<PlaybackCommand>,
    progress_handle: PlaybackProgressHandle,
}

impl PlaybackHandle {
    pub fn load(&self, source: impl Into<String>, duration: f64, source_type: SourceType) {
        let _ = self.command_tx.send(PlaybackCommand::Load {
            source: source.into(),
            duration,
            source_type,
        });
    }

    pub fn seek(&self, secs: f64) {
        let _ = self.command_tx.send(PlaybackCommand::Seek(secs));
    }

    pub fn set_volume(&self, slider: f32) {
        let _ = self.command_tx.send(PlaybackCommand::SetVolume(slider));
    }

    pub fn pause_or_resume(&self) {
        let _ = self.command_tx.send(PlaybackCommand::PauseOrResume);
    }

    pub fn set_focus(&self, focused: bool) {
        let _ = self.command_tx.send(PlaybackCommand::SetFocus(focused));
    }

    pub fn shutdown(&self) {
        let _ = self.command_tx.send(PlaybackCommand::Shutdown);
    }

    /// Resolves once the service has stopped and released the device
    pub async fn closed(&self) {
        self.command_tx.closed().await
    }

    pub fn subscribe_progress(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_all()
    }

    pub fn subscribe_transport(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_transport()
    }

    pub fn subscribe_loading(&self) -> tokio_mpsc::UnboundedReceiver<PlaybackProgress> {
        self.progress_handle.subscribe_loading()
    }
}

/// Session orchestrator: owns the engine thread and the current track's
/// audio source, and sequences loads against them.
pub struct PlaybackService {
    config: Config,
    command_rx: tokio_mpsc::UnboundedReceiver<PlaybackCommand>,
    progress_tx: tokio_mpsc::UnboundedSender<PlaybackProgress>,
    engine: EngineHandle,
    fetcher: Arc<dyn RangeFetcher>,
    source: Option<AudioSourceHandle>,
}

impl PlaybackService {
    /// Start the service with the default cpal output and an HTTP fetcher
    pub fn start_default(
        config: Config,
        runtime_handle: tokio::runtime::Handle,
    ) -> Result<PlaybackHandle, PlaybackError> {
        Self::start(
            config,
            Box::new(CpalOutputFactory),
            Arc::new(HttpRangeFetcher::default()),
            runtime_handle,
        )
    }

    pub fn start(
        config: Config,
        factory: Box<dyn OutputFactory>,
        fetcher: Arc<dyn RangeFetcher>,
        runtime_handle: tokio::runtime::Handle,
    ) -> Result<PlaybackHandle, PlaybackError> {
        let (command_tx, command_rx) = tokio_mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = tokio_mpsc::unbounded_channel();
        let progress_handle = PlaybackProgressHandle::new(progress_rx, runtime_handle.clone());
        let engine = EngineHandle::spawn(&config, factory, progress_tx.clone())?;

        let service = PlaybackService {
            config,
            command_rx,
            progress_tx,
            engine,
            fetcher,
            source: None,
        };
        runtime_handle.spawn(service.run());

        Ok(PlaybackHandle {
            command_tx,
            progress_handle,
        })
    }

    async fn run(mut self) {
        info!("PlaybackService started");
        while let Some(command) = self.command_rx.recv().await {
            match command {
                PlaybackCommand::Load {
                    source,
                    duration,
                    source_type,
                } => self.load(source, duration, source_type).await,
                PlaybackCommand::Seek(secs) => {
                    self.engine.send(EngineCommand::Seek(secs));
                    if let Some(source) = &self.source {
                        source.seek(secs);
                    }
                }
                PlaybackCommand::SetVolume(slider) => {
                    self.engine.send(EngineCommand::SetVolume(slider));
                }
                PlaybackCommand::PauseOrResume => {
                    self.engine.send(EngineCommand::PauseOrResume);
                }
                PlaybackCommand::SetFocus(focused) => {
                    self.engine.send(EngineCommand::SetFocus(focused));
                }
                PlaybackCommand::Shutdown => break,
            }
        }
        self.shutdown().await;
        info!("PlaybackService stopped");
    }

    async fn load(&mut self, track: String, duration: f64, source_type: SourceType) {
        info!("Loading {} ({:?})", track, source_type);
        if let Some(mut previous) = self.source.take() {
            previous.cancel().await;
        }
        self.engine.send(EngineCommand::Unload);

        match self.prepare(&track, duration, source_type).await {
            Ok((kind, buffer)) => {
                self.engine.send(EngineCommand::Load {
                    track: track.clone(),
                    buffer: buffer.clone(),
                    start_secs: 0.0,
                });
                self.source = Some(AudioSource::start(
                    track,
                    kind,
                    buffer,
                    &self.config,
                    self.progress_tx.clone(),
                ));
            }
            Err(e) => {
                error!("Failed to load {}: {}", track, e);
                let _ = self.progress_tx.send(PlaybackProgress::LoadFailed {
                    track,
                    message: e.to_string(),
                });
            }
        }
    }

    /// Device format, source layout and a buffer sized for the track
    async fn prepare(
        &self,
        track: &str,
        duration: f64,
        source_type: SourceType,
    ) -> Result<(SourceKind, SharedTrackBuffer), PlaybackError> {
        let spec = self
            .engine
            .acquire_device(self.config.device_handshake_timeout)
            .await?;

        let (kind, duration) = match source_type {
            SourceType::Local => {
                let path = PathBuf::from(track);
                let duration = if duration > 0.0 {
                    duration
                } else {
                    local_flac_duration(path.clone()).await?
                };
                (SourceKind::Local { path }, duration)
            }
            SourceType::Remote => {
                let remote = RemoteFlac::prefetch(track, self.fetcher.clone()).await?;
                let duration = if duration > 0.0 {
                    duration
                } else {
                    remote.metadata().duration_secs()
                };
                (
                    SourceKind::RemoteFlac {
                        remote: Arc::new(remote),
                    },
                    duration,
                )
            }
        };

        let buffer = create_track_buffer(
            duration,
            spec,
            self.config.segment_duration.as_secs_f64(),
        );
        info!(
            "{}: {:.2}s at {} Hz x {}, {} segments",
            track,
            duration,
            spec.sample_rate,
            spec.channels,
            buffer.segments.len()
        );
        Ok((kind, buffer))
    }

    async fn shutdown(&mut self) {
        if let Some(mut source) = self.source.take() {
            source.cancel().await;
        }
        self.engine.shutdown().await;
    }
}

async fn local_flac_duration(path: PathBuf) -> Result<f64, PlaybackError> {
    let metadata = tokio::task::spawn_blocking(move || flac::read_metadata(&path))
        .await
        .map_err(PlaybackError::task)??;
    Ok(metadata.duration_secs())
}
