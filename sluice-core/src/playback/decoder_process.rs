//! External decoder process adapter.
//!
//! Each decode window runs one decoder process that emits interleaved f32le
//! PCM at the device format on stdout. Output is written straight into the
//! shared track buffer at its time position, and segments are marked once
//! the samples covering them have landed.
use crate::playback::flac_prefetch::RangeBody;
use crate::playback::track_buffer::SharedTrackBuffer;
use crate::playback::PlaybackError;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const SAMPLE_BYTES: usize = 4;
const READ_CHUNK_BYTES: usize = 64 * 1024;
const CHUNK_NOTIFICATIONS: usize = 32;

/// Half-open time range `[start_secs, end_secs)` serviced by one decoder process
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodeWindow {
    pub start_secs: f64,
    pub end_secs: f64,
}

impl DecodeWindow {
    pub fn new(start_secs: f64, end_secs: f64) -> Self {
        Self {
            start_secs,
            end_secs,
        }
    }

    pub fn duration_secs(&self) -> f64 {
        (self.end_secs - self.start_secs).max(0.0)
    }
}

/// Where the decoder reads its input from
pub enum DecodeInput {
    /// A local file, trimmed to the window by the decoder
    File(PathBuf),
    /// A self-contained stream piped to stdin: header bytes, then the body.
    /// `start_secs` is the time of the first sample the stream decodes to.
    Pipe {
        header: Vec<u8>,
        body: Box<dyn RangeBody>,
        start_secs: f64,
    },
}

impl DecodeInput {
    /// Time position where the decoder's first output sample belongs
    fn output_start_secs(&self, window: &DecodeWindow) -> f64 {
        match self {
            DecodeInput::File(_) => window.start_secs,
            DecodeInput::Pipe { start_secs, .. } => *start_secs,
        }
    }
}

/// Written-so-far notification, in absolute frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeChunk {
    pub frames_end: u64,
}

/// Next thing that happened to a running decode
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeEvent {
    Chunk(DecodeChunk),
    Exit(DecodeExit),
}

/// How a decode window ended
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeExit {
    /// The process ended on its own
    Finished { frames_end: u64, success: bool },
    /// We stopped it
    Stopped,
    /// Reading its output failed
    Failed(String),
}

impl DecodeExit {
    /// The process ran to completion and reported success
    pub fn is_clean(&self) -> bool {
        matches!(self, DecodeExit::Finished { success: true, .. })
    }
}

/// Spawns decoder processes for one output format
#[derive(Debug, Clone)]
pub struct DecoderProcess {
    decoder_path: String,
}

impl DecoderProcess {
    pub fn new(decoder_path: impl Into<String>) -> Self {
        Self {
            decoder_path: decoder_path.into(),
        }
    }

    pub fn decoder_path(&self) -> &str {
        &self.decoder_path
    }

    /// Start decoding `window` into `buffer`.
    pub fn spawn(
        &self,
        window: DecodeWindow,
        input: DecodeInput,
        buffer: SharedTrackBuffer,
    ) -> Result<DecodeHandle, PlaybackError> {
        let spec = buffer.spec();
        let output_start_secs = input.output_start_secs(&window);
        let args = decoder_args(
            &input,
            &window,
            output_start_secs,
            spec.channels,
            spec.sample_rate,
        );
        let piped = matches!(input, DecodeInput::Pipe { .. });

        debug!(
            "Spawning decoder for {:.3}s-{:.3}s ({} {})",
            window.start_secs,
            window.end_secs,
            self.decoder_path,
            args.join(" ")
        );
        let mut child = Command::new(&self.decoder_path)
            .args(&args)
            .stdin(if piped { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlaybackError::decoder(format!("failed to start {}: {}", self.decoder_path, e))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlaybackError::decoder("decoder stdout not captured"))?;
        let feeder = match input {
            DecodeInput::Pipe { header, body, .. } => {
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| PlaybackError::decoder("decoder stdin not captured"))?;
                Some(tokio::spawn(async move {
                    if let Err(e) = feed_stdin(stdin, header, body).await {
                        debug!("Decoder input closed early: {}", e);
                    }
                }))
            }
            DecodeInput::File(_) => None,
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_NOTIFICATIONS);
        let writer = PcmWriter::new(buffer, output_start_secs);
        let task = tokio::spawn(drive(child, stdout, feeder, writer, stop_rx, chunk_tx));

        Ok(DecodeHandle {
            window,
            stop_tx: Some(stop_tx),
            task,
            chunks: chunk_rx,
        })
    }
}

/// Command line for an ffmpeg-compatible decoder
pub fn decoder_args(
    input: &DecodeInput,
    window: &DecodeWindow,
    output_start_secs: f64,
    channels: u16,
    sample_rate: u32,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "error".into()];
    match input {
        DecodeInput::File(path) => {
            args.extend([
                "-nostdin".into(),
                "-ss".into(),
                format!("{:.6}", window.start_secs),
                "-t".into(),
                format!("{:.6}", window.duration_secs()),
                "-i".into(),
                path.to_string_lossy().into_owned(),
            ]);
        }
        DecodeInput::Pipe { .. } => {
            args.extend([
                "-f".into(),
                "flac".into(),
                "-i".into(),
                "pipe:0".into(),
                "-t".into(),
                format!("{:.6}", (window.end_secs - output_start_secs).max(0.0)),
            ]);
        }
    }
    args.extend([
        "-f".into(),
        "f32le".into(),
        "-ac".into(),
        channels.to_string(),
        "-ar".into(),
        sample_rate.to_string(),
        "pipe:1".into(),
    ]);
    args
}

async fn feed_stdin(
    mut stdin: ChildStdin,
    header: Vec<u8>,
    mut body: Box<dyn RangeBody>,
) -> Result<(), PlaybackError> {
    stdin.write_all(&header).await?;
    while let Some(chunk) = body.next_chunk().await? {
        stdin.write_all(&chunk).await?;
    }
    stdin.shutdown().await?;
    Ok(())
}

async fn drive(
    mut child: Child,
    mut stdout: ChildStdout,
    feeder: Option<JoinHandle<()>>,
    mut writer: PcmWriter,
    mut stop_rx: oneshot::Receiver<()>,
    chunk_tx: mpsc::Sender<DecodeChunk>,
) -> DecodeExit {
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let read_error = loop {
        tokio::select! {
            biased;
            _ = &mut stop_rx => {
                // Input first, then the process; no writes happen after this
                if let Some(feeder) = feeder {
                    feeder.abort();
                    let _ = feeder.await;
                }
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill decoder: {}", e);
                }
                trace!("Decoder stopped at frame {}", writer.frames_end());
                return DecodeExit::Stopped;
            }
            read = stdout.read(&mut chunk) => match read {
                Ok(0) => break None,
                Ok(n) => {
                    let frames_end = writer.push(&chunk[..n]);
                    let _ = chunk_tx.try_send(DecodeChunk { frames_end });
                }
                Err(e) => break Some(e),
            }
        }
    };

    if let Some(e) = read_error {
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        let _ = child.kill().await;
        return DecodeExit::Failed(format!("reading decoder output: {}", e));
    }

    let success = match child.wait().await {
        Ok(status) => status.success(),
        Err(e) => {
            warn!("Failed to reap decoder: {}", e);
            false
        }
    };
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    writer.finish(success);
    DecodeExit::Finished {
        frames_end: writer.frames_end(),
        success,
    }
}

/// Handle to one running decode window.
///
/// `finished` and an `Exit` from `next_event` resolve once the process is
/// gone; after either has returned the handle should be dropped.
pub struct DecodeHandle {
    window: DecodeWindow,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<DecodeExit>,
    chunks: mpsc::Receiver<DecodeChunk>,
}

impl DecodeHandle {
    pub fn window(&self) -> DecodeWindow {
        self.window
    }

    pub async fn finished(&mut self) -> DecodeExit {
        join_exit((&mut self.task).await)
    }

    /// Next write notification, or the exit once output has ended.
    /// Cancel safe.
    pub async fn next_event(&mut self) -> DecodeEvent {
        tokio::select! {
            biased;
            Some(chunk) = self.chunks.recv() => DecodeEvent::Chunk(chunk),
            exit = &mut self.task => DecodeEvent::Exit(join_exit(exit)),
        }
    }

    /// Kill the process and wait until it has exited and its output task is
    /// done writing.
    pub async fn stop(mut self) -> DecodeExit {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        self.finished().await
    }
}

fn join_exit(result: Result<DecodeExit, tokio::task::JoinError>) -> DecodeExit {
    match result {
        Ok(exit) => exit,
        Err(e) => DecodeExit::Failed(format!("decoder task failed: {}", e)),
    }
}

/// Turns the decoder's byte stream into buffer writes and segment marks.
struct PcmWriter {
    buffer: SharedTrackBuffer,
    channels: usize,
    next_sample: usize,
    /// First segment boundary at or after the start of output; segments
    /// before it are not fully covered by this decoder.
    first_mark_frame: u64,
    pending: Vec<u8>,
    scratch: Vec<f32>,
}

impl PcmWriter {
    fn new(buffer: SharedTrackBuffer, output_start_secs: f64) -> Self {
        let channels = buffer.channels().max(1);
        let start_frame = (output_start_secs.max(0.0) * buffer.spec().sample_rate as f64).floor() as u64;
        let frames_per_segment = buffer.segments.frames_per_segment();
        Self {
            channels,
            next_sample: start_frame as usize * channels,
            first_mark_frame: start_frame.div_ceil(frames_per_segment) * frames_per_segment,
            pending: Vec::with_capacity(READ_CHUNK_BYTES + SAMPLE_BYTES),
            scratch: Vec::with_capacity(READ_CHUNK_BYTES / SAMPLE_BYTES),
            buffer,
        }
    }

    fn frames_end(&self) -> u64 {
        (self.next_sample / self.channels) as u64
    }

    /// Write whole samples from `bytes`, keeping any trailing partial sample
    /// for the next call. Returns the frame reached.
    fn push(&mut self, bytes: &[u8]) -> u64 {
        self.pending.extend_from_slice(bytes);
        let whole = self.pending.len() / SAMPLE_BYTES * SAMPLE_BYTES;
        self.scratch.clear();
        self.scratch.extend(
            self.pending[..whole]
                .chunks_exact(SAMPLE_BYTES)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
        self.pending.drain(..whole);

        self.buffer.samples.write_at(self.next_sample, &self.scratch);
        self.next_sample += self.scratch.len();
        self.mark_complete_segments();
        self.frames_end()
    }

    fn mark_complete_segments(&self) {
        let frames_end = self.frames_end();
        let complete_end = if frames_end >= self.buffer.total_frames() {
            frames_end
        } else {
            let per_segment = self.buffer.segments.frames_per_segment();
            frames_end / per_segment * per_segment
        };
        if complete_end > self.first_mark_frame {
            self.buffer
                .segments
                .mark_range(self.first_mark_frame, complete_end);
        }
    }

    /// On a clean exit the trailing partial segment is as complete as it
    /// will get.
    fn finish(&self, success: bool) {
        if !success {
            return;
        }
        let frames_end = self.frames_end();
        if frames_end > self.first_mark_frame {
            self.buffer
                .segments
                .mark_range(self.first_mark_frame, frames_end);
        }
    }
}
