#![allow(dead_code)]
use async_trait::async_trait;
use sluice_core::config::Config;
use sluice_core::playback::flac_prefetch::{RangeBody, RangeFetcher, RangeResponse};
use sluice_core::playback::output::{AudioError, OutputDevice, OutputFactory, WriteOutcome};
use sluice_core::playback::{OutputSpec, PlaybackError};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub fn tracing_init() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_line_number(true)
        .with_target(false)
        .with_file(true)
        .try_init();
}

/// Every sample the fake decoder emits (bytes 0x3f3f3f3f)
pub fn decoded_sample() -> f32 {
    f32::from_bits(0x3f3f_3f3f)
}

/// Config pointing at a fake decoder, with fast reports
pub fn test_config(decoder: &Path, cache_dir: &Path) -> Config {
    Config {
        decoder_path: decoder.to_string_lossy().into_owned(),
        cache_dir: cache_dir.to_path_buf(),
        segment_duration: Duration::from_secs(1),
        report_interval: Duration::from_millis(50),
        waveform_points: 32,
        ..Config::default()
    }
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A stand-in for the external decoder.
///
/// Window decodes (those with `-t`) are logged to `invocations.log` and
/// tracked through `decoder.pid`; a decode starting while the previous one
/// is still alive is recorded in `overlap.log`. The script consumes stdin,
/// sleeps `delay_secs`, then emits `-t` seconds (1 if absent) of PCM at the
/// requested rate and channel count.
pub fn decoder_script(dir: &Path, delay_secs: f64) -> PathBuf {
    write_decoder_script(dir, delay_secs, None)
}

/// Like `decoder_script`, but never emits more than `max_secs` of audio
/// however long the requested window is.
pub fn short_decoder_script(dir: &Path, max_secs: f64) -> PathBuf {
    write_decoder_script(dir, 0.0, Some(max_secs))
}

fn write_decoder_script(dir: &Path, delay_secs: f64, max_secs: Option<f64>) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
dir='{dir}'
args="$*"
window=
dur=1; ch=2; rate=100
while [ $# -gt 0 ]; do
  case "$1" in
    -t) dur="$2"; window=1; shift ;;
    -ac) ch="$2"; shift ;;
    -ar) rate="$2"; shift ;;
  esac
  shift
done
if [ -n "$window" ]; then
  echo "$args" >> "$dir/invocations.log"
  if [ -f "$dir/decoder.pid" ] && kill -0 "$(cat "$dir/decoder.pid")" 2>/dev/null; then
    echo "$args" >> "$dir/overlap.log"
  fi
  echo $$ > "$dir/decoder.pid"
else
  echo "$args" >> "$dir/waveform.log"
fi
cat > /dev/null
sleep {delay}
bytes=$(awk -v d="$dur" -v m="{max}" -v r="$rate" -v c="$ch" 'BEGIN {{ if (m > 0 && d > m) d = m; printf "%d", int(d * r + 0.5) * c * 4 }}')
head -c "$bytes" /dev/zero | tr '\0' '\077'
"#,
        dir = dir.display(),
        delay = delay_secs,
        max = max_secs.unwrap_or(0.0),
    );
    write_script(dir, "fake-decoder", &body)
}

/// A decoder that fails without output. Window decodes are logged to
/// `invocations.log`.
pub fn failing_decoder_script(dir: &Path) -> PathBuf {
    let body = format!(
        r#"#!/bin/sh
case " $* " in
  *" -t "*) echo "$*" >> '{}/invocations.log' ;;
esac
exit 1
"#,
        dir.display()
    );
    write_script(dir, "failing-decoder", &body)
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn pid_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// A FLAC file: STREAMINFO, SEEKTABLE with `(sample, offset from audio
/// start)` points, then `audio_len` filler bytes. Returns the bytes and the
/// audio offset.
pub fn flac_file(
    sample_rate: u32,
    channels: u16,
    total_samples: u64,
    seek_points: &[(u64, u64)],
    audio_len: usize,
) -> (Vec<u8>, u64) {
    let mut out = b"fLaC".to_vec();
    let mut info = [0u8; 34];
    info[10] = (sample_rate >> 12) as u8;
    info[11] = (sample_rate >> 4) as u8;
    info[12] = (((sample_rate & 0x0F) as u8) << 4) | ((((channels - 1) as u8) & 0x07) << 1);
    info[13] = ((total_samples >> 32) & 0x0F) as u8;
    info[14..18].copy_from_slice(&(total_samples as u32).to_be_bytes());
    out.push(0);
    out.extend_from_slice(&34u32.to_be_bytes()[1..]);
    out.extend_from_slice(&info);

    out.push(0x80 | 3);
    out.extend_from_slice(&((seek_points.len() * 18) as u32).to_be_bytes()[1..]);
    for (sample, offset) in seek_points {
        out.extend_from_slice(&sample.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
        out.extend_from_slice(&4096u16.to_be_bytes());
    }

    let audio_offset = out.len() as u64;
    out.extend(std::iter::repeat_n(0x5Au8, audio_len));
    (out, audio_offset)
}

struct MemoryBody(Option<Vec<u8>>);

#[async_trait]
impl RangeBody for MemoryBody {
    async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, PlaybackError> {
        Ok(self.0.take())
    }
}

/// Serves byte ranges of an in-memory file and records each request
pub struct MemoryFetcher {
    data: Vec<u8>,
    pub requests: Mutex<Vec<(u64, Option<u64>)>>,
}

impl MemoryFetcher {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(u64, Option<u64>)> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RangeFetcher for MemoryFetcher {
    async fn fetch_range(
        &self,
        _url: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<RangeResponse, PlaybackError> {
        self.requests.lock().unwrap().push((start, end));
        let last = self.data.len() as u64 - 1;
        let end = end.unwrap_or(last).min(last);
        Ok(RangeResponse {
            total_bytes: self.data.len() as u64,
            body: Box::new(MemoryBody(Some(
                self.data[start as usize..=end as usize].to_vec(),
            ))),
        })
    }
}

/// A server that answers every range request with the whole file
pub struct NoRangeFetcher;

#[async_trait]
impl RangeFetcher for NoRangeFetcher {
    async fn fetch_range(
        &self,
        url: &str,
        _start: u64,
        _end: Option<u64>,
    ) -> Result<RangeResponse, PlaybackError> {
        Err(PlaybackError::RangeNotSupported(url.to_string()))
    }
}

/// Consumes cycles in real time, one per `cycle_frames` of audio
pub struct PacedDevice {
    spec: OutputSpec,
    cycle_frames: usize,
    next_due: Instant,
}

impl OutputDevice for PacedDevice {
    fn spec(&self) -> OutputSpec {
        self.spec
    }

    fn cycle_samples(&self) -> usize {
        self.cycle_frames * self.spec.channels as usize
    }

    fn write(&mut self, _samples: &[f32]) -> Result<WriteOutcome, AudioError> {
        let now = Instant::now();
        if now < self.next_due {
            return Ok(WriteOutcome::Backpressure);
        }
        let cycle = Duration::from_secs_f64(self.cycle_frames as f64 / self.spec.sample_rate as f64);
        self.next_due = now + cycle;
        Ok(WriteOutcome::Accepted)
    }

    fn wait_for_drain(&mut self, timeout: Duration) {
        let remaining = self.next_due.saturating_duration_since(Instant::now());
        std::thread::sleep(remaining.min(timeout));
    }

    fn queued_samples(&self) -> usize {
        0
    }
}

/// Opens `PacedDevice`s, optionally after a delay
pub struct PacedFactory {
    pub spec: OutputSpec,
    pub acquire_delay: Duration,
}

impl PacedFactory {
    pub fn new(spec: OutputSpec) -> Box<Self> {
        Box::new(Self {
            spec,
            acquire_delay: Duration::ZERO,
        })
    }

    pub fn slow(spec: OutputSpec, acquire_delay: Duration) -> Box<Self> {
        Box::new(Self {
            spec,
            acquire_delay,
        })
    }
}

impl OutputFactory for PacedFactory {
    fn acquire(&mut self) -> Result<Box<dyn OutputDevice>, AudioError> {
        std::thread::sleep(self.acquire_delay);
        Ok(Box::new(PacedDevice {
            spec: self.spec,
            cycle_frames: 10,
            next_due: Instant::now(),
        }))
    }
}
