//! Perceptual waveform overview for local tracks.
//!
//! A separate low-rate mono decode produces peak levels per bucket, mapped
//! onto a dB scale so quiet passages stay visible. Results are cached as
//! JSON under a key derived from the file's path, size and mtime.
use crate::playback::PlaybackError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::UNIX_EPOCH;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Sample rate of the analysis decode
const ANALYSIS_RATE: u32 = 8000;
/// Levels below this are drawn as silence
const FLOOR_DB: f32 = -60.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaveformCache {
    pub peaks: Vec<f32>,
}

/// Peak level per bucket, normalized to [0, 1] on a dB scale.
pub fn perceptual_peaks(samples: &[f32], points: usize) -> Vec<f32> {
    if points == 0 {
        return Vec::new();
    }
    if samples.is_empty() {
        return vec![0.0; points];
    }
    let bucket = samples.len().div_ceil(points);
    let mut peaks: Vec<f32> = samples
        .chunks(bucket)
        .map(|chunk| {
            let peak = chunk.iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            to_perceptual(peak)
        })
        .collect();
    peaks.resize(points, 0.0);
    peaks
}

fn to_perceptual(peak: f32) -> f32 {
    if peak <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * peak.log10();
    ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0)
}

/// Cache key: sha256 over the path, file size and modification time
pub async fn cache_key(path: &Path) -> Result<String, PlaybackError> {
    let meta = tokio::fs::metadata(path).await?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(meta.len().to_le_bytes());
    hasher.update(mtime.to_le_bytes());
    Ok(hex::encode(hasher.finalize()))
}

pub fn cache_path(cache_dir: &Path, key: &str) -> PathBuf {
    cache_dir.join(format!("{}.json", key))
}

/// Read-through waveform lookup
pub struct WaveformBuilder {
    decoder_path: String,
    cache_dir: PathBuf,
    points: usize,
}

impl WaveformBuilder {
    pub fn new(decoder_path: impl Into<String>, cache_dir: impl Into<PathBuf>, points: usize) -> Self {
        Self {
            decoder_path: decoder_path.into(),
            cache_dir: cache_dir.into(),
            points,
        }
    }

    /// Cached peaks for `path`, computing and storing them on a miss.
    pub async fn load_or_compute(&self, path: &Path) -> Result<Vec<f32>, PlaybackError> {
        let key = cache_key(path).await?;
        let cached = cache_path(&self.cache_dir, &key);
        if let Some(peaks) = self.read_cache(&cached).await {
            debug!("Waveform cache hit for {}", path.display());
            return Ok(peaks);
        }

        let samples = self.decode_mono(path).await?;
        let peaks = perceptual_peaks(&samples, self.points);
        tokio::fs::create_dir_all(&self.cache_dir).await?;
        let json = serde_json::to_vec(&WaveformCache {
            peaks: peaks.clone(),
        })
        .map_err(|e| PlaybackError::task(format!("serializing waveform: {}", e)))?;
        tokio::fs::write(&cached, json).await?;
        info!(
            "Computed waveform for {} ({} samples)",
            path.display(),
            samples.len()
        );
        Ok(peaks)
    }

    async fn read_cache(&self, cached: &Path) -> Option<Vec<f32>> {
        let bytes = tokio::fs::read(cached).await.ok()?;
        match serde_json::from_slice::<WaveformCache>(&bytes) {
            Ok(cache) if cache.peaks.len() == self.points => Some(cache.peaks),
            Ok(_) => None,
            Err(e) => {
                debug!("Ignoring unreadable waveform cache {}: {}", cached.display(), e);
                None
            }
        }
    }

    async fn decode_mono(&self, path: &Path) -> Result<Vec<f32>, PlaybackError> {
        let mut child = Command::new(&self.decoder_path)
            .args(["-hide_banner", "-loglevel", "error", "-nostdin", "-i"])
            .arg(path)
            .args(["-f", "f32le", "-ac", "1", "-ar"])
            .arg(ANALYSIS_RATE.to_string())
            .arg("pipe:1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PlaybackError::decoder(format!("failed to start {}: {}", self.decoder_path, e))
            })?;
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| PlaybackError::decoder("decoder stdout not captured"))?;
        let mut bytes = Vec::new();
        stdout.read_to_end(&mut bytes).await?;
        let status = child.wait().await?;
        if !status.success() {
            return Err(PlaybackError::decoder(format!(
                "waveform decode of {} exited with {}",
                path.display(),
                status
            )));
        }
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}
