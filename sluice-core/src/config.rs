use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_decoder_path() -> String {
    "ffmpeg".to_string()
}
fn default_segment_duration_secs() -> f64 {
    1.0
}
fn default_min_db() -> f32 {
    -50.0
}
fn default_fade_ms() -> u64 {
    150
}
fn default_idle_timeout_secs() -> u64 {
    120
}
fn default_report_interval_ms() -> u64 {
    200
}
fn default_device_handshake_timeout_ms() -> u64 {
    2000
}
fn default_max_decode_retries() -> u32 {
    5
}
fn default_waveform_points() -> usize {
    600
}

/// YAML config file structure (~/.sluice/config.yaml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigYaml {
    /// External decoder binary (ffmpeg-compatible command line)
    #[serde(default = "default_decoder_path")]
    pub decoder_path: String,
    #[serde(default = "default_segment_duration_secs")]
    pub segment_duration_secs: f64,
    /// Gain at volume slider 0, in dB
    #[serde(default = "default_min_db")]
    pub min_db: f32,
    #[serde(default = "default_fade_ms")]
    pub fade_ms: u64,
    /// Release the output device after this long paused and unfocused
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
    #[serde(default = "default_device_handshake_timeout_ms")]
    pub device_handshake_timeout_ms: u64,
    /// Give up on a decode window after this many fruitless decoder exits
    #[serde(default = "default_max_decode_retries")]
    pub max_decode_retries: u32,
    #[serde(default = "default_waveform_points")]
    pub waveform_points: usize,
    /// Waveform cache directory. None = ~/.sluice/cache
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for ConfigYaml {
    fn default() -> Self {
        Self {
            decoder_path: default_decoder_path(),
            segment_duration_secs: default_segment_duration_secs(),
            min_db: default_min_db(),
            fade_ms: default_fade_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            report_interval_ms: default_report_interval_ms(),
            device_handshake_timeout_ms: default_device_handshake_timeout_ms(),
            max_decode_retries: default_max_decode_retries(),
            waveform_points: default_waveform_points(),
            cache_dir: None,
        }
    }
}

/// Application configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub decoder_path: String,
    pub segment_duration: Duration,
    pub min_db: f32,
    pub fade_duration: Duration,
    pub idle_timeout: Duration,
    pub report_interval: Duration,
    pub device_handshake_timeout: Duration,
    pub max_decode_retries: u32,
    pub waveform_points: usize,
    pub cache_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_yaml(ConfigYaml::default(), &default_sluice_dir())
    }
}

fn default_sluice_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sluice")
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key)
        .ok()
        .filter(|s| !s.is_empty())
        .and_then(|s| match s.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring unparseable {}={}", key, s);
                None
            }
        })
}

impl Config {
    /// Load configuration.
    ///
    /// Dev mode is activated if a .env file exists or SLUICE_DEV_MODE is set,
    /// in which case values come from `SLUICE_*` environment variables.
    /// Otherwise ~/.sluice/config.yaml is read (and created with defaults).
    pub fn load() -> Result<Self, ConfigError> {
        let dev_mode = std::env::var("SLUICE_DEV_MODE").is_ok() || dotenvy::dotenv().is_ok();
        let config = if dev_mode {
            info!("Dev mode activated - loading from .env");
            Self::from_env()
        } else {
            info!("Production mode - loading from config.yaml");
            Self::load_from_dir(&default_sluice_dir())?
        };
        config.validate()?;
        Ok(config)
    }

    fn from_env() -> Self {
        let defaults = ConfigYaml::default();
        let yaml = ConfigYaml {
            decoder_path: std::env::var("SLUICE_DECODER_PATH")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.decoder_path),
            segment_duration_secs: env_parse("SLUICE_SEGMENT_DURATION_SECS")
                .unwrap_or(defaults.segment_duration_secs),
            min_db: env_parse("SLUICE_MIN_DB").unwrap_or(defaults.min_db),
            fade_ms: env_parse("SLUICE_FADE_MS").unwrap_or(defaults.fade_ms),
            idle_timeout_secs: env_parse("SLUICE_IDLE_TIMEOUT_SECS")
                .unwrap_or(defaults.idle_timeout_secs),
            report_interval_ms: env_parse("SLUICE_REPORT_INTERVAL_MS")
                .unwrap_or(defaults.report_interval_ms),
            device_handshake_timeout_ms: env_parse("SLUICE_DEVICE_HANDSHAKE_TIMEOUT_MS")
                .unwrap_or(defaults.device_handshake_timeout_ms),
            max_decode_retries: env_parse("SLUICE_MAX_DECODE_RETRIES")
                .unwrap_or(defaults.max_decode_retries),
            waveform_points: env_parse("SLUICE_WAVEFORM_POINTS")
                .unwrap_or(defaults.waveform_points),
            cache_dir: env_parse::<String>("SLUICE_CACHE_DIR").map(PathBuf::from),
        };
        Self::from_yaml(yaml, &default_sluice_dir())
    }

    /// Read `config.yaml` from a directory, writing defaults if it is missing.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ConfigError> {
        let config_path = dir.join("config.yaml");
        let yaml: ConfigYaml = match std::fs::read_to_string(&config_path) {
            Ok(content) => serde_yaml::from_str(&content).map_err(|e| {
                ConfigError::Serialization(format!("{}: {}", config_path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No config at {}, writing defaults", config_path.display());
                let yaml = ConfigYaml::default();
                std::fs::create_dir_all(dir)?;
                let content = serde_yaml::to_string(&yaml)
                    .map_err(|e| ConfigError::Serialization(e.to_string()))?;
                std::fs::write(&config_path, content)?;
                yaml
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::from_yaml(yaml, dir))
    }

    fn from_yaml(yaml: ConfigYaml, sluice_dir: &Path) -> Self {
        Self {
            decoder_path: yaml.decoder_path,
            segment_duration: Duration::from_secs_f64(yaml.segment_duration_secs.max(0.001)),
            min_db: yaml.min_db,
            fade_duration: Duration::from_millis(yaml.fade_ms),
            idle_timeout: Duration::from_secs(yaml.idle_timeout_secs),
            report_interval: Duration::from_millis(yaml.report_interval_ms.max(1)),
            device_handshake_timeout: Duration::from_millis(yaml.device_handshake_timeout_ms),
            max_decode_retries: yaml.max_decode_retries,
            waveform_points: yaml.waveform_points,
            cache_dir: yaml
                .cache_dir
                .unwrap_or_else(|| sluice_dir.join("cache")),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_db >= 0.0 {
            return Err(ConfigError::Config(format!(
                "min_db must be negative, got {}",
                self.min_db
            )));
        }
        if self.waveform_points == 0 {
            return Err(ConfigError::Config("waveform_points must be > 0".into()));
        }
        Ok(())
    }
}
