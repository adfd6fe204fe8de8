use attendly_core::{DistanceMetric, PipelineConfig, RetryPolicy};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Daemon configuration: optional TOML file, then `ATTENDLY_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path.
    pub camera_device: String,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum distance for a positive match.
    pub tolerance: f32,
    pub metric: DistanceMetric,
    pub session_timeout_secs: u64,
    pub cooldown_secs: u64,
    pub sample_interval_ms: u64,
    pub max_faces_per_frame: usize,
    /// Faces smaller than this (pixels, shorter side) are not encoded.
    pub min_face_size: u32,
    pub sink_max_attempts: u32,
    /// Serve on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_home().join("attendly");
        Self {
            camera_device: "/dev/video0".to_string(),
            frame_width: 640,
            frame_height: 480,
            model_dir: data_dir.join("models"),
            db_path: data_dir.join("attendance.db"),
            tolerance: 0.6,
            metric: DistanceMetric::Cosine,
            session_timeout_secs: 300,
            cooldown_secs: 60,
            sample_interval_ms: 100,
            max_faces_per_frame: 10,
            min_face_size: 50,
            sink_max_attempts: RetryPolicy::default().max_attempts,
            system_bus: false,
        }
    }
}

impl Config {
    /// Load from `ATTENDLY_CONFIG` or `$XDG_CONFIG_HOME/attendly/config.toml`
    /// (missing file means defaults), then apply environment overrides.
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = std::env::var("ATTENDLY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_home().join("attendly/config.toml"));

        let mut config = if path.exists() {
            let config = Self::from_file(&path)?;
            tracing::info!(path = %path.display(), "loaded config file");
            config
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigLoadError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigLoadError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ATTENDLY_*` variables. Unparseable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ATTENDLY_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = var("ATTENDLY_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTENDLY_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        env_parse(&var, "ATTENDLY_FRAME_WIDTH", &mut self.frame_width);
        env_parse(&var, "ATTENDLY_FRAME_HEIGHT", &mut self.frame_height);
        env_parse(&var, "ATTENDLY_TOLERANCE", &mut self.tolerance);
        env_parse(&var, "ATTENDLY_METRIC", &mut self.metric);
        env_parse(&var, "ATTENDLY_SESSION_TIMEOUT_SECS", &mut self.session_timeout_secs);
        env_parse(&var, "ATTENDLY_COOLDOWN_SECS", &mut self.cooldown_secs);
        env_parse(&var, "ATTENDLY_SAMPLE_INTERVAL_MS", &mut self.sample_interval_ms);
        env_parse(&var, "ATTENDLY_MAX_FACES", &mut self.max_faces_per_frame);
        env_parse(&var, "ATTENDLY_MIN_FACE_SIZE", &mut self.min_face_size);
        env_parse(&var, "ATTENDLY_SINK_MAX_ATTEMPTS", &mut self.sink_max_attempts);
        if let Some(v) = var("ATTENDLY_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            tolerance: self.tolerance,
            metric: self.metric,
            session_timeout: Duration::from_secs(self.session_timeout_secs),
            cooldown_period: Duration::from_secs(self.cooldown_secs),
            sample_interval: Duration::from_millis(self.sample_interval_ms),
            max_faces_per_frame: self.max_faces_per_frame,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sink_max_attempts,
            ..RetryPolicy::default()
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir.join("det_10g.onnx").to_string_lossy().into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir.join("w600k_r50.onnx").to_string_lossy().into_owned()
    }
}

fn env_parse<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable environment override"),
    }
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
}

fn config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
}
