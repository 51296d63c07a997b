use crate::debounce::DEFAULT_COOLDOWN;
use crate::matcher::DEFAULT_TOLERANCE;
use crate::pipeline::DEFAULT_BATCH_STRIDE;
use crate::types::DEFAULT_EMBEDDING_DIM;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Service configuration.
///
/// Resolution order: built-in defaults, then the TOML file named by
/// `ROLLCALL_CONFIG` (if set), then individual `ROLLCALL_*` variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gallery JSON file.
    pub gallery_path: PathBuf,
    /// Embedding dimensionality the gallery enforces.
    pub embedding_dim: usize,
    /// Maximum Euclidean distance accepted as a match.
    pub tolerance: f32,
    /// Cool-down between two accepted marks of one identity on the live path.
    pub debounce_secs: u64,
    /// Live loop processes every Nth frame.
    pub live_stride: usize,
    /// Default sampling stride for batch runs.
    pub batch_stride: usize,
    /// Primary attendance store. Unset = fallback file only.
    pub primary_db_path: Option<PathBuf>,
    /// Hard deadline for one backend operation.
    pub backend_timeout_ms: u64,
    /// Deadline for the primary reachability probe.
    pub probe_timeout_ms: u64,
    /// Fallback attendance JSON file.
    pub fallback_path: PathBuf,
    /// Group (class) stamped on attendance records from this instance.
    pub group_id: Option<String>,
    /// JSON-lines frame feed for the live loop. Unset = stdin.
    pub feed_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            gallery_path: data_dir.join("gallery.json"),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            tolerance: DEFAULT_TOLERANCE,
            debounce_secs: DEFAULT_COOLDOWN.as_secs(),
            live_stride: 2,
            batch_stride: DEFAULT_BATCH_STRIDE,
            primary_db_path: None,
            backend_timeout_ms: 2000,
            probe_timeout_ms: 500,
            fallback_path: data_dir.join("attendance_records.json"),
            group_id: None,
            feed_path: None,
        }
    }
}

impl Config {
    /// Defaults, overlaid with `ROLLCALL_CONFIG` and then `ROLLCALL_*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("ROLLCALL_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Read a TOML file; keys it omits keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Override fields from `ROLLCALL_*` environment variables.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ROLLCALL_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(v);
        }
        self.embedding_dim = env_parse("ROLLCALL_EMBEDDING_DIM", self.embedding_dim);
        self.tolerance = env_parse("ROLLCALL_TOLERANCE", self.tolerance);
        self.debounce_secs = env_parse("ROLLCALL_DEBOUNCE_SECS", self.debounce_secs);
        self.live_stride = env_parse("ROLLCALL_LIVE_STRIDE", self.live_stride);
        self.batch_stride = env_parse("ROLLCALL_BATCH_STRIDE", self.batch_stride);
        if let Ok(v) = std::env::var("ROLLCALL_PRIMARY_DB") {
            self.primary_db_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        self.backend_timeout_ms = env_parse("ROLLCALL_BACKEND_TIMEOUT_MS", self.backend_timeout_ms);
        self.probe_timeout_ms = env_parse("ROLLCALL_PROBE_TIMEOUT_MS", self.probe_timeout_ms);
        if let Ok(v) = std::env::var("ROLLCALL_FALLBACK_PATH") {
            self.fallback_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_GROUP_ID") {
            self.group_id = (!v.is_empty()).then_some(v);
        }
        if let Ok(v) = std::env::var("ROLLCALL_FEED") {
            self.feed_path = (!v.is_empty() && v != "-").then(|| PathBuf::from(v));
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
