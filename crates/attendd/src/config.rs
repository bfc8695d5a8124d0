use attend_core::debounce::{DebounceConfig, WindowScope};
use attend_core::matcher::Thresholds;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration: defaults, then an optional TOML file, then `ATTEND_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Minimum cosine similarity for a per-frame match.
    pub similarity_threshold: f32,
    /// Maximum Euclidean distance for a per-frame match.
    pub distance_threshold: f32,
    /// Frames kept in each debounce window.
    pub window_capacity: usize,
    /// Occurrences of one member required anywhere in the window.
    pub consensus_count: usize,
    /// Most recent frames that must all be that member.
    pub recency_count: usize,
    /// One shared window, or one per station.
    pub window_scope: WindowScope,
    /// Seconds a recognition stays confirmable at the kiosk.
    pub confirm_timeout_secs: u64,
    /// Upper bound on images per enrollment request.
    pub max_enroll_images: usize,
    /// Serve on the session bus instead of the system bus.
    pub session_bus: bool,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("attend");

        let thresholds = Thresholds::default();
        let debounce = DebounceConfig::default();

        Self {
            model_dir: PathBuf::from(attend_core::default_model_dir()),
            db_path: data_dir.join("attend.db"),
            similarity_threshold: thresholds.similarity,
            distance_threshold: thresholds.distance,
            window_capacity: debounce.capacity,
            consensus_count: debounce.consensus,
            recency_count: debounce.recency,
            window_scope: WindowScope::default(),
            confirm_timeout_secs: 30,
            max_enroll_images: 3,
            session_bus: false,
        }
    }
}

impl Config {
    /// Load the file named by `ATTEND_CONFIG` (if any), then apply the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ATTEND_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ATTEND_*` variables. Unparsable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(v) = var("ATTEND_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = var("ATTEND_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        override_parsed(&var, "ATTEND_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        override_parsed(&var, "ATTEND_DISTANCE_THRESHOLD", &mut self.distance_threshold);
        override_parsed(&var, "ATTEND_WINDOW_CAPACITY", &mut self.window_capacity);
        override_parsed(&var, "ATTEND_CONSENSUS_COUNT", &mut self.consensus_count);
        override_parsed(&var, "ATTEND_RECENCY_COUNT", &mut self.recency_count);
        override_parsed(&var, "ATTEND_WINDOW_SCOPE", &mut self.window_scope);
        override_parsed(&var, "ATTEND_CONFIRM_TIMEOUT_SECS", &mut self.confirm_timeout_secs);
        override_parsed(&var, "ATTEND_MAX_ENROLL_IMAGES", &mut self.max_enroll_images);
        if let Some(v) = var("ATTEND_SESSION_BUS") {
            self.session_bus = matches!(v.trim(), "1" | "true" | "yes");
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_capacity == 0 {
            return Err(ConfigError::Invalid("window_capacity must be at least 1".into()));
        }
        if self.consensus_count == 0 || self.consensus_count > self.window_capacity {
            return Err(ConfigError::Invalid(format!(
                "consensus_count must be in 1..={}",
                self.window_capacity
            )));
        }
        if self.recency_count == 0 || self.recency_count > self.window_capacity {
            return Err(ConfigError::Invalid(format!(
                "recency_count must be in 1..={}",
                self.window_capacity
            )));
        }
        if !self.similarity_threshold.is_finite() || !self.distance_threshold.is_finite() {
            return Err(ConfigError::Invalid("thresholds must be finite".into()));
        }
        if self.max_enroll_images == 0 {
            return Err(ConfigError::Invalid("max_enroll_images must be at least 1".into()));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            similarity: self.similarity_threshold,
            distance: self.distance_threshold,
        }
    }

    pub fn debounce(&self) -> DebounceConfig {
        DebounceConfig {
            capacity: self.window_capacity,
            consensus: self.consensus_count,
            recency: self.recency_count,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(attend_core::DETECTOR_MODEL)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(attend_core::RECOGNIZER_MODEL)
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: std::str::FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(raw) = var(key) {
        match raw.trim().parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable config value"),
        }
    }
}
