use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration.
///
/// Built-in defaults, then an optional TOML file, then `GREETER_*`
/// environment variables on top.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Camera index, opened as `/dev/video{N}`.
    pub camera_index: u32,
    pub frame_width: u32,
    pub frame_height: u32,
    /// Frame sampler cadence (frames per second).
    pub capture_fps: f32,
    /// How long one capture may wait for a buffer, in milliseconds.
    pub capture_timeout_ms: u64,
    /// Buffered frames older than this are not verified against. 0 disables.
    pub max_frame_age_ms: u64,
    /// Verification tick cadence while a session runs.
    pub checks_per_second: f32,
    /// Euclidean distance cutoff; matches must be strictly closer.
    pub match_threshold: f32,
    /// Frames are shrunk by this factor before extraction.
    pub downscale: u32,
    /// Cancel a session after this many seconds without a face. 0 disables.
    pub max_session_secs: u64,
    /// `.json` for a flat file, anything else is opened as SQLite.
    pub registry_path: PathBuf,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Text-to-speech program; empty logs greetings instead of speaking.
    pub speech_command: String,
    /// Greeting template, `{name}` is replaced by the resolved name.
    pub greeting: String,
    /// Name announced when the face is not recognized.
    pub unknown_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_index: 0,
            frame_width: greeter_hw::camera::DEFAULT_WIDTH,
            frame_height: greeter_hw::camera::DEFAULT_HEIGHT,
            capture_fps: 33.0,
            capture_timeout_ms: 10,
            max_frame_age_ms: 1000,
            checks_per_second: 30.0,
            match_threshold: greeter_core::DEFAULT_MATCH_THRESHOLD,
            downscale: 4,
            max_session_secs: 0,
            registry_path: data_dir().join("identities.db"),
            model_dir: PathBuf::from("/usr/share/greeter/models"),
            speech_command: "espeak-ng".to_string(),
            greeting: "Hello, {name}".to_string(),
            unknown_name: greeter_core::UNKNOWN_NAME.to_string(),
        }
    }
}

impl Config {
    /// Load from `GREETER_CONFIG` (or the XDG default path, if present),
    /// then apply environment overrides.
    pub fn load() -> Result<Self> {
        let path = std::env::var("GREETER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("greeter.toml"));

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `GREETER_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_parsed(&lookup, "GREETER_CAMERA_INDEX", &mut self.camera_index);
        override_parsed(&lookup, "GREETER_FRAME_WIDTH", &mut self.frame_width);
        override_parsed(&lookup, "GREETER_FRAME_HEIGHT", &mut self.frame_height);
        override_parsed(&lookup, "GREETER_CAPTURE_FPS", &mut self.capture_fps);
        override_parsed(&lookup, "GREETER_CAPTURE_TIMEOUT_MS", &mut self.capture_timeout_ms);
        override_parsed(&lookup, "GREETER_MAX_FRAME_AGE_MS", &mut self.max_frame_age_ms);
        override_parsed(&lookup, "GREETER_CHECKS_PER_SECOND", &mut self.checks_per_second);
        override_parsed(&lookup, "GREETER_MATCH_THRESHOLD", &mut self.match_threshold);
        override_parsed(&lookup, "GREETER_DOWNSCALE", &mut self.downscale);
        override_parsed(&lookup, "GREETER_MAX_SESSION_SECS", &mut self.max_session_secs);
        override_parsed(&lookup, "GREETER_REGISTRY_PATH", &mut self.registry_path);
        override_parsed(&lookup, "GREETER_MODEL_DIR", &mut self.model_dir);
        override_parsed(&lookup, "GREETER_SPEECH_COMMAND", &mut self.speech_command);
        override_parsed(&lookup, "GREETER_GREETING", &mut self.greeting);
        override_parsed(&lookup, "GREETER_UNKNOWN_NAME", &mut self.unknown_name);
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.capture_fps > 0.0 && self.capture_fps.is_finite()) {
            bail!("capture_fps must be positive, got {}", self.capture_fps);
        }
        if !(self.checks_per_second > 0.0 && self.checks_per_second.is_finite()) {
            bail!("checks_per_second must be positive, got {}", self.checks_per_second);
        }
        if !(self.match_threshold > 0.0 && self.match_threshold.is_finite()) {
            bail!("match_threshold must be positive, got {}", self.match_threshold);
        }
        if self.downscale == 0 {
            bail!("downscale must be at least 1");
        }
        Ok(())
    }

    pub fn capture_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.capture_fps)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.checks_per_second)
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn max_frame_age(&self) -> Option<Duration> {
        (self.max_frame_age_ms > 0).then(|| Duration::from_millis(self.max_frame_age_ms))
    }

    pub fn max_session(&self) -> Option<Duration> {
        (self.max_session_secs > 0).then(|| Duration::from_secs(self.max_session_secs))
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
    }
}

fn xdg_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var(var).map(PathBuf::from).unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        PathBuf::from(home).join(fallback)
    })
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", ".local/share").join("greeter")
}

fn config_dir() -> PathBuf {
    xdg_dir("XDG_CONFIG_HOME", ".config").join("greeter")
}
