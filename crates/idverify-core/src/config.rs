use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::geometry::Size;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Camera configuration: preview view, explicit size, device selection,
/// rotation and mirroring.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Preview view width, used to pick the best-fitting capture size.
    pub view_width: Option<u32>,
    pub view_height: Option<u32>,
    /// Explicit capture size, honored when the device supports it.
    pub requested_width: Option<u32>,
    pub requested_height: Option<u32>,
    /// Device to open. Defaults to the highest-numbered device.
    pub camera_id: Option<usize>,
    /// Display rotation in quarter-turn steps (0..=3).
    pub device_rotation: u32,
    /// Extra rotation in degrees for devices mounted unusually.
    pub additional_rotation: i32,
    /// Mirror the preview.
    pub mirror: bool,
    /// Flip overlay rectangles horizontally.
    pub mirror_horizontal: bool,
    /// Flip overlay rectangles vertically.
    pub mirror_vertical: bool,
}

impl CaptureConfig {
    pub fn view_size(&self) -> Option<Size> {
        match (self.view_width, self.view_height) {
            (Some(w), Some(h)) => Some(Size::new(w, h)),
            _ => None,
        }
    }

    pub fn requested_size(&self) -> Option<Size> {
        match (self.requested_width, self.requested_height) {
            (Some(w), Some(h)) => Some(Size::new(w, h)),
            _ => None,
        }
    }
}

/// Verification configuration.
///
/// Loaded from built-in defaults, then an optional TOML file, then
/// `IDVERIFY_*` environment variables.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct VerifyConfig {
    /// Similarity a comparison must strictly exceed to pass.
    pub similarity_threshold: f32,
    /// How long an armed reference waits for a live match.
    pub read_timeout_ms: u64,
    /// How long a result stays on screen before returning to idle.
    pub restart_delay_ms: u64,
    /// Interval of the repeating "look at the camera" prompt.
    pub prompt_interval_ms: u64,
    /// Age after which an unanswered extraction request may be reissued.
    /// Zero waits forever.
    pub request_timeout_ms: u64,
    /// Pending extraction requests queued to the engine.
    pub extract_queue_size: usize,
    /// Frames buffered between the capture thread and the orchestrator.
    /// Frames arriving while the buffer is full are dropped.
    pub frame_queue_size: usize,
    /// Card reader polling interval.
    pub reader_poll_ms: u64,
    pub capture: CaptureConfig,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.82,
            read_timeout_ms: 5000,
            restart_delay_ms: 3000,
            prompt_interval_ms: 500,
            request_timeout_ms: 10_000,
            extract_queue_size: 5,
            frame_queue_size: 2,
            reader_poll_ms: 100,
            capture: CaptureConfig::default(),
        }
    }
}

impl VerifyConfig {
    /// Load configuration: defaults, then `path` (if any), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `IDVERIFY_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        set_parsed(&lookup, "IDVERIFY_SIMILARITY_THRESHOLD", &mut self.similarity_threshold);
        set_parsed(&lookup, "IDVERIFY_READ_TIMEOUT_MS", &mut self.read_timeout_ms);
        set_parsed(&lookup, "IDVERIFY_RESTART_DELAY_MS", &mut self.restart_delay_ms);
        set_parsed(&lookup, "IDVERIFY_PROMPT_INTERVAL_MS", &mut self.prompt_interval_ms);
        set_parsed(&lookup, "IDVERIFY_REQUEST_TIMEOUT_MS", &mut self.request_timeout_ms);
        set_parsed(&lookup, "IDVERIFY_EXTRACT_QUEUE_SIZE", &mut self.extract_queue_size);
        set_parsed(&lookup, "IDVERIFY_FRAME_QUEUE_SIZE", &mut self.frame_queue_size);
        set_parsed(&lookup, "IDVERIFY_READER_POLL_MS", &mut self.reader_poll_ms);

        let capture = &mut self.capture;
        set_parsed_opt(&lookup, "IDVERIFY_CAMERA_ID", &mut capture.camera_id);
        set_parsed_opt(&lookup, "IDVERIFY_VIEW_WIDTH", &mut capture.view_width);
        set_parsed_opt(&lookup, "IDVERIFY_VIEW_HEIGHT", &mut capture.view_height);
        set_parsed_opt(&lookup, "IDVERIFY_REQUESTED_WIDTH", &mut capture.requested_width);
        set_parsed_opt(&lookup, "IDVERIFY_REQUESTED_HEIGHT", &mut capture.requested_height);
        set_parsed(&lookup, "IDVERIFY_DEVICE_ROTATION", &mut capture.device_rotation);
        set_parsed(&lookup, "IDVERIFY_ADDITIONAL_ROTATION", &mut capture.additional_rotation);
        set_flag(&lookup, "IDVERIFY_MIRROR", &mut capture.mirror);
        set_flag(&lookup, "IDVERIFY_MIRROR_HORIZONTAL", &mut capture.mirror_horizontal);
        set_flag(&lookup, "IDVERIFY_MIRROR_VERTICAL", &mut capture.mirror_vertical);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.similarity_threshold > 0.0 && self.similarity_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "similarity_threshold must be in (0, 1], got {}",
                self.similarity_threshold
            )));
        }
        for (name, value) in [
            ("read_timeout_ms", self.read_timeout_ms),
            ("restart_delay_ms", self.restart_delay_ms),
            ("prompt_interval_ms", self.prompt_interval_ms),
            ("reader_poll_ms", self.reader_poll_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.extract_queue_size == 0 || self.frame_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "queue sizes must be non-zero".to_string(),
            ));
        }
        if self.capture.device_rotation > 3 {
            return Err(ConfigError::Invalid(format!(
                "device_rotation is in quarter turns (0..=3), got {}",
                self.capture.device_rotation
            )));
        }
        if self.capture.view_width.is_some() != self.capture.view_height.is_some() {
            return Err(ConfigError::Invalid(
                "view_width and view_height must be set together".to_string(),
            ));
        }
        if self.capture.requested_width.is_some() != self.capture.requested_height.is_some() {
            return Err(ConfigError::Invalid(
                "requested_width and requested_height must be set together".to_string(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn prompt_interval(&self) -> Duration {
        Duration::from_millis(self.prompt_interval_ms)
    }

    /// `None` when unanswered requests are never reissued.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn reader_poll(&self) -> Duration {
        Duration::from_millis(self.reader_poll_ms)
    }
}

fn set_parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut T,
) {
    if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *field = v;
    }
}

fn set_parsed_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    field: &mut Option<T>,
) {
    if let Some(v) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *field = Some(v);
    }
}

/// Any value but `0` sets the flag.
fn set_flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, field: &mut bool) {
    if let Some(v) = lookup(key) {
        *field = v.trim() != "0";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = VerifyConfig::default();
        assert!((config.similarity_threshold - 0.82).abs() < f32::EPSILON);
        assert_eq!(config.read_timeout(), Duration::from_millis(5000));
        assert_eq!(config.restart_delay(), Duration::from_millis(3000));
        assert_eq!(config.prompt_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = VerifyConfig::from_toml_str(
            r#"
            similarity_threshold = 0.9

            [capture]
            view_width = 1280
            view_height = 720
            mirror = true
            "#,
        )
        .unwrap();
        assert!((config.similarity_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.read_timeout_ms, 5000);
        assert_eq!(config.capture.view_size(), Some(Size::new(1280, 720)));
        assert_eq!(config.capture.requested_size(), None);
        assert!(config.capture.mirror);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("IDVERIFY_READ_TIMEOUT_MS", "7000"),
            ("IDVERIFY_CAMERA_ID", "1"),
            ("IDVERIFY_MIRROR", "1"),
            ("IDVERIFY_MIRROR_HORIZONTAL", "1"),
            ("IDVERIFY_MIRROR_VERTICAL", "0"),
            ("IDVERIFY_RESTART_DELAY_MS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let mut config = VerifyConfig::default();
        config.capture.mirror_vertical = true;
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.read_timeout_ms, 7000);
        assert_eq!(config.capture.camera_id, Some(1));
        assert!(config.capture.mirror);
        assert!(config.capture.mirror_horizontal);
        assert!(!config.capture.mirror_vertical);
        // Unparseable values leave the default in place.
        assert_eq!(config.restart_delay_ms, 3000);
    }

    #[test]
    fn test_zero_request_timeout_disables() {
        let config = VerifyConfig {
            request_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.request_timeout(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let bad_threshold = VerifyConfig {
            similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(matches!(
            bad_threshold.validate(),
            Err(ConfigError::Invalid(_))
        ));

        let zero_delay = VerifyConfig {
            restart_delay_ms: 0,
            ..Default::default()
        };
        assert!(zero_delay.validate().is_err());

        let mut half_view = VerifyConfig::default();
        half_view.capture.view_width = Some(640);
        assert!(half_view.validate().is_err());

        let mut bad_rotation = VerifyConfig::default();
        bad_rotation.capture.device_rotation = 4;
        assert!(bad_rotation.validate().is_err());
    }

    #[test]
    fn test_unknown_types_fail_to_parse() {
        let err = VerifyConfig::from_toml_str("read_timeout_ms = \"soon\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
