use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::analytics::{is_known_class, DetectParams};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration for stream '{stream}': {reason}")]
    Invalid { stream: String, reason: String },
    #[error("duplicate stream id '{0}'")]
    DuplicateStream(String),
}

impl ConfigError {
    fn invalid(stream: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            stream: stream.to_string(),
            reason: reason.into(),
        }
    }
}

fn default_http_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_intra_threads() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsConfig {
    #[serde(default = "default_models_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: default_models_dir(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_max_distance() -> f32 {
    50.0
}

fn default_min_confidence() -> f32 {
    0.3
}

fn default_max_age() -> u32 {
    30
}

fn default_min_hits() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TrackingConfig {
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f32,
    #[serde(default = "default_max_age")]
    pub max_age: u32,
    #[serde(default = "default_min_hits")]
    pub min_hits: u32,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            max_distance: default_max_distance(),
            min_confidence: default_min_confidence(),
            max_age: default_max_age(),
            min_hits: default_min_hits(),
        }
    }
}

fn default_reconnect_attempts() -> u32 {
    3
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RtspConfig {
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive missed reads treated as a lost capture; 0 never gives up.
    #[serde(default)]
    pub max_missed_reads: u32,
}

impl RtspConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_delay_secs: default_reconnect_delay(),
            timeout_ms: default_timeout_ms(),
            max_missed_reads: 0,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_frames_per_day() -> u32 {
    1000
}

fn default_jpeg_quality() -> i32 {
    85
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SaveConfig {
    #[serde(default = "default_true")]
    pub save_frames: bool,
    #[serde(default)]
    pub save_all_frames: bool,
    #[serde(default = "default_max_frames_per_day")]
    pub max_frames_per_day: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: i32,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            save_frames: true,
            save_all_frames: false,
            max_frames_per_day: default_max_frames_per_day(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertRule {
    MaxCount { class_id: u32, max: usize },
    Dwell { class_id: u32, min_frames: u32 },
}

impl AlertRule {
    pub fn class_id(&self) -> u32 {
        match self {
            AlertRule::MaxCount { class_id, .. } | AlertRule::Dwell { class_id, .. } => *class_id,
        }
    }
}

fn default_model_name() -> String {
    "yolov8n.onnx".to_string()
}

fn default_confidence_threshold() -> f32 {
    0.5
}

fn default_classes() -> Vec<u32> {
    vec![0]
}

fn default_image_size() -> u32 {
    640
}

fn default_process_every_n_frames() -> u32 {
    1
}

fn default_frame_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub url: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_classes")]
    pub classes: Vec<u32>,
    #[serde(default = "default_image_size")]
    pub image_size: u32,
    #[serde(default = "default_process_every_n_frames")]
    pub process_every_n_frames: u32,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub rtsp: RtspConfig,
    #[serde(default)]
    pub save: SaveConfig,
    #[serde(default)]
    pub alerts: Vec<AlertRule>,
}

impl StreamConfig {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            output_dir: None,
            model_name: default_model_name(),
            confidence_threshold: default_confidence_threshold(),
            classes: default_classes(),
            image_size: default_image_size(),
            process_every_n_frames: default_process_every_n_frames(),
            frame_interval_ms: default_frame_interval_ms(),
            tracking: TrackingConfig::default(),
            rtsp: RtspConfig::default(),
            save: SaveConfig::default(),
            alerts: Vec::new(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("detections").join(&self.id))
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn detect_params(&self) -> DetectParams {
        DetectParams {
            confidence_threshold: self.confidence_threshold,
            classes: self.classes.clone(),
            image_size: self.image_size,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let id = self.id.as_str();

        if id.trim().is_empty() {
            return Err(ConfigError::invalid(id, "stream id is empty"));
        }
        if id.contains(['/', '\\']) || id == "." || id == ".." {
            return Err(ConfigError::invalid(id, "stream id is not a valid path component"));
        }
        if self.url.trim().is_empty() {
            return Err(ConfigError::invalid(id, "url is empty"));
        }
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::invalid(id, "model_name is empty"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::invalid(
                id,
                format!(
                    "confidence_threshold {} outside [0, 1]",
                    self.confidence_threshold
                ),
            ));
        }
        if let Some(class_id) = self.classes.iter().find(|c| !is_known_class(**c)) {
            return Err(ConfigError::invalid(
                id,
                format!("unknown class id {}", class_id),
            ));
        }
        if self.image_size == 0 {
            return Err(ConfigError::invalid(id, "image_size must be positive"));
        }
        if self.process_every_n_frames == 0 {
            return Err(ConfigError::invalid(
                id,
                "process_every_n_frames must be at least 1",
            ));
        }

        let tracking = &self.tracking;
        if tracking.max_distance.is_nan() || tracking.max_distance <= 0.0 {
            return Err(ConfigError::invalid(id, "tracking.max_distance must be positive"));
        }
        if !(0.0..=1.0).contains(&tracking.min_confidence) {
            return Err(ConfigError::invalid(
                id,
                "tracking.min_confidence outside [0, 1]",
            ));
        }
        if tracking.min_hits == 0 {
            return Err(ConfigError::invalid(id, "tracking.min_hits must be at least 1"));
        }

        if self.rtsp.reconnect_attempts == 0 {
            return Err(ConfigError::invalid(
                id,
                "rtsp.reconnect_attempts must be at least 1",
            ));
        }
        if !(0..=100).contains(&self.save.jpeg_quality) {
            return Err(ConfigError::invalid(id, "save.jpeg_quality outside [0, 100]"));
        }

        for rule in &self.alerts {
            if !is_known_class(rule.class_id()) {
                return Err(ConfigError::invalid(
                    id,
                    format!("alert rule references unknown class id {}", rule.class_id()),
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        let mut seen = HashSet::new();
        for stream in &config.streams {
            stream.validate()?;
            if !seen.insert(stream.id.as_str()) {
                return Err(ConfigError::DuplicateStream(stream.id.clone()));
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_defaults_match_documented_values() {
        let config = Config::parse(
            r#"
            [[streams]]
            id = "lobby"
            url = "rtsp://127.0.0.1:8554/lobby"
            "#,
        )
        .unwrap();

        assert_eq!(config.http.port, 8000);
        let stream = &config.streams[0];
        assert_eq!(stream.model_name, "yolov8n.onnx");
        assert_eq!(stream.confidence_threshold, 0.5);
        assert_eq!(stream.classes, vec![0]);
        assert_eq!(stream.image_size, 640);
        assert_eq!(stream.process_every_n_frames, 1);
        assert_eq!(stream.tracking, TrackingConfig::default());
        assert_eq!(stream.rtsp.reconnect_attempts, 3);
        assert_eq!(stream.rtsp.reconnect_delay(), Duration::from_secs(5));
        assert_eq!(stream.output_dir(), PathBuf::from("detections/lobby"));
        assert!(stream.save.save_frames);
    }

    #[test]
    fn parses_nested_sections_and_alert_rules() {
        let config = Config::parse(
            r#"
            [http]
            port = 9000

            [[streams]]
            id = "gate"
            url = "rtsp://cam/gate"
            classes = [0, 2]

            [streams.tracking]
            max_distance = 80.0
            min_hits = 2

            [streams.rtsp]
            reconnect_attempts = 5

            [[streams.alerts]]
            kind = "max_count"
            class_id = 2
            max = 10

            [[streams.alerts]]
            kind = "dwell"
            class_id = 0
            min_frames = 300
            "#,
        )
        .unwrap();

        let stream = &config.streams[0];
        assert_eq!(config.http.port, 9000);
        assert_eq!(stream.tracking.max_distance, 80.0);
        assert_eq!(stream.tracking.min_hits, 2);
        assert_eq!(stream.tracking.max_age, 30);
        assert_eq!(stream.rtsp.reconnect_attempts, 5);
        assert_eq!(
            stream.alerts,
            vec![
                AlertRule::MaxCount { class_id: 2, max: 10 },
                AlertRule::Dwell {
                    class_id: 0,
                    min_frames: 300
                },
            ]
        );
    }

    #[test]
    fn rejects_unknown_class() {
        let mut stream = StreamConfig::new("a", "rtsp://x");
        stream.classes = vec![0, 99];
        assert!(matches!(stream.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_zero_decimation_and_zero_attempts() {
        let mut stream = StreamConfig::new("a", "rtsp://x");
        stream.process_every_n_frames = 0;
        assert!(stream.validate().is_err());

        let mut stream = StreamConfig::new("a", "rtsp://x");
        stream.rtsp.reconnect_attempts = 0;
        assert!(stream.validate().is_err());
    }

    #[test]
    fn rejects_path_like_ids() {
        assert!(StreamConfig::new("../etc", "rtsp://x").validate().is_err());
        assert!(StreamConfig::new("", "rtsp://x").validate().is_err());
    }

    #[test]
    fn rejects_duplicate_stream_ids() {
        let result = Config::parse(
            r#"
            [[streams]]
            id = "a"
            url = "rtsp://one"

            [[streams]]
            id = "a"
            url = "rtsp://two"
            "#,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateStream(id)) if id == "a"));
    }

    #[test]
    fn no_streams_is_allowed() {
        let config = Config::parse("").unwrap();
        assert!(config.streams.is_empty());
    }
}
