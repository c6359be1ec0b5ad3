use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

fn default_feeds_path() -> PathBuf {
    PathBuf::from("config/feeds_config.json")
}

fn default_http_port() -> u16 {
    8080
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

fn default_frame_skip() -> u32 {
    3
}

fn default_frame_buffer() -> usize {
    60
}

fn default_result_buffer() -> usize {
    30
}

fn default_process_width() -> u32 {
    640
}

fn default_process_height() -> u32 {
    480
}

fn default_capture_width() -> u32 {
    1280
}

fn default_capture_height() -> u32 {
    720
}

fn default_open_attempts() -> u32 {
    5
}

fn default_open_retry_delay_ms() -> u64 {
    2000
}

fn default_reopen_delay_ms() -> u64 {
    100
}

fn default_frame_wait_ms() -> u64 {
    1000
}

fn default_join_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Process one of every `frame_skip` captured frames.
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u32,
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,
    #[serde(default = "default_result_buffer")]
    pub result_buffer: usize,
    #[serde(default = "default_process_width")]
    pub process_width: u32,
    #[serde(default = "default_process_height")]
    pub process_height: u32,
    /// Size ffmpeg scales decoded frames to before they enter the frame buffer.
    #[serde(default = "default_capture_width")]
    pub capture_width: u32,
    #[serde(default = "default_capture_height")]
    pub capture_height: u32,
    #[serde(default = "default_open_attempts")]
    pub open_attempts: u32,
    #[serde(default = "default_open_retry_delay_ms")]
    pub open_retry_delay_ms: u64,
    #[serde(default = "default_reopen_delay_ms")]
    pub reopen_delay_ms: u64,
    #[serde(default = "default_frame_wait_ms")]
    pub frame_wait_ms: u64,
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

impl PipelineConfig {
    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }

    pub fn reopen_delay(&self) -> Duration {
        Duration::from_millis(self.reopen_delay_ms)
    }

    pub fn frame_wait(&self) -> Duration {
        Duration::from_millis(self.frame_wait_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            frame_skip: default_frame_skip(),
            frame_buffer: default_frame_buffer(),
            result_buffer: default_result_buffer(),
            process_width: default_process_width(),
            process_height: default_process_height(),
            capture_width: default_capture_width(),
            capture_height: default_capture_height(),
            open_attempts: default_open_attempts(),
            open_retry_delay_ms: default_open_retry_delay_ms(),
            reopen_delay_ms: default_reopen_delay_ms(),
            frame_wait_ms: default_frame_wait_ms(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

fn default_max_disappeared() -> u32 {
    10
}

fn default_max_distance() -> f32 {
    50.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default = "default_max_disappeared")]
    pub max_disappeared: u32,
    #[serde(default = "default_max_distance")]
    pub max_distance: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_disappeared: default_max_disappeared(),
            max_distance: default_max_distance(),
        }
    }
}

fn default_model_path() -> String {
    "models/yolo26n.onnx".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_model_path")]
    pub model_path: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: default_model_path(),
        }
    }
}

fn default_queue_capacity() -> usize {
    50
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("plates_detected")
}

fn default_log_file() -> PathBuf {
    PathBuf::from("plates_log.csv")
}

fn default_min_text_len() -> usize {
    4
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognitionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Plate localizer model. Without one the whole vehicle crop is recognized.
    #[serde(default)]
    pub plate_model: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_log_file")]
    pub log_file: PathBuf,
    #[serde(default = "default_min_text_len")]
    pub min_text_len: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            queue_capacity: default_queue_capacity(),
            plate_model: None,
            endpoint: None,
            output_dir: default_output_dir(),
            log_file: default_log_file(),
            min_text_len: default_min_text_len(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_write_attempts() -> u32 {
    3
}

fn default_write_backoff_ms() -> u64 {
    50
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_write_backoff_ms")]
    pub write_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_attempts: default_write_attempts(),
            write_backoff_ms: default_write_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_feeds_path")]
    pub feeds_path: PathBuf,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognition: RecognitionConfig,
    #[serde(default)]
    pub store: StoreConfig,
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
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.frame_skip == 0 {
            return Err(ConfigError::Invalid("pipeline.frame_skip must be at least 1"));
        }
        if self.pipeline.frame_buffer == 0 || self.pipeline.result_buffer == 0 {
            return Err(ConfigError::Invalid("buffer capacities must be non-zero"));
        }
        if self.pipeline.process_width == 0 || self.pipeline.process_height == 0 {
            return Err(ConfigError::Invalid("processing resolution must be non-zero"));
        }
        if self.recognition.enabled && self.recognition.queue_capacity == 0 {
            return Err(ConfigError::Invalid("recognition.queue_capacity must be non-zero"));
        }
        if self.recognition.enabled && self.recognition.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "recognition.endpoint is required when recognition is enabled",
            ));
        }
        Ok(())
    }
}
