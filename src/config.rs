use crate::engine::ExecutionTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Default location of the LaMa inpainting graph
pub const DEFAULT_MODEL_URL: &str =
    "https://huggingface.co/Carve/LaMa-ONNX/resolve/main/lama_fp32.onnx";

/// Default value of the `Origin` header sent with model downloads
pub const DEFAULT_ORIGIN: &str = "http://localhost:3000";

/// Default model cache directory
pub const DEFAULT_CACHE_DIR: &str = "./model_cache";

/// Side length of the square model input
pub const DEFAULT_IMAGE_SIZE: u32 = 512;

/// Prefix of environment variables read by [`WorkerConfig::from_env`]
pub const ENV_PREFIX: &str = "INPAINT_";

/// Configuration keys
pub const CONFIG_MODEL_URL_KEY: &str = "MODEL_URL";
pub const CONFIG_MODEL_SHA256_KEY: &str = "MODEL_SHA256";
pub const CONFIG_ORIGIN_KEY: &str = "ORIGIN";
pub const CONFIG_CACHE_DIR_KEY: &str = "CACHE_DIR";
pub const CONFIG_TARGETS_KEY: &str = "EXECUTION_TARGETS";
pub const CONFIG_IMAGE_SIZE_KEY: &str = "IMAGE_SIZE";
pub const CONFIG_DOWNLOAD_TIMEOUT_KEY: &str = "DOWNLOAD_TIMEOUT_SECS";
pub const CONFIG_SESSION_TIMEOUT_KEY: &str = "SESSION_TIMEOUT_SECS";
pub const CONFIG_INFER_TIMEOUT_KEY: &str = "INFER_TIMEOUT_SECS";
pub const CONFIG_MAX_RETRIES_KEY: &str = "MAX_RETRIES";
pub const CONFIG_DOWNLOAD_PROGRESS_KEY: &str = "DOWNLOAD_PROGRESS";

/// Bounded exponential backoff for model downloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Upper bounds for every long-running step of the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub download: Duration,
    pub session: Duration,
    pub infer: Duration,
    pub connect: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(600),
            session: Duration::from_secs(120),
            infer: Duration::from_secs(120),
            connect: Duration::from_secs(10),
        }
    }
}

/// Configuration of one inpainting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub model_url: String,
    /// Lowercase hex SHA-256 the model must match, if known
    pub model_sha256: Option<String>,
    pub origin: String,
    /// `None` keeps the model in memory only
    pub cache_dir: Option<PathBuf>,
    /// Execution targets in order of preference
    pub targets: Vec<ExecutionTarget>,
    pub image_size: u32,
    /// Send `downloadProgress` payloads while the model downloads. Off by
    /// default, so a `ping` yields only the three base payloads.
    pub download_progress: bool,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            model_url: DEFAULT_MODEL_URL.to_string(),
            model_sha256: None,
            origin: DEFAULT_ORIGIN.to_string(),
            cache_dir: Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            targets: vec![ExecutionTarget::Cpu],
            image_size: DEFAULT_IMAGE_SIZE,
            download_progress: false,
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value '{value}' for configuration key '{key}'")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
}

impl TryFrom<&HashMap<String, String>> for WorkerConfig {
    type Error = ConfigError;

    /// Construct the configuration from key/value pairs, keeping defaults for
    /// absent keys.
    fn try_from(values: &HashMap<String, String>) -> Result<WorkerConfig, ConfigError> {
        let mut config = WorkerConfig::default();

        if let Some(url) = values.get(CONFIG_MODEL_URL_KEY) {
            config.model_url = url.clone();
        }

        if let Some(digest) = values.get(CONFIG_MODEL_SHA256_KEY) {
            config.model_sha256 = Some(digest.trim().to_lowercase());
        }

        if let Some(origin) = values.get(CONFIG_ORIGIN_KEY) {
            config.origin = origin.clone();
        }

        if let Some(dir) = values.get(CONFIG_CACHE_DIR_KEY) {
            config.cache_dir = match dir.trim() {
                "" | "none" | "memory" => None,
                path => Some(PathBuf::from(path)),
            };
        }

        if let Some(targets) = values.get(CONFIG_TARGETS_KEY) {
            config.targets = parse_targets(targets).map_err(|_| ConfigError {
                key: CONFIG_TARGETS_KEY.to_string(),
                value: targets.clone(),
            })?;
        }

        if let Some(size) = parse_number::<u32>(values, CONFIG_IMAGE_SIZE_KEY)? {
            if size == 0 {
                return Err(ConfigError {
                    key: CONFIG_IMAGE_SIZE_KEY.to_string(),
                    value: size.to_string(),
                });
            }
            config.image_size = size;
        }

        if let Some(secs) = parse_number::<u64>(values, CONFIG_DOWNLOAD_TIMEOUT_KEY)? {
            config.timeouts.download = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number::<u64>(values, CONFIG_SESSION_TIMEOUT_KEY)? {
            config.timeouts.session = Duration::from_secs(secs);
        }

        if let Some(secs) = parse_number::<u64>(values, CONFIG_INFER_TIMEOUT_KEY)? {
            config.timeouts.infer = Duration::from_secs(secs);
        }

        if let Some(retries) = parse_number::<u32>(values, CONFIG_MAX_RETRIES_KEY)? {
            config.retry.max_retries = retries;
        }

        if let Some(enabled) = parse_number::<bool>(values, CONFIG_DOWNLOAD_PROGRESS_KEY)? {
            config.download_progress = enabled;
        }

        Ok(config)
    }
}

impl WorkerConfig {
    /// Read `INPAINT_*` variables from the process environment.
    pub fn from_env() -> Result<WorkerConfig, ConfigError> {
        let values: HashMap<String, String> = std::env::vars()
            .filter_map(|(k, v)| k.strip_prefix(ENV_PREFIX).map(|k| (k.to_string(), v)))
            .collect();

        WorkerConfig::try_from(&values)
    }
}

fn parse_targets(list: &str) -> Result<Vec<ExecutionTarget>, ()> {
    let targets = list
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| ExecutionTarget::from_str(t).map_err(|_| ()))
        .collect::<Result<Vec<_>, _>>()?;

    if targets.is_empty() {
        Err(())
    } else {
        Ok(targets)
    }
}

fn parse_number<T: FromStr>(
    values: &HashMap<String, String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    values
        .get(key)
        .map(|v| {
            v.trim().parse::<T>().map_err(|_| ConfigError {
                key: key.to_string(),
                value: v.clone(),
            })
        })
        .transpose()
}
