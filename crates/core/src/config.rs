//! Flowtest 配置系统
//!
//! 支持 YAML 配置文件和环境变量

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Environment variable that overrides `api.api_key`
pub const API_KEY_ENV: &str = "FLOWTEST_API_KEY";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Flowtest 主配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowtestConfig {
    /// API 配置
    pub api: ApiConfig,

    /// 执行配置
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,

    /// 输出配置
    #[serde(default)]
    pub output: OutputConfig,
}

impl FlowtestConfig {
    /// Load from a YAML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml_str(&content)?;
        config.apply_env_overrides_from(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse without validation.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: FlowtestConfig = serde_yaml::from_str(content)?;
        config.api.base_url = config.api.base_url.trim().trim_end_matches('/').to_string();
        Ok(config)
    }

    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = lookup(API_KEY_ENV).filter(|k| !k.trim().is_empty()) {
            self.api.api_key = key.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate()?;
        self.execution.validate()
    }
}

/// Response mode of the chat endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Blocking,
    #[default]
    Streaming,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Blocking => "blocking",
            ResponseMode::Streaming => "streaming",
        }
    }
}

impl std::fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResponseMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "blocking" => Ok(ResponseMode::Blocking),
            "streaming" => Ok(ResponseMode::Streaming),
            other => Err(ConfigError::Invalid(format!(
                "response_mode must be 'blocking' or 'streaming', got '{}'",
                other
            ))),
        }
    }
}

/// API 配置
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// 配置名称
    #[serde(default = "default_config_name")]
    pub name: String,

    /// API 基础 URL
    pub base_url: String,

    /// API Key (支持环境变量覆盖)
    #[serde(default)]
    pub api_key: String,

    /// 用户 ID
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// 请求超时 (秒)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// 响应模式
    #[serde(default)]
    pub response_mode: ResponseMode,
}

fn default_config_name() -> String {
    "default".to_string()
}

fn default_user_id() -> String {
    "test_user".to_string()
}

fn default_timeout() -> u64 {
    30
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let masked_key = if self.api_key.chars().count() > 8 {
            format!("{}***", self.api_key.chars().take(4).collect::<String>())
        } else {
            "***".to_string()
        };
        f.debug_struct("ApiConfig")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("api_key", &masked_key)
            .field("user_id", &self.user_id)
            .field("timeout_secs", &self.timeout_secs)
            .field("response_mode", &self.response_mode)
            .finish()
    }
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            name: default_config_name(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            user_id: default_user_id(),
            timeout_secs: default_timeout(),
            response_mode: ResponseMode::default(),
        }
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = mode;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// `POST` target for chat messages
    pub fn chat_endpoint(&self) -> String {
        format!("{}/chat-messages", self.base_url.trim_end_matches('/'))
    }

    /// Key with all but the first and last four characters hidden.
    pub fn masked_key(&self) -> String {
        let chars: Vec<char> = self.api_key.chars().collect();
        if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}{}{}", head, "*".repeat(chars.len() - 8), tail)
        } else {
            "*".repeat(chars.len())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.base_url.trim();
        if url.is_empty() {
            return Err(ConfigError::Invalid("api.base_url must not be empty".to_string()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(
                "api.base_url must start with http:// or https://".to_string(),
            ));
        }
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Invalid(format!(
                "api.api_key must not be empty (or set {})",
                API_KEY_ENV
            )));
        }
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Invalid("api.user_id must not be empty".to_string()));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::Invalid("api.timeout_secs must be greater than 0".to_string()));
        }
        Ok(())
    }
}

/// 执行配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 每个用例的最大尝试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// 重试间隔 (毫秒)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// 重试间隔递增因子 (1.0 为固定间隔)
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// 4xx 客户端错误是否重试
    #[serde(default)]
    pub retry_client_errors: bool,

    /// 用例间延迟 (毫秒)
    #[serde(default = "default_inter_case_delay_ms")]
    pub inter_case_delay_ms: u64,

    /// 运行日志环形缓冲区容量
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_inter_case_delay_ms() -> u64 {
    2000
}

fn default_log_capacity() -> usize {
    100
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff_factor: default_backoff_factor(),
            retry_client_errors: false,
            inter_case_delay_ms: default_inter_case_delay_ms(),
            log_capacity: default_log_capacity(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
            .with_backoff(self.backoff_factor)
    }

    pub fn inter_case_delay(&self) -> Duration {
        Duration::from_millis(self.inter_case_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("execution.max_retries must be at least 1".to_string()));
        }
        if !(self.backoff_factor.is_finite() && self.backoff_factor >= 1.0) {
            return Err(ConfigError::Invalid(
                "execution.backoff_factor must be a number >= 1.0".to_string(),
            ));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::Invalid("execution.log_capacity must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: String,

    /// 日志文件 (为空时输出到 stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

/// 输出配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// 结果目录
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// 文件名是否包含时间戳
    #[serde(default = "default_true")]
    pub include_timestamp: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_true() -> bool {
    true
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            include_timestamp: true,
        }
    }
}

impl OutputConfig {
    /// `result_<timestamp>.jsonl` or `result.jsonl` under `dir`
    pub fn result_path(&self, now: chrono::DateTime<chrono::Local>) -> PathBuf {
        let file_name = if self.include_timestamp {
            format!("result_{}.jsonl", now.format("%Y%m%d_%H%M%S"))
        } else {
            "result.jsonl".to_string()
        };
        self.dir.join(file_name)
    }
}
