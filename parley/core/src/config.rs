//! TOML Configuration File Support
//!
//! Centralized configuration loading for the daemon, from an optional TOML
//! file at `$XDG_CONFIG_HOME/parley/parley.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments (applied by the binary after loading)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Environment
//!
//! | Variable          | Overrides                   |
//! |-------------------|-----------------------------|
//! | `PARLEY_CONFIG`   | config file location        |
//! | `PARLEY_SOCKET`   | `daemon.socket_path`        |
//! | `PARLEY_DATA_DIR` | `daemon.data_dir`           |
//! | `PARLEY_MODEL`    | `openai.model`              |
//! | `OPENAI_API_KEY`  | `openai.api_key`            |
//! | `OPENAI_BASE_URL` | `openai.base_url`           |
//! | `GOOGLE_API_KEY`  | `gemini.api_key`            |
//! | `GEMINI_BASE_URL` | `gemini.base_url`           |
//!
//! # Example Configuration
//!
//! ```toml
//! [daemon]
//! socket_path = "/run/user/1000/parley/parley.sock"
//! data_dir = "/home/me/.local/share/parley"
//! idle_timeout_secs = 1800
//! heartbeat_interval_secs = 15
//! shutdown_timeout_secs = 5
//!
//! [server]
//! max_connections = 100
//! outbound_queue_capacity = 100
//! max_frame_bytes = 1048576
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 30000
//! backoff_factor = 2.0
//! jitter_factor = 0.1
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! recovery_timeout_secs = 30
//! half_open_success_threshold = 2
//!
//! [openai]
//! model = "gpt-4o-mini"
//! max_tokens = 4096
//! temperature = 0.7
//! timeout_secs = 60
//!
//! [gemini]
//! model = "gemini-2.5-flash"
//! max_tokens = 4096
//!
//! [security]
//! max_input_chars = 100000
//! max_lines = 10000
//! ```

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::DEFAULT_SYSTEM_PROMPT;
use crate::provider::{GeminiConfig, OpenAiConfig};
use crate::resilience::{CircuitBreakerConfig, RetryConfig};
use crate::security::SanitizerLimits;
use crate::transport::{default_socket_path, ServerConfig, MAX_FRAME_SIZE};

/// Environment variable naming the config file
pub const ENV_CONFIG: &str = "PARLEY_CONFIG";
/// Environment variable overriding the socket path
pub const ENV_SOCKET: &str = "PARLEY_SOCKET";
/// Environment variable overriding the data directory
pub const ENV_DATA_DIR: &str = "PARLEY_DATA_DIR";
/// Environment variable overriding the chat model
pub const ENV_MODEL: &str = "PARLEY_MODEL";
/// Environment variable holding the OpenAI API key
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";
/// Environment variable overriding the OpenAI endpoint
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
/// Environment variable holding the Gemini API key
pub const ENV_GOOGLE_API_KEY: &str = "GOOGLE_API_KEY";
/// Environment variable overriding the Gemini endpoint
pub const ENV_GEMINI_BASE_URL: &str = "GEMINI_BASE_URL";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Where the configuration mostly came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[daemon]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonToml {
    /// Unix socket path
    pub socket_path: Option<String>,
    /// Directory holding the conversation snapshot
    pub data_dir: Option<String>,
    /// Exit after this many idle seconds (0 = never)
    pub idle_timeout_secs: Option<u64>,
    /// Heartbeat broadcast period (0 = disabled)
    pub heartbeat_interval_secs: Option<u64>,
    /// Grace period for connections on shutdown
    pub shutdown_timeout_secs: Option<u64>,
    /// System prompt sent with every turn
    pub system_prompt: Option<String>,
}

/// `[server]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: Option<usize>,
    /// Maximum frame size in bytes
    pub max_frame_bytes: Option<usize>,
}

/// `[retry]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    /// Retries after the first attempt
    pub max_retries: Option<u32>,
    /// First backoff delay in milliseconds
    pub initial_delay_ms: Option<u64>,
    /// Backoff cap in milliseconds
    pub max_delay_ms: Option<u64>,
    /// Delay multiplier per retry
    pub backoff_factor: Option<f64>,
    /// Relative jitter (0.0 - 1.0)
    pub jitter_factor: Option<f64>,
}

/// `[circuit_breaker]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerToml {
    /// Consecutive failures that open the circuit
    pub failure_threshold: Option<u32>,
    /// Seconds before a trial call is admitted
    pub recovery_timeout_secs: Option<u64>,
    /// Trial successes needed to close again
    pub half_open_success_threshold: Option<u32>,
}

/// `[openai]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiToml {
    /// API key (prefer `OPENAI_API_KEY`)
    pub api_key: Option<String>,
    /// Default model
    pub model: Option<String>,
    /// Default response length limit
    pub max_tokens: Option<u32>,
    /// Default sampling temperature
    pub temperature: Option<f32>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// API root
    pub base_url: Option<String>,
}

/// `[gemini]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiToml {
    /// API key (prefer `GOOGLE_API_KEY`)
    pub api_key: Option<String>,
    /// Default model
    pub model: Option<String>,
    /// Default response length limit
    pub max_tokens: Option<u32>,
    /// Default sampling temperature
    pub temperature: Option<f32>,
    /// Request timeout in seconds
    pub timeout_secs: Option<u64>,
    /// API root
    pub base_url: Option<String>,
}

/// `[security]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityToml {
    /// Maximum input length in characters
    pub max_input_chars: Option<usize>,
    /// Maximum input line count
    pub max_lines: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ParleyToml {
    /// `[daemon]`
    pub daemon: DaemonToml,
    /// `[server]`
    pub server: ServerToml,
    /// `[retry]`
    pub retry: RetryToml,
    /// `[circuit_breaker]`
    pub circuit_breaker: CircuitBreakerToml,
    /// `[openai]`
    pub openai: OpenAiToml,
    /// `[gemini]`
    pub gemini: GeminiToml,
    /// `[security]`
    pub security: SecurityToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved daemon configuration
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Unix socket path
    pub socket_path: PathBuf,
    /// Directory holding the conversation snapshot
    pub data_dir: PathBuf,
    /// Exit after this long without requests (zero = never)
    pub idle_timeout: Duration,
    /// Heartbeat broadcast period (zero = disabled)
    pub heartbeat_interval: Duration,
    /// Grace period for connections on shutdown
    pub shutdown_timeout: Duration,
    /// System prompt sent with every turn
    pub system_prompt: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Per-connection outbound queue capacity
    pub outbound_queue_capacity: usize,
    /// Maximum frame size in bytes
    pub max_frame_bytes: usize,
    /// Retry policy for provider calls
    pub retry: RetryConfig,
    /// Breaker guarding provider calls
    pub circuit_breaker: CircuitBreakerConfig,
    /// OpenAI adapter settings (empty key = not configured)
    pub openai: OpenAiConfig,
    /// Gemini adapter settings (empty key = not configured)
    pub gemini: GeminiConfig,
    /// Input sanitizer limits
    pub sanitizer: SanitizerLimits,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    source: ConfigSource,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            data_dir: default_data_dir(),
            idle_timeout: Duration::from_secs(1800),
            heartbeat_interval: Duration::from_secs(15),
            shutdown_timeout: Duration::from_secs(5),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_connections: 100,
            outbound_queue_capacity: 100,
            max_frame_bytes: MAX_FRAME_SIZE,
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            openai: OpenAiConfig::default(),
            gemini: GeminiConfig::default(),
            sanitizer: SanitizerLimits::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DaemonConfig {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Whether an OpenAI key is present
    #[must_use]
    pub fn has_openai_key(&self) -> bool {
        !self.openai.api_key.trim().is_empty()
    }

    /// Whether a Gemini key is present
    #[must_use]
    pub fn has_gemini_key(&self) -> bool {
        !self.gemini.api_key.trim().is_empty()
    }

    /// Socket server settings
    #[must_use]
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.socket_path.clone())
            .with_max_connections(self.max_connections)
            .with_queue_capacity(self.outbound_queue_capacity)
            .with_max_frame_bytes(self.max_frame_bytes)
            .with_shutdown_timeout(self.shutdown_timeout)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.max_connections == 0 {
            return invalid("server.max_connections must be at least 1");
        }
        if self.outbound_queue_capacity == 0 {
            return invalid("server.outbound_queue_capacity must be at least 1");
        }
        if self.max_frame_bytes < 1024 {
            return invalid("server.max_frame_bytes must be at least 1024");
        }
        if self.retry.backoff_factor < 1.0 {
            return invalid("retry.backoff_factor must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be between 0.0 and 1.0");
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.half_open_success_threshold == 0 {
            return invalid("circuit_breaker.half_open_success_threshold must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.openai.temperature) {
            return invalid("openai.temperature must be between 0.0 and 2.0");
        }
        if !(0.0..=2.0).contains(&self.gemini.temperature) {
            return invalid("gemini.temperature must be between 0.0 and 2.0");
        }
        if self.sanitizer.max_input_chars == 0 || self.sanitizer.max_lines == 0 {
            return invalid("security limits must be at least 1");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Default configuration file path
///
/// `$XDG_CONFIG_HOME/parley/parley.toml` (typically `~/.config/parley/parley.toml`).
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("parley").join("parley.toml"))
}

/// Default data directory: `$XDG_DATA_HOME/parley`
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("parley")
}

/// Load configuration from `PARLEY_CONFIG` or the default path
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the result fails validation.
pub async fn load_config() -> Result<DaemonConfig, ConfigError> {
    let path = std::env::var(ENV_CONFIG)
        .ok()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(default_config_path);
    load_config_from_path(path).await
}

/// Load configuration from a specific path
///
/// A missing file is not an error; defaults and environment are used.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub async fn load_config_from_path(path: Option<PathBuf>) -> Result<DaemonConfig, ConfigError> {
    load_with_env(path, |key| std::env::var(key).ok()).await
}

async fn load_with_env(
    path: Option<PathBuf>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<DaemonConfig, ConfigError> {
    let mut config = DaemonConfig::default();

    if let Some(config_path) = path {
        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                let toml_config: ParleyToml = toml::from_str(&content)?;
                apply_toml_config(&mut config, toml_config);
                tracing::info!(path = %config_path.display(), "Loaded configuration from file");
                config.config_file_path = Some(config_path);
                config.source = ConfigSource::File;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!(
                    path = %config_path.display(),
                    "Config file not found, using defaults"
                );
            }
            Err(source) => {
                return Err(ConfigError::ReadError {
                    path: config_path,
                    source,
                })
            }
        }
    }

    apply_env_config(&mut config, lookup);
    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut DaemonConfig, toml: ParleyToml) {
    let ParleyToml {
        daemon,
        server,
        retry,
        circuit_breaker,
        openai,
        gemini,
        security,
    } = toml;

    // Daemon settings
    if let Some(path) = daemon.socket_path {
        config.socket_path = PathBuf::from(path);
    }
    if let Some(dir) = daemon.data_dir {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(secs) = daemon.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = daemon.heartbeat_interval_secs {
        config.heartbeat_interval = Duration::from_secs(secs);
    }
    if let Some(secs) = daemon.shutdown_timeout_secs {
        config.shutdown_timeout = Duration::from_secs(secs);
    }
    if let Some(prompt) = daemon.system_prompt {
        config.system_prompt = prompt;
    }

    // Server settings
    if let Some(max) = server.max_connections {
        config.max_connections = max;
    }
    if let Some(capacity) = server.outbound_queue_capacity {
        config.outbound_queue_capacity = capacity;
    }
    if let Some(bytes) = server.max_frame_bytes {
        config.max_frame_bytes = bytes;
    }

    // Retry settings
    if let Some(n) = retry.max_retries {
        config.retry.max_retries = n;
    }
    if let Some(ms) = retry.initial_delay_ms {
        config.retry.initial_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = retry.max_delay_ms {
        config.retry.max_delay = Duration::from_millis(ms);
    }
    if let Some(factor) = retry.backoff_factor {
        config.retry.backoff_factor = factor;
    }
    if let Some(jitter) = retry.jitter_factor {
        config.retry.jitter_factor = jitter;
    }

    // Circuit breaker settings
    if let Some(n) = circuit_breaker.failure_threshold {
        config.circuit_breaker.failure_threshold = n;
    }
    if let Some(secs) = circuit_breaker.recovery_timeout_secs {
        config.circuit_breaker.recovery_timeout = Duration::from_secs(secs);
    }
    if let Some(n) = circuit_breaker.half_open_success_threshold {
        config.circuit_breaker.half_open_success_threshold = n;
    }

    // OpenAI settings
    if let Some(key) = openai.api_key {
        config.openai.api_key = key;
    }
    if let Some(model) = openai.model {
        config.openai.model = model;
    }
    if let Some(max_tokens) = openai.max_tokens {
        config.openai.max_tokens = max_tokens;
    }
    if let Some(temperature) = openai.temperature {
        config.openai.temperature = temperature;
    }
    if let Some(secs) = openai.timeout_secs {
        config.openai.timeout = Duration::from_secs(secs);
    }
    if let Some(url) = openai.base_url {
        config.openai.base_url = url;
    }

    // Gemini settings
    if let Some(key) = gemini.api_key {
        config.gemini.api_key = key;
    }
    if let Some(model) = gemini.model {
        config.gemini.model = model;
    }
    if let Some(max_tokens) = gemini.max_tokens {
        config.gemini.max_tokens = max_tokens;
    }
    if let Some(temperature) = gemini.temperature {
        config.gemini.temperature = temperature;
    }
    if let Some(secs) = gemini.timeout_secs {
        config.gemini.timeout = Duration::from_secs(secs);
    }
    if let Some(url) = gemini.base_url {
        config.gemini.base_url = url;
    }

    // Security settings
    if let Some(chars) = security.max_input_chars {
        config.sanitizer.max_input_chars = chars;
    }
    if let Some(lines) = security.max_lines {
        config.sanitizer.max_lines = lines;
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut DaemonConfig, lookup: impl Fn(&str) -> Option<String>) {
    let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(path) = var(ENV_SOCKET) {
        config.socket_path = PathBuf::from(path);
        config.source = ConfigSource::Env;
    }
    if let Some(dir) = var(ENV_DATA_DIR) {
        config.data_dir = PathBuf::from(dir);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = var(ENV_MODEL) {
        config.openai.model = model;
        config.source = ConfigSource::Env;
    }
    if let Some(key) = var(ENV_OPENAI_API_KEY) {
        config.openai.api_key = key;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = var(ENV_OPENAI_BASE_URL) {
        config.openai.base_url = url;
        config.source = ConfigSource::Env;
    }
    if let Some(key) = var(ENV_GOOGLE_API_KEY) {
        config.gemini.api_key = key;
        config.source = ConfigSource::Env;
    }
    if let Some(url) = var(ENV_GEMINI_BASE_URL) {
        config.gemini.base_url = url;
        config.source = ConfigSource::Env;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    async fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("parley.toml");
        tokio::fs::write(&path, content).await.unwrap();
        path
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();

        assert_eq!(config.idle_timeout, Duration::from_secs(1800));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(15));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.outbound_queue_capacity, 100);
        assert_eq!(config.max_frame_bytes, 1024 * 1024);
        assert_eq!(config.openai.model, "gpt-4o-mini");
        assert_eq!(config.gemini.model, "gemini-2.5-flash");
        assert!(!config.has_openai_key());
        assert!(!config.has_gemini_key());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("parley/parley.toml"));
        }
        assert!(default_data_dir().ends_with("parley"));
    }

    #[tokio::test]
    async fn test_parse_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[daemon]
socket_path = "/tmp/custom.sock"
idle_timeout_secs = 0
heartbeat_interval_secs = 5

[server]
max_connections = 8
outbound_queue_capacity = 16

[retry]
max_retries = 1
initial_delay_ms = 250
backoff_factor = 3.0

[circuit_breaker]
failure_threshold = 2
recovery_timeout_secs = 10

[openai]
model = "gpt-4o"
temperature = 0.2

[gemini]
model = "gemini-2.5-pro"
timeout_secs = 30

[security]
max_lines = 50
"#,
        )
        .await;

        let config = load_with_env(Some(path.clone()), no_env).await.unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/tmp/custom.sock"));
        assert!(config.idle_timeout.is_zero());
        assert_eq!(config.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.outbound_queue_capacity, 16);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
        assert!((config.retry.backoff_factor - 3.0).abs() < f64::EPSILON);
        assert_eq!(config.circuit_breaker.failure_threshold, 2);
        assert_eq!(config.circuit_breaker.recovery_timeout, Duration::from_secs(10));
        assert_eq!(config.circuit_breaker.half_open_success_threshold, 2);
        assert_eq!(config.openai.model, "gpt-4o");
        assert_eq!(config.gemini.model, "gemini-2.5-pro");
        assert_eq!(config.gemini.timeout, Duration::from_secs(30));
        assert_eq!(config.sanitizer.max_lines, 50);
        assert_eq!(config.config_file_path, Some(path));
        assert_eq!(config.source(), ConfigSource::File);

        let server = config.server_config();
        assert_eq!(server.queue_capacity, 16);
        assert_eq!(server.socket_path, PathBuf::from("/tmp/custom.sock"));
    }

    #[tokio::test]
    async fn test_missing_file_graceful() {
        let dir = TempDir::new().unwrap();
        let config = load_with_env(Some(dir.path().join("absent.toml")), no_env)
            .await
            .unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[tokio::test]
    async fn test_malformed_toml_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[daemon\nsocket_path = ").await;
        let result = load_with_env(Some(path), no_env).await;
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[tokio::test]
    async fn test_invalid_values_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "[retry]\njitter_factor = 1.5\n").await;
        let result = load_with_env(Some(path), no_env).await;
        assert!(matches!(result, Err(ConfigError::ValidationError(msg)) if msg.contains("jitter")));
    }

    #[tokio::test]
    async fn test_env_overrides_file() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "[openai]\nmodel = \"file-model\"\napi_key = \"sk-file\"\n",
        )
        .await;

        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_MODEL, "env-model"),
            (ENV_OPENAI_API_KEY, "sk-env"),
            (ENV_SOCKET, "/tmp/env.sock"),
            (ENV_DATA_DIR, "   "),
            (ENV_GOOGLE_API_KEY, "AIza-env"),
        ]);
        let config = load_with_env(Some(path), |key| env.get(key).map(ToString::to_string))
            .await
            .unwrap();

        assert_eq!(config.openai.model, "env-model");
        assert_eq!(config.openai.api_key, "sk-env");
        assert_eq!(config.socket_path, PathBuf::from("/tmp/env.sock"));
        assert!(config.has_gemini_key());
        assert_eq!(config.gemini.api_key, "AIza-env");
        // Blank values are ignored
        assert_eq!(config.data_dir, default_data_dir());
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValidationError("bad".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: bad");
    }
}
