use anyhow::{Context, Result, ensure};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Default prefix of environment overrides (`GASYNCIO_DEBUG=true`,
/// `GASYNCIO_LOGGING__LEVEL=debug`)
pub const ENV_PREFIX: &str = "GASYNCIO";

/// Event loop configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Debug mode: time every callback and warn about slow ones
    #[serde(default)]
    pub debug: bool,

    /// Callbacks running longer than this are logged in debug mode
    #[serde(default = "default_slow_callback_ms")]
    pub slow_callback_ms: u64,

    /// Give up on `run_without_glib_until_complete` after this long
    #[serde(default)]
    pub stall_timeout_ms: Option<u64>,

    /// Ready callbacks run per dispatch of the native soon-queue pump
    #[serde(default = "default_ready_batch")]
    pub ready_batch: usize,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default = "default_console")]
    pub console: bool,

    /// JSON lines instead of plain text on the console
    #[serde(default)]
    pub json: bool,

    /// Directory of daily rotating log files; no file logging when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_slow_callback_ms() -> u64 {
    100
}

fn default_ready_batch() -> usize {
    256
}

fn default_level() -> String {
    "info".to_string()
}

fn default_console() -> bool {
    true
}

fn default_file_prefix() -> String {
    "gasyncio".to_string()
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            debug: false,
            slow_callback_ms: default_slow_callback_ms(),
            stall_timeout_ms: None,
            ready_batch: default_ready_batch(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            console: default_console(),
            json: false,
            log_dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

impl LoopConfig {
    pub fn slow_callback_duration(&self) -> Duration {
        Duration::from_millis(self.slow_callback_ms)
    }

    pub fn stall_timeout(&self) -> Option<Duration> {
        self.stall_timeout_ms.map(Duration::from_millis)
    }

    /// Ready callbacks per pump dispatch, never zero
    pub fn ready_batch_limit(&self) -> usize {
        self.ready_batch.max(1)
    }

    /// Reject values the loop cannot make progress with
    pub fn validate(&self) -> Result<()> {
        ensure!(self.ready_batch > 0, "ready_batch must be at least 1");
        Ok(())
    }

    /// Parse a YAML document; missing keys take their defaults
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml_ng::from_str(yaml).context("Failed to parse loop config YAML")?;
        config.validate().context("Invalid loop config")?;
        Ok(config)
    }
}

impl LoggingConfig {
    pub fn log_dir(&self) -> Option<Utf8PathBuf> {
        self.log_dir.as_deref().map(Utf8PathBuf::from)
    }
}

/// Configuration manager layering a YAML file and environment overrides.
///
/// Sources, later ones winning:
/// - built-in defaults
/// - the YAML file (optional)
/// - `GASYNCIO_*` environment variables, `__` separating nested keys
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config_path: Utf8PathBuf,
    env_prefix: String,
    env_source: Option<config::Map<String, String>>,
}

impl ConfigManager {
    pub fn new<P: AsRef<Utf8Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            env_prefix: ENV_PREFIX.to_string(),
            env_source: None,
        }
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Read overrides from `vars` instead of the process environment
    pub fn with_env_source(mut self, vars: config::Map<String, String>) -> Self {
        self.env_source = Some(vars);
        self
    }

    pub fn config_path(&self) -> &Utf8Path {
        &self.config_path
    }

    /// Load the layered configuration
    pub fn load(&self) -> Result<LoopConfig> {
        if !self.config_path.exists() {
            tracing::warn!(
                "Loop config file not found at {}, using defaults and environment",
                self.config_path
            );
        }

        let environment = config::Environment::with_prefix(&self.env_prefix)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(self.env_source.clone());

        let settings = config::Config::builder()
            .add_source(config::File::new(self.config_path.as_str(), config::FileFormat::Yaml).required(false))
            .add_source(environment)
            .build()
            .with_context(|| format!("Failed to read loop config: {}", self.config_path))?;

        let config: LoopConfig = settings
            .try_deserialize()
            .with_context(|| format!("Failed to parse loop config: {}", self.config_path))?;
        config
            .validate()
            .with_context(|| format!("Invalid loop config: {}", self.config_path))?;

        tracing::debug!("Loaded loop config from {}: {:?}", self.config_path, config);
        Ok(config)
    }

    pub fn save(&self, config: &LoopConfig) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            if !parent.as_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent))?;
            }
        }

        let yaml_string =
            serde_yaml_ng::to_string(config).context("Failed to serialize loop config to YAML")?;

        fs::write(&self.config_path, yaml_string)
            .with_context(|| format!("Failed to write loop config: {}", self.config_path))?;

        tracing::info!("Saved loop config to {}", self.config_path);
        Ok(())
    }
}
