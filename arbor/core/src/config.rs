//! TOML Configuration File Support
//!
//! Centralized configuration loading, supporting a TOML configuration file at
//! `~/.config/arbor/arbor.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - Config: `$XDG_CONFIG_HOME/arbor/arbor.toml`
//! - Sessions: `$XDG_DATA_HOME/arbor/sessions/`
//!
//! # Example Configuration
//!
//! ```toml
//! [storage]
//! data_dir = "/home/me/.local/share/arbor/sessions"
//!
//! [layout]
//! node_width = 320.0
//! vertical_spacing = 64.0
//!
//! [generation]
//! request_timeout_secs = 120
//! stop_marker = "\n\n[generation stopped]"
//! max_concurrent_streams = 16
//!
//! [[models]]
//! id = "gpt"
//! provider = "openai"
//! model = "gpt-4o"
//! api_key = "sk-..."
//! default = true
//!
//! [[models]]
//! id = "local"
//! provider = "ollama"
//! model = "qwen3"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::LayoutConfig;
use crate::models::{InMemoryModelRegistry, ModelConfig, ModelRegistry, ModelRegistryError};

/// Marker appended to a reply when the user stops its generation
pub const DEFAULT_STOP_MARKER: &str = "\n\n[generation stopped]";

/// Environment variable naming the session directory
pub const ENV_DATA_DIR: &str = "ARBOR_DATA_DIR";
/// Environment variable naming the default model id
pub const ENV_DEFAULT_MODEL: &str = "ARBOR_DEFAULT_MODEL";
/// Environment variable holding the request timeout in seconds
pub const ENV_REQUEST_TIMEOUT: &str = "ARBOR_REQUEST_TIMEOUT";

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
        source: std::io::Error,
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

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
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
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Storage section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// Directory holding session files
    pub data_dir: Option<String>,
}

/// Generation section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationToml {
    /// Whole-request timeout for non-streaming calls, in seconds
    pub request_timeout_secs: Option<u64>,

    /// Text appended to a stopped reply
    pub stop_marker: Option<String>,

    /// Maximum generations in flight at once
    pub max_concurrent_streams: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborToml {
    /// Storage configuration section
    pub storage: StorageToml,

    /// Layout metrics (missing keys keep their defaults)
    pub layout: Option<LayoutConfig>,

    /// Generation configuration section
    pub generation: GenerationToml,

    /// Model configurations
    pub models: Vec<ModelConfig>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct ArborConfig {
    /// Directory holding session files
    pub data_dir: PathBuf,

    /// Layout metrics
    pub layout: LayoutConfig,

    /// Whole-request timeout for non-streaming calls
    pub request_timeout: Duration,

    /// Text appended to a stopped reply
    pub stop_marker: String,

    /// Maximum generations in flight at once
    pub max_concurrent_streams: usize,

    /// Model configurations
    pub models: Vec<ModelConfig>,

    /// Default model id override (env or CLI), applied on top of the `default` flags
    pub default_model: Option<String>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            layout: LayoutConfig::default(),
            request_timeout: Duration::from_secs(120),
            stop_marker: DEFAULT_STOP_MARKER.to_string(),
            max_concurrent_streams: 16,
            models: Vec::new(),
            default_model: None,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ArborConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Check value ranges and model consistency
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let layout = &self.layout;
        let metrics = [
            ("node_width", layout.node_width),
            ("line_height", layout.line_height),
            ("code_line_height", layout.code_line_height),
            ("chrome_height", layout.chrome_height),
        ];
        for (name, value) in metrics {
            if !(value.is_finite() && value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "layout.{name} must be positive, got {value}"
                )));
            }
        }
        let spacings = [
            ("heading_extra", layout.heading_extra),
            ("code_block_padding", layout.code_block_padding),
            ("horizontal_spacing", layout.horizontal_spacing),
            ("vertical_spacing", layout.vertical_spacing),
        ];
        for (name, value) in spacings {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "layout.{name} must not be negative, got {value}"
                )));
            }
        }
        if layout.chars_per_line == 0 {
            return Err(ConfigError::ValidationError(
                "layout.chars_per_line must be positive".to_string(),
            ));
        }

        if self.max_concurrent_streams == 0 {
            return Err(ConfigError::ValidationError(
                "generation.max_concurrent_streams must be positive".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for model in &self.models {
            if !seen.insert(model.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate model id '{}'",
                    model.id
                )));
            }
        }

        let defaults: Vec<&str> = self
            .models
            .iter()
            .filter(|m| m.is_default)
            .map(|m| m.id.as_str())
            .collect();
        if defaults.len() > 1 {
            return Err(ConfigError::ValidationError(format!(
                "only one model may be the default, found: {}",
                defaults.join(", ")
            )));
        }

        if let Some(id) = &self.default_model {
            if !self.models.iter().any(|m| &m.id == id) {
                return Err(ConfigError::ValidationError(format!(
                    "default model '{id}' is not configured"
                )));
            }
        }
        Ok(())
    }

    /// Build a model registry from the configured models
    ///
    /// # Errors
    ///
    /// Returns an error if the default override names an unknown model.
    pub fn model_registry(&self) -> Result<InMemoryModelRegistry, ModelRegistryError> {
        let registry = InMemoryModelRegistry::from_configs(self.models.clone());
        if let Some(id) = &self.default_model {
            registry.set_default(id)?;
        }
        Ok(registry)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/arbor/arbor.toml` or
/// `~/.config/arbor/arbor.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("arbor").join("arbor.toml"))
}

/// Get the default session directory
#[must_use]
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("arbor")
        .join("sessions")
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged configuration fails validation. A missing config file is not
/// an error (defaults are used).
pub fn load_config() -> Result<ArborConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ArborConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

fn load_config_with_env(
    path: Option<PathBuf>,
    env: impl Fn(&str) -> Option<String>,
) -> Result<ArborConfig, ConfigError> {
    // Start with defaults
    let mut config = ArborConfig::default();

    // Try to load from file
    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ArborToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    // Apply environment variables (overrides file values)
    apply_env_config(&mut config, env);

    config.validate()?;
    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut ArborConfig, toml: ArborToml) {
    if let Some(dir) = toml.storage.data_dir {
        config.data_dir = expand_home(&dir);
    }

    if let Some(layout) = toml.layout {
        config.layout = layout;
    }

    if let Some(secs) = toml.generation.request_timeout_secs {
        config.request_timeout = Duration::from_secs(secs);
    }
    if let Some(marker) = toml.generation.stop_marker {
        config.stop_marker = marker;
    }
    if let Some(max) = toml.generation.max_concurrent_streams {
        config.max_concurrent_streams = max;
    }

    config.models = toml.models;
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut ArborConfig, env: impl Fn(&str) -> Option<String>) {
    if let Some(dir) = env(ENV_DATA_DIR) {
        config.data_dir = expand_home(&dir);
        config.source = ConfigSource::Env;
    }
    if let Some(model) = env(ENV_DEFAULT_MODEL) {
        config.default_model = Some(model);
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env(ENV_REQUEST_TIMEOUT) {
        if let Ok(secs) = timeout.parse::<u64>() {
            config.request_timeout = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        } else {
            tracing::warn!(value = %timeout, "Ignoring non-numeric {}", ENV_REQUEST_TIMEOUT);
        }
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Session directory override
    pub data_dir: Option<PathBuf>,

    /// Default model override
    pub default_model: Option<String>,

    /// Request timeout override (seconds)
    pub request_timeout_secs: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set session directory override
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Set default model override
    #[must_use]
    pub fn with_default_model(mut self, model: String) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_secs(mut self, secs: u64) -> Self {
        self.request_timeout_secs = Some(secs);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the result fails validation.
    pub fn apply(&self, config: &mut ArborConfig) -> Result<(), ConfigError> {
        if self.data_dir.is_some()
            || self.default_model.is_some()
            || self.request_timeout_secs.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref dir) = self.data_dir {
            config.data_dir = dir.clone();
        }
        if let Some(ref model) = self.default_model {
            config.default_model = Some(model.clone());
        }
        if let Some(secs) = self.request_timeout_secs {
            config.request_timeout = Duration::from_secs(secs);
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================
