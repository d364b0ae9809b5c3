//! Model Configurations
//!
//! Named model configurations consumed by the generation backends, plus a
//! single "default" designation. At most one configuration is the default at
//! any time; [`ModelRegistry::set_default`] clears the previous default and
//! sets the new one under one write lock.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Provider that serves a model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// OpenAI
    OpenAi,
    /// Anthropic
    Anthropic,
    /// DeepSeek
    DeepSeek,
    /// Local Ollama server
    Ollama,
    /// Any other OpenAI-compatible endpoint
    Custom,
}

impl ProviderKind {
    /// Default API base URL
    #[must_use]
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi | Self::Custom => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
            Self::DeepSeek => "https://api.deepseek.com/v1",
            Self::Ollama => "http://localhost:11434",
        }
    }

    /// Protocol this provider speaks unless configured otherwise
    #[must_use]
    pub fn default_protocol(&self) -> Protocol {
        match self {
            Self::OpenAi | Self::DeepSeek | Self::Custom => Protocol::OpenAiChat,
            Self::Anthropic => Protocol::AnthropicMessages,
            Self::Ollama => Protocol::OllamaChat,
        }
    }

    /// Whether requests need an API key
    #[must_use]
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama)
    }
}

/// Wire dialect used to talk to a model
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    /// `POST /chat/completions` with SSE streaming
    OpenAiChat,
    /// `POST /messages` with SSE streaming
    AnthropicMessages,
    /// `POST /api/chat` with newline-delimited JSON streaming
    OllamaChat,
}

fn default_stream() -> bool {
    true
}

/// A named model configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Registry key
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Provider
    pub provider: ProviderKind,
    /// Wire dialect (provider default when absent)
    #[serde(default)]
    pub protocol: Option<Protocol>,
    /// Provider-side model identifier
    pub model: String,
    /// API base URL override
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sampling temperature
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Nucleus sampling
    #[serde(default)]
    pub top_p: Option<f32>,
    /// Maximum tokens in the reply
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// System prompt prepended to every request
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Stream the reply (false = one final payload)
    #[serde(default = "default_stream")]
    pub stream: bool,
    /// Whether this is the default model
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

impl ModelConfig {
    /// Create a configuration with provider defaults
    pub fn new(id: impl Into<String>, provider: ProviderKind, model: impl Into<String>) -> Self {
        let model = model.into();
        Self {
            id: id.into(),
            name: model.clone(),
            provider,
            protocol: None,
            model,
            base_url: None,
            api_key: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            system_prompt: None,
            stream: true,
            is_default: false,
        }
    }

    /// Set the API key
    #[must_use]
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the base URL
    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }

    /// Effective wire dialect
    #[must_use]
    pub fn protocol(&self) -> Protocol {
        self.protocol.unwrap_or_else(|| self.provider.default_protocol())
    }

    /// Effective base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> String {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }

    /// Non-empty API key, if configured
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.trim().is_empty())
    }
}

/// Errors from model registry operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelRegistryError {
    /// No configuration with this id
    #[error("model not found: {0}")]
    NotFound(String),

    /// A configuration with this id already exists
    #[error("model already exists: {0}")]
    AlreadyExists(String),
}

/// CRUD over model configurations with a single default designation
pub trait ModelRegistry: Send + Sync {
    /// All configurations in insertion order
    fn list(&self) -> Vec<ModelConfig>;

    /// Get a configuration
    fn get(&self, id: &str) -> Option<ModelConfig>;

    /// Add a configuration; if it is flagged default, it becomes the only default
    fn add(&self, config: ModelConfig) -> Result<(), ModelRegistryError>;

    /// Replace a configuration (same id); default flag handled as in `add`
    fn update(&self, config: ModelConfig) -> Result<(), ModelRegistryError>;

    /// Remove a configuration, returning it
    fn remove(&self, id: &str) -> Result<ModelConfig, ModelRegistryError>;

    /// Make `id` the default, clearing any previous default
    fn set_default(&self, id: &str) -> Result<(), ModelRegistryError>;

    /// The default configuration, if any
    fn default_model(&self) -> Option<ModelConfig> {
        self.list().into_iter().find(|m| m.is_default)
    }
}

/// In-process model registry
#[derive(Debug, Default)]
pub struct InMemoryModelRegistry {
    models: RwLock<Vec<ModelConfig>>,
}

impl InMemoryModelRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry from loaded configurations
    ///
    /// Duplicate ids keep the first occurrence; if several entries are
    /// flagged default, only the last one keeps the flag.
    #[must_use]
    pub fn from_configs(configs: impl IntoIterator<Item = ModelConfig>) -> Self {
        let registry = Self::new();
        for config in configs {
            if let Err(e) = registry.add(config) {
                tracing::warn!(error = %e, "Skipping model configuration");
            }
        }
        registry
    }
}

fn promote_default(models: &mut [ModelConfig], id: &str) {
    for model in models.iter_mut() {
        model.is_default = model.id == id;
    }
}

impl ModelRegistry for InMemoryModelRegistry {
    fn list(&self) -> Vec<ModelConfig> {
        self.models.read().clone()
    }

    fn get(&self, id: &str) -> Option<ModelConfig> {
        self.models.read().iter().find(|m| m.id == id).cloned()
    }

    fn add(&self, config: ModelConfig) -> Result<(), ModelRegistryError> {
        let mut models = self.models.write();
        if models.iter().any(|m| m.id == config.id) {
            return Err(ModelRegistryError::AlreadyExists(config.id));
        }
        let id = config.id.clone();
        let is_default = config.is_default;
        models.push(config);
        if is_default {
            promote_default(&mut models, &id);
        }
        Ok(())
    }

    fn update(&self, config: ModelConfig) -> Result<(), ModelRegistryError> {
        let mut models = self.models.write();
        let slot = models
            .iter_mut()
            .find(|m| m.id == config.id)
            .ok_or_else(|| ModelRegistryError::NotFound(config.id.clone()))?;
        let id = config.id.clone();
        let is_default = config.is_default;
        *slot = config;
        if is_default {
            promote_default(&mut models, &id);
        }
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<ModelConfig, ModelRegistryError> {
        let mut models = self.models.write();
        let idx = models
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| ModelRegistryError::NotFound(id.to_string()))?;
        Ok(models.remove(idx))
    }

    fn set_default(&self, id: &str) -> Result<(), ModelRegistryError> {
        let mut models = self.models.write();
        if !models.iter().any(|m| m.id == id) {
            return Err(ModelRegistryError::NotFound(id.to_string()));
        }
        promote_default(&mut models, id);
        tracing::info!(model = id, "Default model changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> InMemoryModelRegistry {
        let registry = InMemoryModelRegistry::new();
        let mut a = ModelConfig::new("a", ProviderKind::OpenAi, "gpt-4o");
        a.is_default = true;
        registry.add(a).unwrap();
        registry
            .add(ModelConfig::new("b", ProviderKind::Anthropic, "claude"))
            .unwrap();
        registry
    }

    #[test]
    fn test_default_exclusivity() {
        let registry = registry();
        assert_eq!(registry.default_model().unwrap().id, "a");

        registry.set_default("b").unwrap();
        let defaults: Vec<_> = registry
            .list()
            .into_iter()
            .filter(|m| m.is_default)
            .map(|m| m.id)
            .collect();
        assert_eq!(defaults, vec!["b".to_string()]);
    }

    #[test]
    fn test_adding_default_clears_previous() {
        let registry = registry();
        let mut c = ModelConfig::new("c", ProviderKind::Ollama, "llama3.2");
        c.is_default = true;
        registry.add(c).unwrap();

        assert_eq!(registry.list().iter().filter(|m| m.is_default).count(), 1);
        assert_eq!(registry.default_model().unwrap().id, "c");
    }

    #[test]
    fn test_set_default_unknown_keeps_state() {
        let registry = registry();
        assert_eq!(
            registry.set_default("zzz"),
            Err(ModelRegistryError::NotFound("zzz".to_string()))
        );
        assert_eq!(registry.default_model().unwrap().id, "a");
    }

    #[test]
    fn test_crud() {
        let registry = registry();
        assert_eq!(
            registry.add(ModelConfig::new("a", ProviderKind::OpenAi, "dup")),
            Err(ModelRegistryError::AlreadyExists("a".to_string()))
        );

        let mut b = registry.get("b").unwrap();
        b.temperature = Some(0.2);
        registry.update(b).unwrap();
        assert_eq!(registry.get("b").unwrap().temperature, Some(0.2));

        let removed = registry.remove("a").unwrap();
        assert!(removed.is_default);
        assert!(registry.default_model().is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn test_provider_defaults() {
        let deepseek = ModelConfig::new("ds", ProviderKind::DeepSeek, "deepseek-reasoner");
        assert_eq!(deepseek.protocol(), Protocol::OpenAiChat);
        assert_eq!(deepseek.base_url(), "https://api.deepseek.com/v1");

        let ollama = ModelConfig::new("o", ProviderKind::Ollama, "llama3.2")
            .with_base_url("http://gpu-box:11434/");
        assert_eq!(ollama.base_url(), "http://gpu-box:11434");
        assert!(!ollama.provider.requires_api_key());

        let blank = ModelConfig::new("x", ProviderKind::OpenAi, "gpt").with_api_key("  ");
        assert!(blank.api_key().is_none());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let config: ModelConfig = toml::from_str(
            r#"
            id = "claude"
            provider = "anthropic"
            model = "claude-sonnet-4"
            api_key = "sk-test"
            default = true
            "#,
        )
        .unwrap();
        assert!(config.is_default);
        assert!(config.stream);
        assert_eq!(config.protocol(), Protocol::AnthropicMessages);
    }
}
