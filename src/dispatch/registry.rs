use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::dispatch::adapter::Adapter;
use crate::dispatch::anthropic::AnthropicApi;
use crate::dispatch::gemini::GeminiApi;
use crate::dispatch::http;
use crate::dispatch::openai::OpenAiApi;
use crate::dispatch::WireApi;
use crate::error::QuillError;

/// Closed set of supported provider kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    OpenAi,
    DeepSeek,
    Ollama,
    LmStudio,
    Grok,
    SiliconFlow,
    VolcEngine,
    DashScope,
    AzureOpenAi,
    AzureAi,
    Gemini,
    Anthropic,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 12] = [
        Self::OpenAi,
        Self::DeepSeek,
        Self::Ollama,
        Self::LmStudio,
        Self::Grok,
        Self::SiliconFlow,
        Self::VolcEngine,
        Self::DashScope,
        Self::AzureOpenAi,
        Self::AzureAi,
        Self::Gemini,
        Self::Anthropic,
    ];

    /// Parse a provider tag. Case, spaces, dashes and underscores are
    /// ignored ("Azure OpenAI", "azure_openai" and "azure-openai" agree).
    /// Unknown tags fail closed.
    pub fn parse(tag: &str) -> Result<Self, QuillError> {
        let key: String = tag
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '_'))
            .flat_map(char::to_lowercase)
            .collect();
        let kind = match key.as_str() {
            "openai" => Self::OpenAi,
            "deepseek" => Self::DeepSeek,
            "ollama" => Self::Ollama,
            "lmstudio" | "mlstudio" => Self::LmStudio,
            "grok" | "xai" => Self::Grok,
            "siliconflow" => Self::SiliconFlow,
            "volcengine" | "volcano" | "ark" => Self::VolcEngine,
            "dashscope" | "aliyun" | "bailian" => Self::DashScope,
            "azureopenai" => Self::AzureOpenAi,
            "azureai" => Self::AzureAi,
            "gemini" | "google" => Self::Gemini,
            "anthropic" | "claude" => Self::Anthropic,
            _ => return Err(QuillError::UnknownProvider(tag.to_string())),
        };
        Ok(kind)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::DeepSeek => "deepseek",
            Self::Ollama => "ollama",
            Self::LmStudio => "lmstudio",
            Self::Grok => "grok",
            Self::SiliconFlow => "siliconflow",
            Self::VolcEngine => "volcengine",
            Self::DashScope => "dashscope",
            Self::AzureOpenAi => "azure_openai",
            Self::AzureAi => "azure_ai",
            Self::Gemini => "gemini",
            Self::Anthropic => "anthropic",
        }
    }

    /// Endpoint used when a backend leaves `base_url` empty.
    /// Azure endpoints are per-resource and have no default.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::OpenAi => Some("https://api.openai.com/v1"),
            Self::DeepSeek => Some("https://api.deepseek.com/v1"),
            Self::Ollama => Some("http://localhost:11434/v1"),
            Self::LmStudio => Some("http://localhost:1234/v1"),
            Self::Grok => Some("https://api.x.ai/v1"),
            Self::SiliconFlow => Some("https://api.siliconflow.cn/v1"),
            Self::VolcEngine => Some("https://ark.cn-beijing.volces.com/api/v3"),
            Self::DashScope => Some("https://dashscope.aliyuncs.com/compatible-mode/v1"),
            Self::AzureOpenAi | Self::AzureAi => None,
            Self::Gemini => Some("https://generativelanguage.googleapis.com"),
            Self::Anthropic => Some("https://api.anthropic.com"),
        }
    }

    /// Local servers run without credentials.
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Ollama | Self::LmStudio)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One callable backend. Immutable once handed to an adapter.
#[derive(Clone)]
pub struct BackendConfig {
    pub name: String,
    /// Provider tag, resolved by the factory (see `ProviderKind::parse`).
    pub provider: String,
    pub api_key: String,
    /// Empty means the provider's default endpoint.
    pub base_url: String,
    pub model: String,
    pub temperature: f64,
    pub top_p: f64,
    pub max_tokens: u64,
    pub timeout_secs: u64,
    pub proxy: Option<String>,
    /// Pipeline step this backend is serving, recorded in invocation logs.
    pub step_label: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            provider: String::new(),
            api_key: String::new(),
            base_url: String::new(),
            model: String::new(),
            temperature: 0.7,
            top_p: 0.9,
            max_tokens: 8192,
            timeout_secs: 600,
            proxy: None,
            step_label: String::new(),
        }
    }
}

impl BackendConfig {
    /// Check generation parameter ranges.
    pub fn validate(&self) -> Result<(), QuillError> {
        let fail = |msg: String| Err(QuillError::Configuration(format!("{}: {msg}", self.name)));
        if self.name.trim().is_empty() {
            return Err(QuillError::Configuration("backend name must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return fail("model must not be empty".into());
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return fail(format!("temperature {} outside [0, 2]", self.temperature));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return fail(format!("top_p {} outside [0, 1]", self.top_p));
        }
        if self.max_tokens == 0 {
            return fail("max_tokens must be > 0".into());
        }
        if self.timeout_secs == 0 {
            return fail("timeout_secs must be > 0".into());
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Copy of this config labelled for one pipeline step.
    pub fn for_step(&self, step: &str) -> Self {
        Self {
            step_label: step.to_string(),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("name", &self.name)
            .field("provider", &self.provider)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("top_p", &self.top_p)
            .field("max_tokens", &self.max_tokens)
            .field("timeout_secs", &self.timeout_secs)
            .field("proxy", &self.proxy)
            .field("step_label", &self.step_label)
            .finish()
    }
}

/// Maps a provider tag onto its wire implementation and builds adapters.
pub struct AdapterFactory;

impl AdapterFactory {
    pub fn create(config: BackendConfig) -> Result<Adapter, QuillError> {
        config.validate()?;
        let kind = ProviderKind::parse(&config.provider)?;
        let api = Self::wire_for(kind, &config)?;
        let client = http::build_client(&config)?;
        tracing::debug!(backend = %config.name, provider = %kind, "adapter created");
        Ok(Adapter::new(config, kind, api, client))
    }

    /// Resolve the wire implementation for a provider kind.
    pub fn wire_for(
        kind: ProviderKind,
        config: &BackendConfig,
    ) -> Result<Arc<dyn WireApi>, QuillError> {
        let api: Arc<dyn WireApi> = match kind {
            ProviderKind::AzureOpenAi => Arc::new(OpenAiApi::azure_openai(config)?),
            ProviderKind::AzureAi => Arc::new(OpenAiApi::azure_ai(config)?),
            ProviderKind::Gemini => Arc::new(GeminiApi::new(config)),
            ProviderKind::Anthropic => Arc::new(AnthropicApi::new(config)),
            _ => Arc::new(OpenAiApi::compatible(kind, config)?),
        };
        Ok(api)
    }
}

/// Lookup surface over the configured backends.
pub struct Registry {
    backends: BTreeMap<String, BackendConfig>,
}

impl Registry {
    pub fn new(backends: BTreeMap<String, BackendConfig>) -> Self {
        Self { backends }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.backends.clone())
    }

    pub fn get(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    /// Backend names in stable (sorted) order.
    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Suggest similar backend names for a failed lookup (substring match).
    /// Sorted alphabetically, capped at 5 to keep error messages readable.
    pub fn suggest(&self, query: &str) -> Vec<String> {
        let q = query.trim().to_lowercase();
        if q.is_empty() {
            return vec![];
        }
        let mut suggestions: Vec<String> = self
            .backends
            .keys()
            .filter(|k| {
                let k_lower = k.to_lowercase();
                k_lower.contains(&q) || q.contains(&k_lower)
            })
            .cloned()
            .collect();
        suggestions.sort();
        suggestions.truncate(5);
        suggestions
    }

    /// Look up a backend by name and build a fresh adapter for it.
    /// The caller owns the adapter and should `close()` it when done.
    pub fn get_adapter(&self, name: &str) -> Result<Adapter, QuillError> {
        let config = self.lookup(name)?;
        AdapterFactory::create(config.clone())
    }

    /// Like `get_adapter`, with the config labelled for `step`.
    pub fn get_adapter_for_step(&self, name: &str, step: &str) -> Result<Adapter, QuillError> {
        let config = self.lookup(name)?;
        AdapterFactory::create(config.for_step(step))
    }

    fn lookup(&self, name: &str) -> Result<&BackendConfig, QuillError> {
        self.backends.get(name).ok_or_else(|| QuillError::BackendNotFound {
            name: name.to_string(),
            suggestions: self.suggest(name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_tags_are_forgiving() {
        assert_eq!(ProviderKind::parse("Azure OpenAI").unwrap(), ProviderKind::AzureOpenAi);
        assert_eq!(ProviderKind::parse("azure_ai").unwrap(), ProviderKind::AzureAi);
        assert_eq!(ProviderKind::parse("ML Studio").unwrap(), ProviderKind::LmStudio);
        assert_eq!(ProviderKind::parse("DeepSeek").unwrap(), ProviderKind::DeepSeek);
    }

    #[test]
    fn every_kind_round_trips_through_its_tag() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
    }

    #[test]
    fn unknown_tag_fails_closed() {
        let err = ProviderKind::parse("carrier-pigeon").unwrap_err();
        assert!(matches!(err, QuillError::UnknownProvider(ref t) if t == "carrier-pigeon"));
    }

    #[test]
    fn validate_rejects_out_of_range_parameters() {
        let base = BackendConfig {
            name: "b".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o".to_string(),
            ..BackendConfig::default()
        };
        assert!(base.validate().is_ok());
        assert!(BackendConfig { temperature: 2.5, ..base.clone() }.validate().is_err());
        assert!(BackendConfig { top_p: -0.1, ..base.clone() }.validate().is_err());
        assert!(BackendConfig { max_tokens: 0, ..base.clone() }.validate().is_err());
        assert!(BackendConfig { timeout_secs: 0, ..base }.validate().is_err());
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = BackendConfig {
            api_key: "sk-very-secret".to_string(),
            ..BackendConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
