use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::dispatch::registry::{BackendConfig, ProviderKind};
use crate::error::QuillError;
use crate::routing;

/// Config file looked up in the working directory when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "quill.toml";

/// Default settings directory (routing state and logs live here).
const DEFAULT_SETTINGS_DIR: &str = ".quill";

/// How callers react to a failed call. Consulted by `StepRunner`, never by
/// adapters or the router.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    pub enable_retry: bool,
    /// Extra attempts after the first one.
    pub retry_count: u32,
    pub enable_logging: bool,
    /// Per-backend ordered alternatives, tried before asking the router again.
    pub failover: BTreeMap<String, Vec<String>>,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            enable_retry: true,
            retry_count: 3,
            enable_logging: true,
            failover: BTreeMap::new(),
        }
    }
}

impl ErrorPolicy {
    /// Total attempts a step may make.
    pub fn max_attempts(&self) -> u32 {
        if self.enable_retry {
            self.retry_count.saturating_add(1)
        } else {
            1
        }
    }
}

#[derive(Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    settings: RawSettings,
    #[serde(default)]
    error_handling: ErrorPolicy,
    #[serde(default)]
    backends: BTreeMap<String, RawBackend>,
}

#[derive(Deserialize, Default)]
struct RawSettings {
    dir: Option<PathBuf>,
}

#[derive(Deserialize)]
struct RawBackend {
    provider: String,
    model: String,
    api_key: Option<String>,
    /// Name of an environment variable holding the key.
    api_key_env: Option<String>,
    #[serde(default)]
    base_url: String,
    temperature: Option<f64>,
    top_p: Option<f64>,
    max_tokens: Option<u64>,
    timeout_secs: Option<u64>,
    proxy: Option<String>,
}

pub struct Config {
    pub backends: BTreeMap<String, BackendConfig>,
    pub settings_dir: PathBuf,
    pub error_policy: ErrorPolicy,
}

impl Config {
    /// Load a TOML config file. API keys named by `api_key_env` are read
    /// from the process environment.
    pub fn load(path: &Path) -> Result<Self, QuillError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            QuillError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, QuillError> {
        Self::from_toml_str_with_env(text, |var| std::env::var(var).ok())
    }

    /// Parse config text, resolving `api_key_env` through `env`.
    ///
    /// A backend that fails validation is skipped with a warning; it never
    /// prevents the others from loading.
    pub fn from_toml_str_with_env(
        text: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, QuillError> {
        let raw: RawConfig = toml::from_str(text)
            .map_err(|e| QuillError::Configuration(format!("invalid config: {e}")))?;

        let mut backends = BTreeMap::new();
        for (name, raw_backend) in raw.backends {
            match build_backend(&name, raw_backend, &env) {
                Ok(backend) => {
                    backends.insert(name, backend);
                }
                Err(e) => tracing::warn!("backend {name} unavailable: {e}"),
            }
        }

        if backends.is_empty() {
            tracing::error!("no backends configured, no backends available");
        }

        Ok(Self {
            backends,
            settings_dir: raw
                .settings
                .dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_DIR)),
            error_policy: raw.error_handling,
        })
    }

    pub fn routing_state_path(&self) -> PathBuf {
        self.settings_dir.join(routing::STATE_FILE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.settings_dir.join("logs")
    }
}

fn build_backend(
    name: &str,
    raw: RawBackend,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<BackendConfig, QuillError> {
    let kind = ProviderKind::parse(&raw.provider)?;

    let api_key = match (raw.api_key, raw.api_key_env) {
        (Some(key), _) if !key.trim().is_empty() => key,
        (_, Some(var)) => env(&var).filter(|k| !k.trim().is_empty()).ok_or_else(|| {
            QuillError::Configuration(format!("{var} not set"))
        })?,
        _ => String::new(),
    };
    if api_key.is_empty() && kind.requires_api_key() {
        return Err(QuillError::Configuration(format!(
            "no api_key for provider {kind}"
        )));
    }

    let defaults = BackendConfig::default();
    let backend = BackendConfig {
        name: name.to_string(),
        provider: raw.provider,
        api_key,
        base_url: raw.base_url,
        model: raw.model,
        temperature: raw.temperature.unwrap_or(defaults.temperature),
        top_p: raw.top_p.unwrap_or(defaults.top_p),
        max_tokens: raw.max_tokens.unwrap_or(defaults.max_tokens),
        timeout_secs: raw.timeout_secs.unwrap_or(defaults.timeout_secs),
        proxy: raw.proxy.filter(|p| !p.trim().is_empty()),
        step_label: String::new(),
    };
    backend.validate()?;
    Ok(backend)
}
