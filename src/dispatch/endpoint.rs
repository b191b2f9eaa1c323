//! Base URL normalization and provider-specific endpoint parsing.

use reqwest::Url;

use crate::error::QuillError;

/// API version used for Azure AI inference endpoints that omit `api-version`.
pub const AZURE_AI_DEFAULT_API_VERSION: &str = "2024-05-01-preview";

/// Trim whitespace and trailing slashes. A trailing `#` marks the URL as
/// verbatim: the marker is removed and no version segment is added.
/// Returns (url, verbatim).
pub fn strip_base_url(raw: &str) -> (String, bool) {
    let trimmed = raw.trim();
    if let Some(verbatim) = trimmed.strip_suffix('#') {
        return (verbatim.trim_end_matches('/').to_string(), true);
    }
    (trimmed.trim_end_matches('/').to_string(), false)
}

/// Normalize a base URL for OpenAI-compatible backends: strip trailing
/// slashes and append `/v1` unless the path already carries a version
/// segment (`/v1`, `/v3`, `/v1beta`, ...).
pub fn normalize_base_url(raw: &str) -> String {
    let (url, verbatim) = strip_base_url(raw);
    if verbatim || url.is_empty() || has_version_segment(&url) {
        return url;
    }
    format!("{url}/v1")
}

fn has_version_segment(url: &str) -> bool {
    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    path.split('/').skip(1).any(|segment| {
        let mut chars = segment.chars();
        chars.next() == Some('v') && chars.next().is_some_and(|c| c.is_ascii_digit())
    })
}

/// Fragments of an Azure OpenAI deployment URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureOpenAiEndpoint {
    pub host: String,
    pub deployment: String,
    pub api_version: String,
}

impl AzureOpenAiEndpoint {
    /// Parse `https://{host}/openai/deployments/{deployment}/chat/completions?api-version={v}`.
    pub fn parse(raw: &str) -> Result<Self, QuillError> {
        let (trimmed, _) = strip_base_url(raw);
        let invalid = || {
            QuillError::Configuration(format!(
                "invalid Azure OpenAI URL (expected https://{{host}}/openai/deployments/{{deployment}}/chat/completions?api-version={{version}}): {trimmed}"
            ))
        };

        let url = Url::parse(&trimmed).map_err(|_| invalid())?;
        if url.scheme() != "https" {
            return Err(invalid());
        }
        let host = url.host_str().filter(|h| !h.is_empty()).ok_or_else(invalid)?;
        let segments = path_segments(&url);
        let deployment = match segments.as_slice() {
            ["openai", "deployments", deployment, "chat", "completions"] => *deployment,
            _ => return Err(invalid()),
        };
        let api_version = query_value(&url, "api-version")
            .filter(|v| !v.is_empty())
            .ok_or_else(invalid)?;

        Ok(Self {
            host: host.to_string(),
            deployment: deployment.to_string(),
            api_version,
        })
    }

    pub fn chat_url(&self) -> String {
        format!(
            "https://{}/openai/deployments/{}/chat/completions?api-version={}",
            self.host, self.deployment, self.api_version
        )
    }

    pub fn models_url(&self) -> String {
        format!(
            "https://{}/openai/models?api-version={}",
            self.host, self.api_version
        )
    }
}

/// Fragments of an Azure AI inference (`*.services.ai.azure.com`) URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureAiEndpoint {
    pub resource: String,
    pub api_version: String,
}

impl AzureAiEndpoint {
    /// Parse `https://{resource}.services.ai.azure.com[/models][/chat/completions][?api-version={v}]`.
    pub fn parse(raw: &str) -> Result<Self, QuillError> {
        let (trimmed, _) = strip_base_url(raw);
        let invalid = || {
            QuillError::Configuration(format!(
                "invalid Azure AI URL (expected https://{{resource}}.services.ai.azure.com/models/chat/completions): {trimmed}"
            ))
        };

        let url = Url::parse(&trimmed).map_err(|_| invalid())?;
        if url.scheme() != "https" {
            return Err(invalid());
        }
        let resource = url
            .host_str()
            .and_then(|h| h.strip_suffix(".services.ai.azure.com"))
            .filter(|r| !r.is_empty() && !r.contains('.'))
            .ok_or_else(invalid)?;

        let segments = path_segments(&url);
        match segments.as_slice() {
            [] | ["models"] | ["chat", "completions"] | ["models", "chat", "completions"] => {}
            _ => return Err(invalid()),
        }

        let api_version = query_value(&url, "api-version")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| AZURE_AI_DEFAULT_API_VERSION.to_string());

        Ok(Self {
            resource: resource.to_string(),
            api_version,
        })
    }

    pub fn chat_url(&self) -> String {
        format!(
            "https://{}.services.ai.azure.com/models/chat/completions?api-version={}",
            self.resource, self.api_version
        )
    }
}

fn path_segments(url: &Url) -> Vec<&str> {
    url.path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default()
}

fn query_value(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}
