use serde::Deserialize;

use crate::dispatch::endpoint::{normalize_base_url, AzureAiEndpoint, AzureOpenAiEndpoint};
use crate::dispatch::registry::{BackendConfig, ProviderKind};
use crate::dispatch::{Completion, StreamEvent, WireApi, WireRequest};
use crate::error::QuillError;

/// How the API key is presented.
#[derive(Clone)]
enum Auth {
    /// `Authorization: Bearer {key}`
    Bearer(String),
    /// `api-key: {key}` (Azure)
    ApiKeyHeader(String),
    /// No credential (local servers with an empty key).
    None,
}

/// OpenAI chat-completions wire format. Covers OpenAI itself, the
/// compatible hosts (DeepSeek, Ollama, LM Studio, Grok, SiliconFlow,
/// Volcano Engine, DashScope) and both Azure flavours.
pub struct OpenAiApi {
    provider: &'static str,
    chat_url: String,
    models_url: Option<String>,
    auth: Auth,
}

#[derive(Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<Choice>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<Message>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelItem>,
}

#[derive(Deserialize)]
struct ModelItem {
    id: String,
}

impl OpenAiApi {
    /// Generic OpenAI-compatible host rooted at `base_url` (normalized to
    /// carry a version segment).
    pub fn compatible(kind: ProviderKind, config: &BackendConfig) -> Result<Self, QuillError> {
        let raw = if config.base_url.trim().is_empty() {
            kind.default_base_url().unwrap_or_default()
        } else {
            config.base_url.as_str()
        };
        let base = normalize_base_url(raw);
        if base.is_empty() {
            return Err(QuillError::Configuration(format!(
                "{}: base_url is required for provider {}",
                config.name,
                kind.as_str()
            )));
        }

        let key = config.api_key.trim();
        let auth = match (key.is_empty(), kind) {
            (true, ProviderKind::Ollama) => Auth::Bearer("ollama".to_string()),
            (true, _) => Auth::None,
            (false, _) => Auth::Bearer(key.to_string()),
        };

        Ok(Self {
            provider: kind.as_str(),
            chat_url: format!("{base}/chat/completions"),
            models_url: Some(format!("{base}/models")),
            auth,
        })
    }

    pub fn azure_openai(config: &BackendConfig) -> Result<Self, QuillError> {
        let endpoint = AzureOpenAiEndpoint::parse(&config.base_url)?;
        Ok(Self {
            provider: ProviderKind::AzureOpenAi.as_str(),
            chat_url: endpoint.chat_url(),
            models_url: Some(endpoint.models_url()),
            auth: Auth::ApiKeyHeader(config.api_key.trim().to_string()),
        })
    }

    pub fn azure_ai(config: &BackendConfig) -> Result<Self, QuillError> {
        let endpoint = AzureAiEndpoint::parse(&config.base_url)?;
        Ok(Self {
            provider: ProviderKind::AzureAi.as_str(),
            chat_url: endpoint.chat_url(),
            models_url: None,
            auth: Auth::ApiKeyHeader(config.api_key.trim().to_string()),
        })
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    fn auth_headers(&self) -> Vec<(String, String)> {
        match &self.auth {
            Auth::Bearer(key) => vec![("Authorization".to_string(), format!("Bearer {key}"))],
            Auth::ApiKeyHeader(key) => vec![("api-key".to_string(), key.clone())],
            Auth::None => vec![],
        }
    }
}

impl WireApi for OpenAiApi {
    fn provider(&self) -> &'static str {
        self.provider
    }

    fn chat_request(&self, config: &BackendConfig, prompt: &str, stream: bool) -> WireRequest {
        let body = serde_json::json!({
            "model": config.model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": config.temperature,
            "top_p": config.top_p,
            "max_tokens": config.max_tokens,
            "stream": stream,
        });
        WireRequest {
            url: self.chat_url.clone(),
            headers: self.auth_headers(),
            body: Some(body),
        }
    }

    fn parse_completion(&self, body: &[u8]) -> Result<Completion, QuillError> {
        let completion: ChatCompletion = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("failed to parse response: {e}")))?;

        if completion.choices.is_empty()
            && let Some(error) = completion.error
        {
            return Err(QuillError::Upstream {
                provider: self.provider.to_string(),
                message: error_message(&error),
                status: None,
            });
        }

        let choice = completion.choices.into_iter().next();
        let note = choice.as_ref().and_then(|c| c.finish_reason.clone());
        let text = choice.and_then(|c| c.message).and_then(|m| m.content);
        Ok(Completion { text, note })
    }

    fn parse_stream_event(&self, _event: &str, data: &str) -> Result<StreamEvent, QuillError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(StreamEvent::Skip);
        }
        if data == "[DONE]" {
            return Ok(StreamEvent::Done);
        }

        let chunk: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| QuillError::SchemaParse(format!("bad stream chunk: {e}")))?;

        if let Some(error) = chunk.get("error") {
            return Err(QuillError::Stream {
                provider: self.provider.to_string(),
                message: error_message(error),
            });
        }

        // Usage-only chunks arrive with an empty choices array.
        let content = chunk["choices"][0]["delta"]["content"]
            .as_str()
            .map(|s| s.to_string());
        Ok(StreamEvent::Delta(content))
    }

    fn models_request(&self, _config: &BackendConfig) -> Option<WireRequest> {
        self.models_url.as_ref().map(|url| WireRequest {
            url: url.clone(),
            headers: self.auth_headers(),
            body: None,
        })
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<String>, QuillError> {
        let list: ModelList = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("model list: {e}")))?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

/// Best-effort human message out of an `error` payload.
pub(crate) fn error_message(error: &serde_json::Value) -> String {
    error["message"]
        .as_str()
        .map(|s| s.to_string())
        .or_else(|| error.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: &str, base_url: &str) -> BackendConfig {
        BackendConfig {
            name: "test".to_string(),
            provider: provider.to_string(),
            api_key: String::new(),
            base_url: base_url.to_string(),
            model: "m".to_string(),
            ..BackendConfig::default()
        }
    }

    #[test]
    fn compatible_uses_provider_default_url() {
        let api = OpenAiApi::compatible(ProviderKind::DeepSeek, &config("deepseek", "")).unwrap();
        assert_eq!(api.chat_url(), "https://api.deepseek.com/v1/chat/completions");
    }

    #[test]
    fn verbatim_url_joins_without_double_slash() {
        let config = config("openai", "https://gw.example.com/custom/path/#");
        let api = OpenAiApi::compatible(ProviderKind::OpenAi, &config).unwrap();
        assert_eq!(api.chat_url(), "https://gw.example.com/custom/path/chat/completions");
    }

    #[test]
    fn ollama_gets_placeholder_key() {
        let api = OpenAiApi::compatible(ProviderKind::Ollama, &config("ollama", "")).unwrap();
        let headers = api.auth_headers();
        assert_eq!(headers[0].1, "Bearer ollama");
    }

    #[test]
    fn stream_chunk_without_content_is_empty_delta() {
        let api = OpenAiApi::compatible(ProviderKind::OpenAi, &config("openai", "")).unwrap();
        let event = api
            .parse_stream_event("", r#"{"choices":[],"usage":{"total_tokens":3}}"#)
            .unwrap();
        assert_eq!(event, StreamEvent::Delta(None));
        assert_eq!(api.parse_stream_event("", "[DONE]").unwrap(), StreamEvent::Done);
    }

    #[test]
    fn stream_error_payload_is_an_error() {
        let api = OpenAiApi::compatible(ProviderKind::OpenAi, &config("openai", "")).unwrap();
        let err = api
            .parse_stream_event("", r#"{"error":{"message":"overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, QuillError::Stream { ref message, .. } if message == "overloaded"));
    }

    #[test]
    fn null_content_parses_as_missing_text() {
        let api = OpenAiApi::compatible(ProviderKind::OpenAi, &config("openai", "")).unwrap();
        let completion = api
            .parse_completion(
                br#"{"choices":[{"message":{"content":null},"finish_reason":"content_filter"}]}"#,
            )
            .unwrap();
        assert!(completion.text.is_none());
        assert_eq!(completion.note.as_deref(), Some("content_filter"));
    }
}
