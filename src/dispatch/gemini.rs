use crate::dispatch::endpoint::strip_base_url;
use crate::dispatch::openai::error_message;
use crate::dispatch::registry::{BackendConfig, ProviderKind};
use crate::dispatch::{Completion, StreamEvent, WireApi, WireRequest};
use crate::error::QuillError;

/// Google Generative Language API (`generateContent`).
pub struct GeminiApi {
    base: String,
    api_key: String,
}

impl GeminiApi {
    pub fn new(config: &BackendConfig) -> Self {
        let raw = if config.base_url.trim().is_empty() {
            ProviderKind::Gemini.default_base_url().unwrap_or_default()
        } else {
            config.base_url.as_str()
        };
        let (base, _) = strip_base_url(raw);
        let base = base
            .trim_end_matches('/')
            .trim_end_matches("/v1beta")
            .trim_end_matches("/v1")
            .to_string();
        Self {
            base,
            api_key: config.api_key.trim().to_string(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![("x-goog-api-key".to_string(), self.api_key.clone())]
    }

    /// Concatenate the text parts of the first candidate.
    fn candidate_text(value: &serde_json::Value) -> Option<String> {
        let parts = value["candidates"][0]["content"]["parts"].as_array()?;
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect();
        if text.is_empty() { None } else { Some(text) }
    }
}

impl WireApi for GeminiApi {
    fn provider(&self) -> &'static str {
        ProviderKind::Gemini.as_str()
    }

    fn chat_request(&self, config: &BackendConfig, prompt: &str, stream: bool) -> WireRequest {
        let model = config.model.trim_start_matches("models/");
        let url = if stream {
            format!("{}/v1beta/models/{model}:streamGenerateContent?alt=sse", self.base)
        } else {
            format!("{}/v1beta/models/{model}:generateContent", self.base)
        };
        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": config.temperature,
                "topP": config.top_p,
                "maxOutputTokens": config.max_tokens,
            },
        });
        WireRequest {
            url,
            headers: self.headers(),
            body: Some(body),
        }
    }

    fn parse_completion(&self, body: &[u8]) -> Result<Completion, QuillError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("failed to parse response: {e}")))?;

        if let Some(error) = value.get("error") {
            return Err(QuillError::Upstream {
                provider: self.provider().to_string(),
                message: error_message(error),
                status: None,
            });
        }

        // Safety-blocked prompts come back with no candidates and a
        // promptFeedback.blockReason; blocked outputs with finishReason SAFETY.
        let note = value["promptFeedback"]["blockReason"]
            .as_str()
            .or_else(|| value["candidates"][0]["finishReason"].as_str())
            .map(|s| s.to_string());

        Ok(Completion {
            text: Self::candidate_text(&value),
            note,
        })
    }

    fn parse_stream_event(&self, _event: &str, data: &str) -> Result<StreamEvent, QuillError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(StreamEvent::Skip);
        }
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| QuillError::SchemaParse(format!("bad stream chunk: {e}")))?;
        if let Some(error) = value.get("error") {
            return Err(QuillError::Stream {
                provider: self.provider().to_string(),
                message: error_message(error),
            });
        }
        Ok(StreamEvent::Delta(Self::candidate_text(&value)))
    }

    fn models_request(&self, _config: &BackendConfig) -> Option<WireRequest> {
        Some(WireRequest {
            url: format!("{}/v1beta/models", self.base),
            headers: self.headers(),
            body: None,
        })
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<String>, QuillError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("model list: {e}")))?;
        let models = value["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(models)
    }
}
