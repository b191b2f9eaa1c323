use crate::dispatch::endpoint::strip_base_url;
use crate::dispatch::openai::error_message;
use crate::dispatch::registry::{BackendConfig, ProviderKind};
use crate::dispatch::{Completion, StreamEvent, WireApi, WireRequest};
use crate::error::QuillError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API (different headers, SSE format).
pub struct AnthropicApi {
    base: String,
    api_key: String,
}

impl AnthropicApi {
    pub fn new(config: &BackendConfig) -> Self {
        let raw = if config.base_url.trim().is_empty() {
            ProviderKind::Anthropic.default_base_url().unwrap_or_default()
        } else {
            config.base_url.as_str()
        };
        let (base, _) = strip_base_url(raw);
        let base = base.trim_end_matches("/v1").to_string();
        Self {
            base,
            api_key: config.api_key.trim().to_string(),
        }
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("x-api-key".to_string(), self.api_key.clone()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
        ]
    }
}

impl WireApi for AnthropicApi {
    fn provider(&self) -> &'static str {
        ProviderKind::Anthropic.as_str()
    }

    fn chat_request(&self, config: &BackendConfig, prompt: &str, stream: bool) -> WireRequest {
        // top_p is not sent: several Claude models reject it alongside temperature.
        let body = serde_json::json!({
            "model": config.model,
            "max_tokens": config.max_tokens,
            "temperature": config.temperature.min(1.0),
            "messages": [{"role": "user", "content": prompt}],
            "stream": stream,
        });
        WireRequest {
            url: format!("{}/v1/messages", self.base),
            headers: self.headers(),
            body: Some(body),
        }
    }

    fn parse_completion(&self, body: &[u8]) -> Result<Completion, QuillError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("failed to parse response: {e}")))?;

        if value["type"] == "error" {
            return Err(QuillError::Upstream {
                provider: self.provider().to_string(),
                message: error_message(&value["error"]),
                status: None,
            });
        }

        let text: String = value["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Completion {
            text: if text.is_empty() { None } else { Some(text) },
            note: value["stop_reason"].as_str().map(|s| s.to_string()),
        })
    }

    fn parse_stream_event(&self, event: &str, data: &str) -> Result<StreamEvent, QuillError> {
        let data = data.trim();
        if data.is_empty() {
            return Ok(StreamEvent::Skip);
        }
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|e| QuillError::SchemaParse(format!("bad stream chunk: {e}")))?;

        // The SSE event name and the payload's `type` carry the same tag;
        // fall back to the payload when a proxy strips event names.
        let kind = if event.is_empty() {
            value["type"].as_str().unwrap_or_default()
        } else {
            event
        };

        match kind {
            "content_block_delta" => Ok(StreamEvent::Delta(
                value["delta"]["text"].as_str().map(|s| s.to_string()),
            )),
            "message_stop" => Ok(StreamEvent::Done),
            "error" => Err(QuillError::Stream {
                provider: self.provider().to_string(),
                message: error_message(&value["error"]),
            }),
            _ => Ok(StreamEvent::Skip),
        }
    }

    fn models_request(&self, _config: &BackendConfig) -> Option<WireRequest> {
        Some(WireRequest {
            url: format!("{}/v1/models", self.base),
            headers: self.headers(),
            body: None,
        })
    }

    fn parse_models(&self, body: &[u8]) -> Result<Vec<String>, QuillError> {
        let value: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| QuillError::SchemaParse(format!("model list: {e}")))?;
        Ok(value["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api() -> AnthropicApi {
        AnthropicApi::new(&BackendConfig {
            provider: "anthropic".to_string(),
            api_key: "k".to_string(),
            base_url: "https://api.anthropic.com/v1/".to_string(),
            ..BackendConfig::default()
        })
    }

    #[test]
    fn base_url_with_version_is_not_doubled() {
        let req = api().chat_request(&BackendConfig::default(), "hi", false);
        assert_eq!(req.url, "https://api.anthropic.com/v1/messages");
    }

    #[test]
    fn decodes_delta_and_stop_events() {
        let api = api();
        let delta = api
            .parse_stream_event(
                "content_block_delta",
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            )
            .unwrap();
        assert_eq!(delta, StreamEvent::Delta(Some("Hi".to_string())));
        assert_eq!(
            api.parse_stream_event("ping", r#"{"type":"ping"}"#).unwrap(),
            StreamEvent::Skip
        );
        assert_eq!(
            api.parse_stream_event("", r#"{"type":"message_stop"}"#).unwrap(),
            StreamEvent::Done
        );
    }

    #[test]
    fn error_event_is_an_error() {
        let err = api()
            .parse_stream_event(
                "error",
                r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
            )
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
