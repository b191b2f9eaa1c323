pub mod adapter;
pub mod anthropic;
pub mod endpoint;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod registry;

pub use adapter::{Adapter, TextStream};
pub use registry::{AdapterFactory, BackendConfig, ProviderKind, Registry};

use crate::error::QuillError;

/// One outbound HTTP request, already shaped for a provider.
/// `body: None` means GET.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

/// A parsed non-streaming completion.
#[derive(Debug, Default)]
pub struct Completion {
    /// None when the provider reported success but produced no content.
    pub text: Option<String>,
    /// Provider's stated reason when content is missing (finish / block reason).
    pub note: Option<String>,
}

/// Result of decoding one server-sent event.
#[derive(Debug, PartialEq)]
pub enum StreamEvent {
    /// A content fragment; None for keep-alives and metadata-only chunks.
    Delta(Option<String>),
    /// Terminal marker sent by the provider.
    Done,
    /// Event carries nothing for the caller (ping, message_start, ...).
    Skip,
}

/// Provider-specific request shaping and response decoding.
/// Each provider family (OpenAI-compatible, Gemini, Anthropic) implements this.
pub trait WireApi: Send + Sync {
    /// Provider tag used in errors and logs.
    fn provider(&self) -> &'static str;

    /// Build a chat request for a single user prompt.
    fn chat_request(&self, config: &BackendConfig, prompt: &str, stream: bool) -> WireRequest;

    /// Parse a successful non-streaming response body.
    fn parse_completion(&self, body: &[u8]) -> Result<Completion, QuillError>;

    /// Decode one SSE event (`event` is the SSE event name, often empty).
    fn parse_stream_event(&self, event: &str, data: &str) -> Result<StreamEvent, QuillError>;

    /// Build the model listing request, if the provider has one.
    fn models_request(&self, config: &BackendConfig) -> Option<WireRequest>;

    /// Parse the model listing response into model identifiers.
    fn parse_models(&self, body: &[u8]) -> Result<Vec<String>, QuillError>;
}
