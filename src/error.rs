use thiserror::Error;

#[derive(Debug, Error)]
pub enum QuillError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unknown provider kind: {0}")]
    UnknownProvider(String),

    #[error("backend not found: {name}")]
    BackendNotFound {
        name: String,
        suggestions: Vec<String>,
    },

    #[error("no backend available for step {step}")]
    NoBackendAvailable { step: String },

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    #[error("upstream error from {provider}: {message}")]
    Upstream {
        provider: String,
        message: String,
        status: Option<u16>,
    },

    #[error("auth failed for {provider}: {message}")]
    AuthFailed { provider: String, message: String },

    #[error("schema parse error: {0}")]
    SchemaParse(String),

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("stream from {provider} failed: {message}")]
    Stream { provider: String, message: String },

    #[error("adapter for {backend} is closed")]
    Closed { backend: String },
}

impl QuillError {
    /// Returns true for transient errors that may succeed on retry or on
    /// another backend.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Timeout(_) => true,
            Self::Upstream { status, .. } => {
                // 5xx = server error (retryable), 4xx = client error (not retryable)
                // status: None = ambiguous (not from HTTP) → safe default: NOT retryable
                status.is_some_and(|s| s >= 500)
            }
            Self::Request(_) => true, // connection errors may be transient
            Self::Stream { .. } => true,
            _ => false,
        }
    }

    /// Structural problems with one backend's configuration. Fatal to that
    /// adapter, never to the router or to other backends.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Configuration(_) | Self::UnknownProvider(_) | Self::BackendNotFound { .. }
        )
    }

    /// Short message for interactive "test this backend" actions.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::Configuration(msg) => format!("configuration error: {msg}"),
            Self::UnknownProvider(kind) => format!("unknown provider kind: {kind}"),
            Self::BackendNotFound { name, suggestions } => {
                if suggestions.is_empty() {
                    format!("backend not found: {name}")
                } else {
                    format!(
                        "backend not found: {name}. Did you mean: {}?",
                        suggestions.join(", ")
                    )
                }
            }
            Self::NoBackendAvailable { step } => {
                format!("no backend configured for step {step}")
            }
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { provider } => {
                format!("rate limited by {provider}, try again shortly")
            }
            Self::Upstream {
                provider, status, ..
            } => match status {
                Some(code) => format!("upstream error from {provider} (HTTP {code})"),
                None => format!("upstream error from {provider}"),
            },
            Self::AuthFailed { provider, .. } => {
                format!("authentication failed for {provider}")
            }
            Self::SchemaParse(_) => "failed to parse provider response".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Stream { provider, .. } => format!("stream from {provider} was interrupted"),
            Self::Closed { backend } => format!("adapter for {backend} is closed"),
        }
    }

    /// The error followed by its `source()` chain, one cause per line.
    pub fn chain(&self) -> String {
        let mut out = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            out.push_str("\ncaused by: ");
            out.push_str(&cause.to_string());
            source = cause.source();
        }
        out
    }
}
