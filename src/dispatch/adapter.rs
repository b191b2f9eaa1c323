use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures_util::stream::BoxStream;
use reqwest::Client;

use crate::dispatch::http::{self, STREAM_CEILING};
use crate::dispatch::registry::{BackendConfig, ProviderKind};
use crate::dispatch::WireApi;
use crate::error::QuillError;
use crate::logging::{InvocationLogger, LoggedStream};

/// Finite, single-pass sequence of non-blank text fragments.
/// Dropping it cancels the underlying request.
pub type TextStream = BoxStream<'static, Result<String, QuillError>>;

/// Uniform call surface over one backend.
///
/// Owns exactly one HTTP client, bound to one `BackendConfig`. The provider
/// kind is fixed at construction. `close()` releases the client; calls made
/// afterwards fail with `QuillError::Closed`.
pub struct Adapter {
    config: BackendConfig,
    kind: ProviderKind,
    api: Arc<dyn WireApi>,
    client: Mutex<Option<Client>>,
    logger: Option<Arc<InvocationLogger>>,
}

impl Adapter {
    pub(crate) fn new(
        config: BackendConfig,
        kind: ProviderKind,
        api: Arc<dyn WireApi>,
        client: Client,
    ) -> Self {
        Self {
            config,
            kind,
            api,
            client: Mutex::new(Some(client)),
            logger: None,
        }
    }

    /// Record every call made through this adapter.
    pub fn with_logger(mut self, logger: Arc<InvocationLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Release the underlying client. Idempotent.
    pub fn close(&self) {
        let released = match self.client.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if released.is_some() {
            tracing::debug!(backend = %self.config.name, "adapter closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        match self.client.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }

    fn client(&self) -> Result<Client, QuillError> {
        let client = match self.client.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        client.ok_or_else(|| QuillError::Closed {
            backend: self.config.name.clone(),
        })
    }

    /// Send one prompt and return the completion text.
    ///
    /// A successful response without content (safety filtering, null
    /// content) yields `Ok("")` and a warning, not an error.
    pub async fn invoke(&self, prompt: &str) -> Result<String, QuillError> {
        let start = Instant::now();
        let result = self.invoke_inner(prompt).await;

        if let Err(e) = &result {
            tracing::warn!(
                backend = %self.config.name,
                provider = %self.kind,
                "invoke failed: {e}"
            );
        }
        if let Some(logger) = &self.logger {
            match &result {
                Ok(text) => logger.record_success(&self.config, prompt, text, start.elapsed(), false),
                Err(e) => logger.record_failure(&self.config, prompt, e),
            }
        }
        result
    }

    async fn invoke_inner(&self, prompt: &str) -> Result<String, QuillError> {
        let client = self.client()?;
        let req = self.api.chat_request(&self.config, prompt, false);
        let provider = self.api.provider();

        let response = http::send(&client, &req, self.config.timeout(), provider).await?;
        let body = http::read_body(response, provider).await?;
        let completion = self.api.parse_completion(&body)?;

        match completion.text {
            Some(text) if !text.is_empty() => Ok(text),
            _ => {
                tracing::warn!(
                    backend = %self.config.name,
                    reason = completion.note.as_deref().unwrap_or("unspecified"),
                    "provider returned no content"
                );
                Ok(String::new())
            }
        }
    }

    /// Open a streaming completion.
    ///
    /// Connection and status failures are returned here. Once the stream is
    /// open, mid-stream failures arrive as an `Err` item and end it.
    pub async fn invoke_stream(&self, prompt: &str) -> Result<TextStream, QuillError> {
        let start = Instant::now();
        match self.open_stream(prompt).await {
            Ok(stream) => match &self.logger {
                Some(logger) => Ok(Box::pin(LoggedStream::new(
                    stream,
                    Arc::clone(logger),
                    self.config.clone(),
                    prompt.to_string(),
                    start,
                ))),
                None => Ok(stream),
            },
            Err(e) => {
                tracing::warn!(
                    backend = %self.config.name,
                    provider = %self.kind,
                    "stream open failed: {e}"
                );
                if let Some(logger) = &self.logger {
                    logger.record_failure(&self.config, prompt, &e);
                }
                Err(e)
            }
        }
    }

    async fn open_stream(&self, prompt: &str) -> Result<TextStream, QuillError> {
        let client = self.client()?;
        let req = self.api.chat_request(&self.config, prompt, true);
        let response = http::send(&client, &req, STREAM_CEILING, self.api.provider()).await?;
        Ok(http::sse_text_stream(
            response,
            Arc::clone(&self.api),
            self.config.timeout(),
        ))
    }

    /// Model identifiers offered by the backend. Best effort: any failure
    /// yields an empty list.
    pub async fn list_models(&self) -> Vec<String> {
        match self.list_models_inner().await {
            Ok(models) => models,
            Err(e) => {
                tracing::warn!(backend = %self.config.name, "list_models failed: {e}");
                Vec::new()
            }
        }
    }

    async fn list_models_inner(&self) -> Result<Vec<String>, QuillError> {
        let Some(req) = self.api.models_request(&self.config) else {
            tracing::debug!(backend = %self.config.name, "provider has no model listing");
            return Ok(Vec::new());
        };
        let client = self.client()?;
        let provider = self.api.provider();
        let response = http::send(&client, &req, self.config.timeout(), provider).await?;
        let body = http::read_body(response, provider).await?;
        let mut models = self.api.parse_models(&body)?;
        models.sort();
        models.dedup();
        Ok(models)
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("backend", &self.config.name)
            .field("kind", &self.kind)
            .field("closed", &self.is_closed())
            .finish()
    }
}
