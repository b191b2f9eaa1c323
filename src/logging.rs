//! Invocation log: one JSON line per model call.
//!
//! Architecture:
//! - `InvocationLogger` is the public API, holding an `mpsc::Sender<LogCommand>`
//! - `LogWorker` runs on `std::thread::spawn` and owns all file I/O
//! - successes go to `invocations.jsonl`, failures to `errors.jsonl`
//!
//! The channel is unbounded, so recording never blocks a model call (it is
//! safe from `Drop`) and every call gets its entry. Only a failed write loses
//! an entry; that is reported through `tracing` and never fails the call.

use std::io::Write;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::mpsc;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::{Deserialize, Serialize};

use crate::dispatch::registry::BackendConfig;
use crate::dispatch::TextStream;
use crate::error::QuillError;
use crate::tokens::{self, ApproxTokenCounter, TokenCounter};

pub const SUCCESS_LOG_FILE: &str = "invocations.jsonl";
pub const ERROR_LOG_FILE: &str = "errors.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessEntry {
    pub timestamp: String,
    pub step_label: String,
    pub backend_name: String,
    pub model_name: String,
    pub duration_seconds: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub prompt: String,
    pub response: String,
    /// True when a stream was abandoned before it finished.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureEntry {
    pub timestamp: String,
    pub step_label: String,
    pub backend_name: String,
    pub model_name: String,
    pub prompt: String,
    pub error_message: String,
    /// The error and its source chain.
    pub stack_trace: String,
}

enum LogCommand {
    Success(SuccessEntry),
    Failure(FailureEntry),
    Flush(tokio::sync::oneshot::Sender<()>),
    Shutdown,
}

/// Non-blocking handle for the invocation log writer.
pub struct InvocationLogger {
    tx: mpsc::Sender<LogCommand>,
    dir: PathBuf,
    counter: Option<Box<dyn TokenCounter>>,
    worker_handle: Option<std::thread::JoinHandle<()>>,
}

impl InvocationLogger {
    /// Create a logger writing under `dir`, spawning the writer thread.
    /// Returns `None` if the thread cannot be spawned.
    pub fn new(dir: PathBuf) -> Option<Self> {
        Self::with_counter(dir, Some(Box::new(ApproxTokenCounter)))
    }

    /// Like `new`, with an explicit token counter (`None` records 0 tokens).
    pub fn with_counter(dir: PathBuf, counter: Option<Box<dyn TokenCounter>>) -> Option<Self> {
        let (tx, rx) = mpsc::channel();
        let worker_dir = dir.clone();

        let builder = std::thread::Builder::new().name("quill-invocation-log".into());
        let handle = match builder.spawn(move || LogWorker { rx, dir: worker_dir }.run()) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!("invocation log: failed to spawn writer thread: {e}");
                return None;
            }
        };

        Some(Self {
            tx,
            dir,
            counter,
            worker_handle: Some(handle),
        })
    }

    pub fn success_path(&self) -> PathBuf {
        self.dir.join(SUCCESS_LOG_FILE)
    }

    pub fn error_path(&self) -> PathBuf {
        self.dir.join(ERROR_LOG_FILE)
    }

    fn count(&self, text: &str) -> u64 {
        tokens::count_or_zero(self.counter.as_deref(), text)
    }

    pub fn record_success(
        &self,
        config: &BackendConfig,
        prompt: &str,
        response: &str,
        duration: Duration,
        partial: bool,
    ) {
        let entry = SuccessEntry {
            timestamp: iso_timestamp(),
            step_label: config.step_label.clone(),
            backend_name: config.name.clone(),
            model_name: config.model.clone(),
            duration_seconds: duration.as_secs_f64(),
            input_tokens: self.count(prompt),
            output_tokens: self.count(response),
            prompt: prompt.to_string(),
            response: response.to_string(),
            partial,
        };
        self.send(LogCommand::Success(entry));
    }

    pub fn record_failure(&self, config: &BackendConfig, prompt: &str, error: &QuillError) {
        let entry = FailureEntry {
            timestamp: iso_timestamp(),
            step_label: config.step_label.clone(),
            backend_name: config.name.clone(),
            model_name: config.model.clone(),
            prompt: prompt.to_string(),
            error_message: error.to_string(),
            stack_trace: error.chain(),
        };
        self.send(LogCommand::Failure(entry));
    }

    fn send(&self, cmd: LogCommand) {
        if self.tx.send(cmd).is_err() {
            tracing::warn!("invocation log: writer thread is gone, entry dropped");
        }
    }

    /// Wait until every entry queued so far has been written (or failed).
    pub async fn flush(&self) {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        if self.tx.send(LogCommand::Flush(reply_tx)).is_err() {
            tracing::warn!("invocation log: writer thread is gone");
            return;
        }
        let _ = reply_rx.await;
    }
}

impl Drop for InvocationLogger {
    fn drop(&mut self) {
        let _ = self.tx.send(LogCommand::Shutdown);
        // Let the worker drain queued entries before returning.
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for InvocationLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationLogger")
            .field("dir", &self.dir)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Background writer
// ---------------------------------------------------------------------------

struct LogWorker {
    rx: mpsc::Receiver<LogCommand>,
    dir: PathBuf,
}

impl LogWorker {
    fn run(self) {
        loop {
            match self.rx.recv() {
                Ok(LogCommand::Success(entry)) => self.append(SUCCESS_LOG_FILE, &entry),
                Ok(LogCommand::Failure(entry)) => self.append(ERROR_LOG_FILE, &entry),
                Ok(LogCommand::Flush(reply)) => {
                    let _ = reply.send(());
                }
                Ok(LogCommand::Shutdown) | Err(_) => break,
            }
        }
    }

    fn append<T: Serialize>(&self, file: &str, entry: &T) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("invocation log: failed to encode entry: {e}");
                return;
            }
        };
        let path = self.dir.join(file);
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| {
            let mut f = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(f, "{line}")
        });
        if let Err(e) = result {
            tracing::warn!("invocation log: failed to write {}: {e}", path.display());
        }
    }
}

// ---------------------------------------------------------------------------
// Stream accounting
// ---------------------------------------------------------------------------

/// Wraps a `TextStream` so that exactly one entry is recorded for it:
/// on exhaustion, on the first error, or when the consumer drops it early.
pub struct LoggedStream {
    inner: TextStream,
    logger: Arc<InvocationLogger>,
    config: BackendConfig,
    prompt: String,
    collected: String,
    start: Instant,
    recorded: bool,
}

impl LoggedStream {
    pub fn new(
        inner: TextStream,
        logger: Arc<InvocationLogger>,
        config: BackendConfig,
        prompt: String,
        start: Instant,
    ) -> Self {
        Self {
            inner,
            logger,
            config,
            prompt,
            collected: String::new(),
            start,
            recorded: false,
        }
    }

    fn finish(&mut self, partial: bool) {
        self.recorded = true;
        self.logger.record_success(
            &self.config,
            &self.prompt,
            &self.collected,
            self.start.elapsed(),
            partial,
        );
    }
}

impl Stream for LoggedStream {
    type Item = Result<String, QuillError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.recorded {
            return Poll::Ready(None);
        }
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.collected.push_str(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.recorded = true;
                this.logger.record_failure(&this.config, &this.prompt, &e);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.finish(false);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for LoggedStream {
    fn drop(&mut self) {
        if !self.recorded {
            self.finish(true);
        }
    }
}

/// ISO timestamp string (YYYY-MM-DDTHH:MM:SSZ).
fn iso_timestamp() -> String {
    let secs = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    format_utc(secs)
}

/// Seconds since the Unix epoch as `YYYY-MM-DDTHH:MM:SSZ`.
fn format_utc(secs: u64) -> String {
    let (year, month, day) = civil_date(secs / 86_400);
    let rem = secs % 86_400;
    format!(
        "{year:04}-{month:02}-{day:02}T{:02}:{:02}:{:02}Z",
        rem / 3_600,
        rem % 3_600 / 60,
        rem % 60
    )
}

/// Days since 1970-01-01 to a proleptic Gregorian (year, month, day).
fn civil_date(days: u64) -> (u64, u32, u32) {
    // Count from 0000-03-01 so the leap day ends each 400-year era.
    let shifted = days + 719_468;
    let (era, doe) = (shifted / 146_097, shifted % 146_097);
    let yoe = (doe - doe / 1_460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = era * 400 + yoe + u64::from(month <= 2);
    (year, month, day)
}
