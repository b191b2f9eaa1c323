pub mod state;

pub use state::{Resolution, RoutingState, Strategy, STATE_FILE};

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

/// Decides which backend serves each pipeline step.
///
/// One router per process, built at startup and shared as
/// `Arc<PollingRouter>`. Every resolution runs read-modify-persist under a
/// single mutex, so concurrent callers never receive the same sequential
/// slot and the shuffle queue never hands out a duplicate.
///
/// Persistence rewrites the whole state file (temp file + rename). Writes
/// that fail are logged; routing keeps working from memory. No lock is
/// taken against other processes sharing the file.
pub struct PollingRouter {
    path: PathBuf,
    state: Mutex<RoutingState>,
}

impl PollingRouter {
    /// Load state from `path`. A missing or malformed file falls back to an
    /// empty default state, which is persisted immediately.
    pub async fn load(path: PathBuf) -> Self {
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(text) => match RoutingState::from_json(&text) {
                Ok(state) => Some(state),
                Err(e) => {
                    tracing::warn!(
                        "routing: malformed state file {}, starting empty: {e}",
                        path.display()
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("routing: no state file at {}, starting empty", path.display());
                None
            }
            Err(e) => {
                tracing::warn!(
                    "routing: cannot read state file {}, starting empty: {e}",
                    path.display()
                );
                None
            }
        };

        match state {
            Some(state) => Self::from_state(path, state),
            None => {
                let router = Self::from_state(path, RoutingState::default());
                let state = router.state.lock().await;
                router.persist(&state).await;
                drop(state);
                router
            }
        }
    }

    /// Wrap an existing state without touching disk.
    pub fn from_state(path: PathBuf, mut state: RoutingState) -> Self {
        state.sanitize();
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Backend name for `step`, or `None` when no candidate exists.
    ///
    /// Overrides win without moving any cursor. Sequential picks are
    /// persisted before returning; random picks only consume the
    /// in-memory shuffle queue.
    pub async fn resolve_backend(&self, step: &str) -> Option<String> {
        let mut state = self.state.lock().await;
        let resolution = state.resolve(step);
        match &resolution {
            Resolution::Override(name) => {
                tracing::debug!(step, backend = %name, "routing: override");
            }
            Resolution::Sequential(name) => {
                tracing::debug!(
                    step,
                    backend = %name,
                    index = state.last_sequential_index,
                    "routing: sequential"
                );
                self.persist(&state).await;
            }
            Resolution::Random(name) => {
                tracing::debug!(step, backend = %name, "routing: random");
            }
            Resolution::Empty => {
                tracing::warn!(step, "routing: no backend available");
            }
        }
        resolution.into_backend()
    }

    /// Clear the shuffle queue so the next random pick starts a new cycle.
    /// The sequential cursor is left alone.
    pub async fn reset_rotation(&self) {
        self.state.lock().await.reset();
        tracing::debug!("routing: shuffle cycle reset");
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> RoutingState {
        self.state.lock().await.clone()
    }

    pub async fn set_strategy(&self, strategy: Strategy) {
        let mut state = self.state.lock().await;
        if state.strategy != strategy {
            state.strategy = strategy;
            state.reset();
        }
        self.persist(&state).await;
    }

    /// Pin `step` to `backend`, or clear the pin with `None`.
    pub async fn set_override(&self, step: &str, backend: Option<&str>) {
        let mut state = self.state.lock().await;
        state.set_override(step, backend);
        self.persist(&state).await;
    }

    /// Append backends not yet known, keeping order. Returns how many were added.
    pub async fn register_backends<I, S>(&self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        let added = state.register(names);
        if added > 0 {
            self.persist(&state).await;
        }
        added
    }

    /// Make the rotation match the configured backends: names no longer
    /// configured are removed (and their pins cleared), new ones appended.
    /// Persists once if anything changed.
    pub async fn sync_backends<I, S>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut state = self.state.lock().await;
        let before = state.backend_order.clone();
        let changed = state.sync(names);
        if changed {
            let dropped: Vec<&String> = before
                .iter()
                .filter(|name| !state.backend_order.contains(name))
                .collect();
            if !dropped.is_empty() {
                tracing::info!("routing: dropped unconfigured backends {dropped:?}");
            }
            self.persist(&state).await;
        }
        changed
    }

    /// Remove a backend from rotation and from any overrides pinning it.
    pub async fn remove_backend(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.remove(name);
        if removed {
            self.persist(&state).await;
        }
        removed
    }

    /// Write the full state. Failures are logged and swallowed.
    async fn persist(&self, state: &RoutingState) {
        let json = match state.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!("routing: failed to encode state: {e}");
                return;
            }
        };
        if let Err(e) = atomic_write(&self.path, &json).await {
            tracing::warn!("routing: failed to persist {}: {e}", self.path.display());
        }
    }
}

/// Atomic write: write to temp file, then rename.
/// Temp filename includes PID to avoid cross-process collisions.
async fn atomic_write(path: &Path, content: &str) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, content.as_bytes()).await?;
    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }
    Ok(())
}
