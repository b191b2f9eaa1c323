use std::collections::{BTreeMap, HashSet, VecDeque};
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::QuillError;

/// File name of the persisted state, relative to the settings directory.
pub const STATE_FILE: &str = "routing_state.json";

/// Override values that mean "no override".
const UNSET_MARKERS: &[&str] = &["", "unset", "none"];

pub fn is_unset(value: &str) -> bool {
    let v = value.trim().to_lowercase();
    UNSET_MARKERS.contains(&v.as_str())
}

/// How a step without an override picks among backends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Sequential,
    Random,
}

impl FromStr for Strategy {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sequential" | "round_robin" | "round-robin" => Ok(Self::Sequential),
            "random" | "shuffle" => Ok(Self::Random),
            other => Err(QuillError::Configuration(format!(
                "unknown rotation strategy: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sequential => f.write_str("sequential"),
            Self::Random => f.write_str("random"),
        }
    }
}

/// Outcome of one resolution, so the router knows what to persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Override(String),
    Sequential(String),
    Random(String),
    Empty,
}

impl Resolution {
    pub fn backend(&self) -> Option<&str> {
        match self {
            Self::Override(name) | Self::Sequential(name) | Self::Random(name) => Some(name),
            Self::Empty => None,
        }
    }

    pub fn into_backend(self) -> Option<String> {
        match self {
            Self::Override(name) | Self::Sequential(name) | Self::Random(name) => Some(name),
            Self::Empty => None,
        }
    }
}

/// Rotation state. `random_queue` is never persisted.
///
/// Invariants: `backend_order` has no duplicates,
/// `-1 <= last_sequential_index < backend_order.len()`, and the queue holds
/// distinct valid indices.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingState {
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub step_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub backend_order: Vec<String>,
    #[serde(default = "initial_index")]
    pub last_sequential_index: i64,
    #[serde(skip)]
    pub random_queue: Option<VecDeque<usize>>,
}

fn initial_index() -> i64 {
    -1
}

impl Default for RoutingState {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            step_overrides: BTreeMap::new(),
            backend_order: Vec::new(),
            last_sequential_index: initial_index(),
            random_queue: None,
        }
    }
}

impl RoutingState {
    pub fn new(strategy: Strategy, backend_order: Vec<String>) -> Self {
        let mut state = Self {
            strategy,
            backend_order,
            ..Self::default()
        };
        state.sanitize();
        state
    }

    /// Parse persisted JSON and restore the invariants.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let mut state: Self = serde_json::from_str(text)?;
        state.sanitize();
        Ok(state)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Drop duplicate names, reset an out-of-range index, discard the queue.
    pub fn sanitize(&mut self) {
        let mut seen = HashSet::new();
        self.backend_order.retain(|name| seen.insert(name.clone()));
        let len = self.backend_order.len() as i64;
        if self.last_sequential_index < -1 || self.last_sequential_index >= len {
            self.last_sequential_index = -1;
        }
        self.random_queue = None;
    }

    /// The concrete backend pinned to `step`, if any.
    pub fn override_for(&self, step: &str) -> Option<&str> {
        self.step_overrides
            .get(step)
            .map(|s| s.trim())
            .filter(|s| !is_unset(s))
    }

    /// Pick the backend for `step`: an override wins, otherwise the
    /// strategy advances its cursor.
    pub fn resolve(&mut self, step: &str) -> Resolution {
        if let Some(name) = self.override_for(step) {
            return Resolution::Override(name.to_string());
        }
        if self.backend_order.is_empty() {
            return Resolution::Empty;
        }
        match self.strategy {
            Strategy::Sequential => Resolution::Sequential(self.next_sequential()),
            Strategy::Random => Resolution::Random(self.next_random()),
        }
    }

    fn next_sequential(&mut self) -> String {
        let len = self.backend_order.len() as i64;
        let next = (self.last_sequential_index + 1).rem_euclid(len);
        self.last_sequential_index = next;
        self.backend_order[next as usize].clone()
    }

    fn next_random(&mut self) -> String {
        let len = self.backend_order.len();
        let queue = self.random_queue.get_or_insert_with(VecDeque::new);
        while let Some(idx) = queue.pop_front() {
            if idx < len {
                return self.backend_order[idx].clone();
            }
        }
        let mut fresh = fresh_shuffle(len);
        let idx = fresh.pop_front().unwrap_or(0);
        *queue = fresh;
        self.backend_order[idx].clone()
    }

    /// Start a new shuffle cycle on the next random resolution.
    pub fn reset(&mut self) {
        self.random_queue = None;
    }

    /// Pin `step` to `backend`, or clear the pin with `None`.
    pub fn set_override(&mut self, step: &str, backend: Option<&str>) {
        match backend.map(str::trim).filter(|b| !is_unset(b)) {
            Some(name) => {
                self.step_overrides.insert(step.to_string(), name.to_string());
            }
            None => {
                self.step_overrides.remove(step);
            }
        }
    }

    /// Append names not yet registered, keeping order. Returns how many were added.
    pub fn register<I, S>(&mut self, names: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for name in names {
            let name = name.into();
            if name.trim().is_empty() || self.backend_order.contains(&name) {
                continue;
            }
            self.backend_order.push(name);
            added += 1;
        }
        added
    }

    /// Make the rotation match `names`: drop entries not listed, append new
    /// ones. Surviving entries keep their order. Returns whether anything changed.
    pub fn sync<I, S>(&mut self, names: I) -> bool
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let stale: Vec<String> = self
            .backend_order
            .iter()
            .filter(|known| !names.contains(known))
            .cloned()
            .collect();
        let mut changed = false;
        for name in &stale {
            changed |= self.remove(name);
        }
        changed | (self.register(names) > 0)
    }

    /// Remove a backend, keeping the sequential cursor on the same
    /// successor and clearing overrides that pinned it.
    pub fn remove(&mut self, name: &str) -> bool {
        let Some(pos) = self.backend_order.iter().position(|n| n == name) else {
            return false;
        };
        self.backend_order.remove(pos);
        if (pos as i64) <= self.last_sequential_index {
            self.last_sequential_index -= 1;
        }
        if self.last_sequential_index >= self.backend_order.len() as i64 {
            self.last_sequential_index = -1;
        }
        self.step_overrides.retain(|_, pinned| pinned.trim() != name);
        self.random_queue = None;
        true
    }
}

/// A random permutation of `0..len`.
fn fresh_shuffle(len: usize) -> VecDeque<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    indices.shuffle(&mut rand::thread_rng());
    indices.into()
}
