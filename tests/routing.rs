//! Router behavior: rotation strategies, overrides, persistence, concurrency.

use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use quill::routing::{PollingRouter, RoutingState, Strategy};

fn state_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("quill-routing-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir.join("routing_state.json")
}

fn cleanup(path: &std::path::Path) {
    if let Some(dir) = path.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn router_with(path: PathBuf, strategy: Strategy, order: &[&str]) -> PollingRouter {
    PollingRouter::from_state(path, RoutingState::new(strategy, names(order)))
}

async fn resolve_n(router: &PollingRouter, step: &str, n: usize) -> Vec<String> {
    let mut picks = Vec::with_capacity(n);
    for _ in 0..n {
        picks.push(router.resolve_backend(step).await.unwrap());
    }
    picks
}

fn sorted(mut v: Vec<String>) -> Vec<String> {
    v.sort();
    v
}

// ---------------------------------------------------------------------------
// Sequential
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sequential_rotates_and_wraps() {
    let path = state_path("sequential");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B", "C"]);

    assert_eq!(resolve_n(&router, "draft", 4).await, vec!["A", "B", "C", "A"]);
    assert_eq!(router.snapshot().await.last_sequential_index, 0);

    cleanup(&path);
}

#[tokio::test]
async fn sequential_cursor_is_shared_across_steps() {
    let path = state_path("shared-cursor");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B"]);

    assert_eq!(router.resolve_backend("outline").await.as_deref(), Some("A"));
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("B"));
    assert_eq!(router.resolve_backend("review").await.as_deref(), Some("A"));

    cleanup(&path);
}

#[tokio::test]
async fn sequential_pick_is_persisted_before_returning() {
    let path = state_path("persist-each");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B", "C"]);

    router.resolve_backend("draft").await;
    router.resolve_backend("draft").await;

    let on_disk = RoutingState::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(on_disk.last_sequential_index, 1);

    cleanup(&path);
}

// ---------------------------------------------------------------------------
// Overrides
// ---------------------------------------------------------------------------

#[tokio::test]
async fn override_wins_and_leaves_cursor_alone() {
    let path = state_path("override");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B", "C"]);
    router.set_override("review", Some("C")).await;

    assert_eq!(router.resolve_backend("review").await.as_deref(), Some("C"));
    assert_eq!(router.snapshot().await.last_sequential_index, -1);
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("A"));
    assert_eq!(router.resolve_backend("review").await.as_deref(), Some("C"));
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("B"));

    cleanup(&path);
}

#[tokio::test]
async fn override_does_not_consume_random_queue() {
    let path = state_path("override-random");
    let router = router_with(path.clone(), Strategy::Random, &["A", "B", "C"]);
    router.set_override("review", Some("B")).await;

    let first = router.resolve_backend("draft").await.unwrap();
    for _ in 0..5 {
        assert_eq!(router.resolve_backend("review").await.as_deref(), Some("B"));
    }
    let rest = resolve_n(&router, "draft", 2).await;

    let mut cycle = rest;
    cycle.push(first);
    assert_eq!(sorted(cycle), names(&["A", "B", "C"]));

    cleanup(&path);
}

#[tokio::test]
async fn override_may_name_backend_outside_rotation() {
    let path = state_path("override-outside");
    let router = router_with(path.clone(), Strategy::Sequential, &[]);
    router.set_override("polish", Some("claude")).await;

    assert_eq!(router.resolve_backend("polish").await.as_deref(), Some("claude"));
    assert_eq!(router.resolve_backend("draft").await, None);

    cleanup(&path);
}

#[tokio::test]
async fn unpin_and_unset_markers_fall_back_to_rotation() {
    let path = state_path("unpin");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B"]);

    router.set_override("draft", Some("B")).await;
    router.set_override("draft", None).await;
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("A"));

    router.set_override("draft", Some("unset")).await;
    assert!(router.snapshot().await.step_overrides.is_empty());
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("B"));

    cleanup(&path);
}

// ---------------------------------------------------------------------------
// Random
// ---------------------------------------------------------------------------

#[tokio::test]
async fn random_cycles_are_permutations() {
    let path = state_path("random");
    let order = ["A", "B", "C", "D"];
    let router = router_with(path.clone(), Strategy::Random, &order);

    for _ in 0..5 {
        let cycle = resolve_n(&router, "draft", order.len()).await;
        assert_eq!(sorted(cycle), names(&order));
    }

    cleanup(&path);
}

#[tokio::test]
async fn reset_starts_a_fresh_permutation() {
    let path = state_path("reset");
    let order = ["A", "B", "C"];
    let router = router_with(path.clone(), Strategy::Random, &order);

    resolve_n(&router, "draft", 2).await;
    router.reset_rotation().await;
    assert!(router.snapshot().await.random_queue.is_none());

    let cycle = resolve_n(&router, "draft", order.len()).await;
    assert_eq!(sorted(cycle), names(&order));

    cleanup(&path);
}

#[tokio::test]
async fn single_backend_random_always_returns_it() {
    let path = state_path("random-one");
    let router = router_with(path.clone(), Strategy::Random, &["solo"]);
    assert_eq!(resolve_n(&router, "draft", 3).await, vec!["solo"; 3]);
    cleanup(&path);
}

#[tokio::test]
async fn strategy_switch_resets_queue() {
    let path = state_path("switch");
    let router = router_with(path.clone(), Strategy::Random, &["A", "B", "C"]);
    router.resolve_backend("draft").await;
    assert!(router.snapshot().await.random_queue.is_some());

    router.set_strategy(Strategy::Sequential).await;
    let snapshot = router.snapshot().await;
    assert!(snapshot.random_queue.is_none());
    assert_eq!(snapshot.strategy, Strategy::Sequential);
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("A"));

    cleanup(&path);
}

// ---------------------------------------------------------------------------
// Empty / membership
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_rotation_resolves_to_none() {
    let path = state_path("empty");
    for strategy in [Strategy::Sequential, Strategy::Random] {
        let router = router_with(path.clone(), strategy, &[]);
        assert_eq!(router.resolve_backend("draft").await, None);
    }
    cleanup(&path);
}

#[tokio::test]
async fn register_and_remove_backends() {
    let path = state_path("membership");
    let router = router_with(path.clone(), Strategy::Sequential, &["A"]);

    assert_eq!(router.register_backends(["A", "B", "C"]).await, 2);
    assert_eq!(router.register_backends(["B"]).await, 0);
    assert_eq!(router.snapshot().await.backend_order, names(&["A", "B", "C"]));

    router.resolve_backend("draft").await; // A
    router.resolve_backend("draft").await; // B
    assert!(router.remove_backend("B").await);
    assert!(!router.remove_backend("B").await);
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("C"));

    cleanup(&path);
}

#[tokio::test]
async fn sync_removes_unconfigured_backends_and_persists() {
    let path = state_path("sync");
    let router = router_with(path.clone(), Strategy::Sequential, &["removed", "live"]);
    router.set_override("review", Some("removed")).await;

    assert!(router.sync_backends(["live", "new"]).await);
    assert!(!router.sync_backends(["live", "new"]).await);

    let state = router.snapshot().await;
    assert_eq!(state.backend_order, names(&["live", "new"]));
    assert!(state.override_for("review").is_none());
    assert_eq!(resolve_n(&router, "draft", 3).await, vec!["live", "new", "live"]);

    let reloaded = PollingRouter::load(path.clone()).await;
    assert_eq!(reloaded.snapshot().await.backend_order, names(&["live", "new"]));

    cleanup(&path);
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn state_round_trips_through_disk() {
    let path = state_path("round-trip");
    {
        let router = PollingRouter::load(path.clone()).await;
        router.register_backends(["A", "B", "C"]).await;
        router.set_override("review", Some("C")).await;
        router.resolve_backend("draft").await;
        router.resolve_backend("draft").await;
        router.set_strategy(Strategy::Random).await;
    }

    let reloaded = PollingRouter::load(path.clone()).await;
    let state = reloaded.snapshot().await;
    assert_eq!(state.strategy, Strategy::Random);
    assert_eq!(state.backend_order, names(&["A", "B", "C"]));
    assert_eq!(state.override_for("review"), Some("C"));
    assert_eq!(state.last_sequential_index, 1);
    assert!(state.random_queue.is_none());

    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    let keys: BTreeSet<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    assert_eq!(
        keys,
        BTreeSet::from(["backend_order", "last_sequential_index", "step_overrides", "strategy"])
    );

    cleanup(&path);
}

#[tokio::test]
async fn missing_file_is_created_with_defaults() {
    let path = state_path("missing");
    let router = PollingRouter::load(path.clone()).await;

    assert_eq!(router.snapshot().await, RoutingState::default());
    assert!(path.exists());
    assert_eq!(router.resolve_backend("draft").await, None);

    cleanup(&path);
}

#[tokio::test]
async fn corrupt_file_falls_back_to_empty_state() {
    let path = state_path("corrupt");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "{ this is not json").unwrap();

    let router = PollingRouter::load(path.clone()).await;
    assert_eq!(router.resolve_backend("draft").await, None);

    // The bad file was replaced with a valid default.
    let repaired = RoutingState::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(repaired, RoutingState::default());

    cleanup(&path);
}

#[tokio::test]
async fn out_of_range_index_on_disk_is_repaired() {
    let path = state_path("bad-index");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(
        &path,
        r#"{"strategy":"sequential","backend_order":["A","B"],"last_sequential_index":9}"#,
    )
    .unwrap();

    let router = PollingRouter::load(path.clone()).await;
    assert_eq!(router.resolve_backend("draft").await.as_deref(), Some("A"));

    cleanup(&path);
}

#[tokio::test]
async fn persist_failure_does_not_block_resolution() {
    let path = PathBuf::from("/dev/null/quill/routing_state.json");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B"]);

    assert_eq!(resolve_n(&router, "draft", 3).await, vec!["A", "B", "A"]);
    router.set_override("review", Some("B")).await;
    assert_eq!(router.resolve_backend("review").await.as_deref(), Some("B"));
}

#[tokio::test]
async fn no_temp_files_left_behind() {
    let path = state_path("tmp-files");
    let router = router_with(path.clone(), Strategy::Sequential, &["A", "B"]);
    resolve_n(&router, "draft", 4).await;

    let entries: Vec<String> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["routing_state.json"]);

    cleanup(&path);
}

// ---------------------------------------------------------------------------
// Concurrency
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sequential_callers_get_distinct_slots() {
    let path = state_path("concurrent-seq");
    let order: Vec<String> = (0..8).map(|i| format!("b{i}")).collect();
    let router = Arc::new(PollingRouter::from_state(
        path.clone(),
        RoutingState::new(Strategy::Sequential, order.clone()),
    ));

    let mut handles = Vec::new();
    for _ in 0..order.len() {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            router.resolve_backend("draft").await.unwrap()
        }));
    }
    let mut picks = HashSet::new();
    for handle in handles {
        assert!(picks.insert(handle.await.unwrap()), "duplicate slot handed out");
    }
    assert_eq!(picks.len(), order.len());

    cleanup(&path);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_random_callers_never_share_a_cycle_slot() {
    let path = state_path("concurrent-rand");
    let order: Vec<String> = (0..6).map(|i| format!("b{i}")).collect();
    let router = Arc::new(PollingRouter::from_state(
        path.clone(),
        RoutingState::new(Strategy::Random, order.clone()),
    ));

    let mut handles = Vec::new();
    for _ in 0..order.len() {
        let router = Arc::clone(&router);
        handles.push(tokio::spawn(async move {
            router.resolve_backend("draft").await.unwrap()
        }));
    }
    let mut picks = Vec::new();
    for handle in handles {
        picks.push(handle.await.unwrap());
    }
    assert_eq!(sorted(picks), sorted(order));

    cleanup(&path);
}
