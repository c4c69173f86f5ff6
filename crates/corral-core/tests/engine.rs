//! Engine routing tests. Kata runs against the in-memory pod API; the
//! worktree cases skip with a message when `git` is not installed.

use corral_core::{CorralConfig, Engine};
use corral_kata::{KataConfig, KataRuntimeProvider, MockPodApi};
use corral_runtime::{
    ErrorCode, EventHandler, EventKind, ExecutionOptions, RuntimeEvent, RuntimeKind,
    RuntimeProvider, RuntimeState, SnapshotMetadata, SpawnConfig,
};
use corral_worktree::{WorktreeConfig, WorktreeRuntimeProvider};
use parking_lot::Mutex;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

fn kata(api: &MockPodApi) -> Arc<dyn RuntimeProvider> {
    let config = KataConfig {
        poll_interval_ms: 5,
        spawn_timeout_ms: 2_000,
        ..KataConfig::default()
    };
    Arc::new(KataRuntimeProvider::new(config, Arc::new(api.clone())).unwrap())
}

fn git_available() -> bool {
    let ok = Command::new("git")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success());
    if !ok {
        eprintln!("skipping: git not installed");
    }
    ok
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(["-c", "user.name=test", "-c", "user.email=test@localhost"])
        .args(["-c", "commit.gpgsign=false"])
        .args(args)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[tokio::test]
async fn spawn_is_routed_by_runtime_kind() {
    let api = MockPodApi::default();
    let engine = Engine::new().with_provider(kata(&api));
    assert_eq!(engine.kinds(), [RuntimeKind::Kata]);

    let runtime = engine.spawn(SpawnConfig::new(RuntimeKind::Kata)).await.unwrap();
    assert!(runtime.id.starts_with("kata-"));
    assert_eq!(api.pod_count(), 1);

    for kind in [RuntimeKind::Worktree, RuntimeKind::E2b] {
        let err = engine.spawn(SpawnConfig::new(kind)).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ConfigurationError, "{kind}");
    }
    assert_eq!(api.pod_count(), 1);
}

#[tokio::test]
async fn id_calls_reach_the_owning_provider() {
    let api = MockPodApi::default();
    let engine = Engine::new().with_provider(kata(&api));
    let id = engine
        .spawn(SpawnConfig::new(RuntimeKind::Kata))
        .await
        .unwrap()
        .id;

    engine.write_file(&id, "notes.txt", b"hello").await.unwrap();
    assert_eq!(engine.read_file(&id, "notes.txt").await.unwrap(), b"hello");
    let result = engine
        .execute(&id, "cat -- notes.txt", &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.stdout, "hello");
    assert_eq!(engine.get_status(&id).await.unwrap().state, RuntimeState::Running);

    for unknown in ["worktree-1-1", "e2b-1-1", "mystery"] {
        let err = engine.get_runtime(unknown).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound, "{unknown}");
    }

    engine.terminate(&id).await.unwrap();
    assert!(engine
        .wait_for_state(&id, RuntimeState::Terminated, Duration::from_millis(10))
        .await
        .unwrap());
    assert!(engine.list_runtimes(None).await.unwrap().is_empty());
    assert_eq!(api.pod_count(), 0);
}

#[tokio::test]
async fn snapshots_are_found_without_a_prefix() {
    let api = MockPodApi::default();
    let engine = Engine::new().with_provider(kata(&api));
    let source = engine
        .spawn(SpawnConfig::new(RuntimeKind::Kata))
        .await
        .unwrap();
    engine
        .write_file(&source.id, "state.json", b"{}")
        .await
        .unwrap();

    let snapshot = engine
        .snapshot(&source.id, SnapshotMetadata::named("before"))
        .await
        .unwrap();
    assert_eq!(engine.list_snapshots(None).await.unwrap().len(), 1);
    assert_eq!(
        engine
            .list_snapshots(Some(source.id.as_str()))
            .await
            .unwrap()
            .len(),
        1
    );

    let restored = engine.restore(&snapshot.id).await.unwrap();
    assert_eq!(restored.metadata.restored_from.as_deref(), Some(snapshot.id.as_str()));
    assert_eq!(engine.read_file(&restored.id, "state.json").await.unwrap(), b"{}");

    engine.delete_snapshot(&snapshot.id).await.unwrap();
    let err = engine.delete_snapshot(&snapshot.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn subscription_spans_providers_and_dispose_cleans_up() {
    let api = MockPodApi::default();
    let engine = Engine::new().with_provider(kata(&api));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: EventHandler = Arc::new(move |event: &RuntimeEvent| {
        sink.lock().push(event.runtime_id().to_owned());
    });
    let subscription = engine.subscribe(Some(EventKind::StateChange), &handler);

    let first = engine.spawn(SpawnConfig::new(RuntimeKind::Kata)).await.unwrap();
    let second = engine.spawn(SpawnConfig::new(RuntimeKind::Kata)).await.unwrap();
    assert!(seen.lock().contains(&first.id));
    assert!(seen.lock().contains(&second.id));

    let listed = engine.list_runtimes(None).await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[0].created_at <= listed[1].created_at);

    assert!(engine.unsubscribe(&subscription));
    let before = seen.lock().len();
    engine.dispose().await.unwrap();
    assert_eq!(seen.lock().len(), before);
    assert_eq!(api.pod_count(), 0);
}

#[tokio::test]
async fn register_replaces_same_kind() {
    let old_api = MockPodApi::default();
    let new_api = MockPodApi::default();
    let mut engine = Engine::new().with_provider(kata(&old_api));
    assert!(engine.register(kata(&new_api)).is_some());
    assert_eq!(engine.kinds(), [RuntimeKind::Kata]);

    engine.spawn(SpawnConfig::new(RuntimeKind::Kata)).await.unwrap();
    assert_eq!(old_api.pod_count(), 0);
    assert_eq!(new_api.pod_count(), 1);
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn from_config_builds_worktree_backend() {
    if !git_available() {
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let trees = tempfile::tempdir().unwrap();
    git(repo.path(), &["init", "-q"]);
    std::fs::write(repo.path().join("README.md"), b"# engine\n").unwrap();
    git(repo.path(), &["add", "README.md"]);
    git(repo.path(), &["commit", "-q", "-m", "initial commit"]);

    let config = CorralConfig {
        worktree: Some(WorktreeConfig::new(repo.path()).with_worktree_root(trees.path())),
        kata: None,
    };
    let engine = Engine::from_config(&config).await.unwrap();
    assert_eq!(engine.kinds(), [RuntimeKind::Worktree]);

    let runtime = engine
        .spawn(SpawnConfig::new(RuntimeKind::Worktree))
        .await
        .unwrap();
    assert!(runtime.id.starts_with("worktree-"));
    assert_eq!(
        engine.read_file(&runtime.id, "README.md").await.unwrap(),
        b"# engine\n"
    );
    engine.dispose().await.unwrap();
}

#[tokio::test]
async fn mixed_backends_route_independently() {
    if !git_available() {
        return;
    }
    let repo = tempfile::tempdir().unwrap();
    let trees = tempfile::tempdir().unwrap();
    git(repo.path(), &["init", "-q"]);
    std::fs::write(repo.path().join("README.md"), b"# mixed\n").unwrap();
    git(repo.path(), &["add", "README.md"]);
    git(repo.path(), &["commit", "-q", "-m", "initial commit"]);

    let api = MockPodApi::default();
    let worktree = WorktreeRuntimeProvider::new(
        WorktreeConfig::new(repo.path()).with_worktree_root(trees.path()),
    );
    let engine = Engine::new()
        .with_provider(Arc::new(worktree))
        .with_provider(kata(&api));

    let local = engine
        .spawn(SpawnConfig::new(RuntimeKind::Worktree))
        .await
        .unwrap();
    let remote = engine.spawn(SpawnConfig::new(RuntimeKind::Kata)).await.unwrap();

    engine.write_file(&local.id, "only-local.txt", b"l").await.unwrap();
    engine.write_file(&remote.id, "only-remote.txt", b"r").await.unwrap();
    assert!(engine.read_file(&local.id, "only-remote.txt").await.is_err());
    assert!(engine.read_file(&remote.id, "only-local.txt").await.is_err());
    assert_eq!(engine.list_runtimes(None).await.unwrap().len(), 2);

    engine.dispose().await.unwrap();
    assert_eq!(api.pod_count(), 0);
}
