//! Kata provider tests against the in-memory pod API.

use corral_kata::pod::{pod_name, LABEL_RUNTIME_ID};
use corral_kata::{KataConfig, KataRuntimeProvider, MockBehavior, MockPodApi};
use corral_runtime::{
    ErrorCode, EventKind, ExecutionOptions, HealthStatus, InputStream, NetworkConfig,
    NetworkMode, NetworkPolicy, NetworkRule, OutputChunk, ResourceQuota, ResourceRequest,
    ResourceType, RuntimeError, RuntimeEvent, RuntimeFilter, RuntimeKind, RuntimeProvider,
    RuntimeState, SnapshotMetadata, SpawnConfig,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn kata_config() -> KataConfig {
    KataConfig {
        poll_interval_ms: 5,
        spawn_timeout_ms: 2_000,
        exec_timeout_secs: 10,
        ..KataConfig::default()
    }
}

fn provider_with(api: &MockPodApi, config: KataConfig) -> KataRuntimeProvider {
    KataRuntimeProvider::new(config, Arc::new(api.clone())).unwrap()
}

fn provider(api: &MockPodApi) -> KataRuntimeProvider {
    provider_with(api, kata_config())
}

fn spawn_config() -> SpawnConfig {
    SpawnConfig::new(RuntimeKind::Kata)
}

fn exhausted(err: &RuntimeError) -> Option<ResourceType> {
    match err {
        RuntimeError::ResourceExhausted { resource_type, .. } => Some(*resource_type),
        _ => None,
    }
}

#[tokio::test]
async fn spawn_waits_for_readiness() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        ready_after_polls: 3,
        ..MockBehavior::default()
    });
    let p = provider(&api);
    let runtime = p
        .spawn(spawn_config().with_label("team", "core"))
        .await
        .unwrap();

    assert!(runtime.id.starts_with("kata-"));
    assert_eq!(runtime.state, RuntimeState::Running);
    assert_eq!(runtime.metadata.attribute("kata.pod"), Some(pod_name(&runtime.id).as_str()));
    assert_eq!(runtime.metadata.labels["team"], "core");

    let pod = api.pod(&pod_name(&runtime.id)).unwrap();
    assert_eq!(pod.metadata.labels.unwrap()[LABEL_RUNTIME_ID], runtime.id);
    assert_eq!(pod.spec.unwrap().runtime_class_name.as_deref(), Some("kata"));
}

#[tokio::test]
async fn admission_ceiling_rejects_before_any_api_call() {
    let api = MockPodApi::default();
    let p = provider_with(
        &api,
        KataConfig {
            max_runtimes: Some(0),
            ..kata_config()
        },
    );
    let err = p.spawn(spawn_config()).await.unwrap_err();
    assert_eq!(exhausted(&err), Some(ResourceType::Agents));
    assert_eq!(api.api_calls(), 0);
}

#[tokio::test]
async fn exhaustion_then_recovery() {
    let api = MockPodApi::default();
    let p = provider_with(
        &api,
        KataConfig {
            max_runtimes: Some(2),
            ..kata_config()
        },
    );
    let first = p.spawn(spawn_config()).await.unwrap();
    let _second = p.spawn(spawn_config()).await.unwrap();

    let calls = api.api_calls();
    let err = p.spawn(spawn_config()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    assert!(err.is_retryable());
    assert_eq!(api.api_calls(), calls);

    p.terminate(&first.id).await.unwrap();
    p.spawn(spawn_config()).await.unwrap();
    assert_eq!(api.pod_count(), 2);
}

#[tokio::test]
async fn aggregate_quota_is_enforced_locally() {
    let api = MockPodApi::default();
    let p = provider_with(
        &api,
        KataConfig {
            quota: Some(ResourceQuota {
                max_cpu_cores: Some(1.0),
                max_memory_bytes: None,
            }),
            ..kata_config()
        },
    );
    let big = spawn_config().with_resources(ResourceRequest {
        cpu: 0.75,
        ..ResourceRequest::default()
    });
    let runtime = p.spawn(big.clone()).await.unwrap();
    let err = p.spawn(big.clone()).await.unwrap_err();
    assert_eq!(exhausted(&err), Some(ResourceType::Cpu));
    assert_eq!(api.pods_created(), 1);

    p.terminate(&runtime.id).await.unwrap();
    p.spawn(big).await.unwrap();
}

#[tokio::test]
async fn cluster_quota_rejection_is_resource_exhausted() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        quota_exceeded: true,
        ..MockBehavior::default()
    });
    let p = provider(&api);
    let err = p.spawn(spawn_config()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    assert!(p.list_runtimes(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn spawn_timeout_leaves_no_record() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        never_ready: true,
        ..MockBehavior::default()
    });
    let p = provider_with(
        &api,
        KataConfig {
            spawn_timeout_ms: 150,
            ..kata_config()
        },
    );

    let started = Instant::now();
    let err = p.spawn(spawn_config()).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(err.code(), ErrorCode::SpawnError);
    assert_eq!(err.context().get("timeout_ms").map(String::as_str), Some("150"));

    let id = err.runtime_id().unwrap().to_owned();
    assert!(p.list_runtimes(None).await.unwrap().is_empty());
    assert!(p.get_runtime(&id).await.unwrap_err().is_not_found());
    assert_eq!(api.pod_count(), 0, "timed out pod is cleaned up");
}

#[tokio::test]
async fn unschedulable_pod_is_spawn_error() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        unschedulable: true,
        ..MockBehavior::default()
    });
    let p = provider(&api);
    let err = p.spawn(spawn_config()).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SpawnError);
    assert!(err.to_string().contains("Insufficient cpu"), "{err}");
    assert_eq!(api.pod_count(), 0);
}

#[tokio::test]
async fn malformed_cidr_fails_before_ready() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let config = spawn_config().with_network(NetworkConfig {
        mode: NetworkMode::Bridge,
        dns: Vec::new(),
        policies: vec![NetworkPolicy {
            name: "egress".to_owned(),
            ingress: Vec::new(),
            egress: vec![NetworkRule {
                cidrs: vec!["10.0.0.0/99".to_owned()],
                ..NetworkRule::default()
            }],
        }],
    });

    let err = p.spawn(config).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigurationError);
    assert!(err.to_string().contains("10.0.0.0/99"), "{err}");
    assert_eq!(api.pod_count(), 0);
    assert!(p.list_runtimes(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn network_policies_live_and_die_with_the_runtime() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let config = spawn_config().with_network(NetworkConfig {
        mode: NetworkMode::None,
        dns: Vec::new(),
        policies: Vec::new(),
    });
    let runtime = p.spawn(config).await.unwrap();
    assert_eq!(
        api.policy_names(),
        [format!("corral-{}-deny-all", runtime.id)]
    );

    p.terminate(&runtime.id).await.unwrap();
    assert!(api.policy_names().is_empty());
}

#[tokio::test]
async fn file_round_trip_preserves_bytes() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    for (path, data) in [
        ("empty.bin", Vec::new()),
        ("nested/dir/nulls.bin", vec![0u8, 1, 0, 255, 0]),
        ("/tmp/absolute.txt", b"plain text\n".to_vec()),
    ] {
        p.write_file(&id, path, &data).await.unwrap();
        assert_eq!(p.read_file(&id, path).await.unwrap(), data);
    }
    assert_eq!(
        api.file(&pod_name(&id), "/workspace/nested/dir/nulls.bin").unwrap(),
        [0u8, 1, 0, 255, 0]
    );

    let err = p.read_file(&id, "missing.txt").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
    assert_eq!(err.runtime_id(), Some(id.as_str()));
}

#[tokio::test]
async fn execute_captures_output_env_and_cwd() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let result = p
        .execute(&id, "echo hello ; echo oops >&2 ; exit 3", &ExecutionOptions::default())
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert_eq!(result.stdout, "hello\n");
    assert_eq!(result.stderr, "oops\n");

    let options = ExecutionOptions::default()
        .with_cwd("src")
        .with_env("GREETING", "hi there");
    let result = p.execute(&id, "pwd && printenv GREETING", &options).await.unwrap();
    assert!(result.success());
    assert_eq!(result.stdout, "/workspace/src\nhi there\n");

    let command = api.exec_log().last().unwrap().clone();
    assert_eq!(command[..2], ["/bin/sh", "-c"]);
}

#[tokio::test]
async fn execute_timeout_is_timeout_error() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let options = ExecutionOptions::default().with_timeout(Duration::from_millis(50));
    let err = p.execute(&id, "sleep 5", &options).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(err.context().get("command").map(String::as_str), Some("sleep 5"));

    let items: Vec<_> = p
        .execute_stream(&id, "sleep 5", &options)
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(
        items.last().unwrap().as_ref().unwrap_err().code(),
        ErrorCode::Timeout
    );
}

#[tokio::test]
async fn stream_and_interactive() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let chunks: Vec<OutputChunk> = p
        .execute_stream(&id, "echo one ; echo two >&2 ; exit 4", &ExecutionOptions::default())
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;
    assert!(chunks.contains(&OutputChunk::Stdout("one\n".into())));
    assert!(chunks.contains(&OutputChunk::Stderr("two\n".into())));
    assert_eq!(chunks.last(), Some(&OutputChunk::Exit(4)));

    let stdin: InputStream = Box::new(std::io::Cursor::new(b"aGk=".to_vec()));
    let result = p
        .execute_interactive(&id, "base64 -d > 'greeting'", stdin, &ExecutionOptions::default())
        .await
        .unwrap();
    assert!(result.success());
    assert_eq!(p.read_file(&id, "greeting").await.unwrap(), b"hi");
}

#[tokio::test]
async fn directory_sync_survives_one_bad_file() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        fail_writes_to: vec!["poison.txt".to_owned()],
        ..MockBehavior::default()
    });
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let host = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(host.path().join("src")).unwrap();
    std::fs::write(host.path().join("a.txt"), b"a").unwrap();
    std::fs::write(host.path().join("src/b.txt"), b"b").unwrap();
    std::fs::write(host.path().join("src/poison.txt"), b"x").unwrap();

    let report = p.upload_directory(&id, host.path(), "project").await.unwrap();
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].path, "src/poison.txt");
    assert_eq!(report.transferred.len(), 2);
    assert_eq!(p.read_file(&id, "project/src/b.txt").await.unwrap(), b"b");

    let out = tempfile::tempdir().unwrap();
    let report = p.download_directory(&id, "project", out.path()).await.unwrap();
    assert!(report.success);
    assert_eq!(std::fs::read(out.path().join("a.txt")).unwrap(), b"a");
    assert_eq!(std::fs::read(out.path().join("src/b.txt")).unwrap(), b"b");
}

#[tokio::test]
async fn upload_to_filesystem_root_stays_absolute() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let host = tempfile::tempdir().unwrap();
    std::fs::write(host.path().join("a.txt"), b"hi").unwrap();
    let report = p.upload_directory(&id, host.path(), "/").await.unwrap();
    assert!(report.success);
    assert_eq!(report.transferred, ["a.txt"]);

    let pod = pod_name(&id);
    assert_eq!(api.file(&pod, "/a.txt").unwrap(), b"hi");
    assert!(api.file(&pod, "/workspace/a.txt").is_none());
    assert_eq!(p.read_file(&id, "/a.txt").await.unwrap(), b"hi");
}

#[tokio::test]
async fn fresh_workdir_downloads_as_empty() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    let out = tempfile::tempdir().unwrap();
    let report = p.download_directory(&id, ".", out.path()).await.unwrap();
    assert!(report.success);
    assert!(report.transferred.is_empty());

    let err = p
        .download_directory(&id, "missing", out.path())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn snapshot_restores_into_new_runtime() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let source = p
        .spawn(spawn_config().with_label("team", "core"))
        .await
        .unwrap();
    p.write_file(&source.id, "state/progress.json", b"{\"step\":3}")
        .await
        .unwrap();

    let snapshot = p
        .snapshot(&source.id, SnapshotMetadata::named("checkpoint"))
        .await
        .unwrap();
    assert!(snapshot.size > 0);
    assert_eq!(snapshot.runtime_id, source.id);

    p.terminate(&source.id).await.unwrap();
    let restored = p.restore(&snapshot.id).await.unwrap();
    assert_ne!(restored.id, source.id);
    assert_eq!(restored.metadata.restored_from.as_deref(), Some(snapshot.id.as_str()));
    assert_eq!(restored.metadata.labels["team"], "core");
    assert_eq!(
        p.read_file(&restored.id, "state/progress.json").await.unwrap(),
        b"{\"step\":3}"
    );

    assert_eq!(p.list_snapshots(Some(source.id.as_str())).await.unwrap().len(), 1);
    p.delete_snapshot(&snapshot.id).await.unwrap();
    let err = p.delete_snapshot(&snapshot.id).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);
}

#[tokio::test]
async fn terminate_survives_out_of_band_removal() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;

    assert!(api.remove_out_of_band(&pod_name(&id)));
    p.terminate(&id).await.unwrap();
    p.terminate(&id).await.unwrap();
    assert!(p
        .wait_for_state(&id, RuntimeState::Terminated, Duration::from_millis(10))
        .await
        .unwrap());
}

#[tokio::test]
async fn unknown_and_terminated_ids_are_not_found() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let id = p.spawn(spawn_config()).await.unwrap().id;
    p.terminate(&id).await.unwrap();

    for target in ["kata-999-1", id.as_str()] {
        let options = ExecutionOptions::default();
        let errors = [
            p.execute(target, "true", &options).await.unwrap_err(),
            p.get_status(target).await.unwrap_err(),
            p.read_file(target, "a").await.unwrap_err(),
            p.snapshot(target, SnapshotMetadata::default()).await.unwrap_err(),
        ];
        for err in errors {
            assert_eq!(err.code(), ErrorCode::NotFound, "{target}: {err}");
        }
    }
    assert!(p.restore("snap-missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn events_follow_lifecycle_order() {
    let api = MockPodApi::default();
    let p = provider(&api);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    p.subscribe(
        Some(EventKind::StateChange),
        Arc::new(move |e: &RuntimeEvent| {
            if let RuntimeEvent::StateChange { current_state, .. } = e {
                sink.lock().push(*current_state);
            }
        }),
    );

    let id = p.spawn(spawn_config()).await.unwrap().id;
    p.terminate(&id).await.unwrap();
    assert_eq!(
        *seen.lock(),
        [
            RuntimeState::Creating,
            RuntimeState::Running,
            RuntimeState::Terminating,
            RuntimeState::Terminated,
        ]
    );
}

#[tokio::test]
async fn health_probe_samples_memory_and_detects_failure() {
    let api = MockPodApi::default().with_behavior(MockBehavior {
        memory_usage: 1_000_000_000,
        ..MockBehavior::default()
    });
    let p = provider_with(
        &api,
        KataConfig {
            health_interval_ms: 20,
            ..kata_config()
        },
    );
    let healthy = p
        .spawn(spawn_config().with_resources(ResourceRequest {
            memory: 512 * 1024 * 1024,
            ..ResourceRequest::default()
        }))
        .await
        .unwrap();
    let doomed = p.spawn(spawn_config()).await.unwrap();

    let warnings = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&warnings);
    p.subscribe(
        Some(EventKind::ResourceWarning),
        Arc::new(move |e: &RuntimeEvent| sink.lock().push(e.runtime_id().to_owned())),
    );

    assert!(api.fail_pod(&pod_name(&doomed.id)));
    p.start_health_monitoring();
    assert!(p
        .wait_for_state(&doomed.id, RuntimeState::Error, Duration::from_secs(5))
        .await
        .unwrap());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !warnings.lock().contains(&healthy.id) {
        assert!(Instant::now() < deadline, "no memory warning for {}", healthy.id);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let status = p.get_status(&doomed.id).await.unwrap();
    assert_eq!(status.health, HealthStatus::Unhealthy);
    let status = p.get_status(&healthy.id).await.unwrap();
    assert_eq!(status.health, HealthStatus::Healthy);
    assert_eq!(status.resources.memory, 1_000_000_000);

    let filter = RuntimeFilter {
        state: Some(RuntimeState::Error),
        ..RuntimeFilter::default()
    };
    assert_eq!(p.list_runtimes(Some(&filter)).await.unwrap().len(), 1);

    p.dispose().await.unwrap();
    assert_eq!(api.pod_count(), 0);
}

#[tokio::test]
async fn pod_template_is_rendered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pod.yaml");
    std::fs::write(
        &path,
        r#"
apiVersion: v1
kind: Pod
metadata:
  name: agent-{{AGENT_ID}}
  annotations:
    corral.dev/cpu-limit: "{{CPU_LIMIT}}"
spec:
  runtimeClassName: {{RUNTIME_CLASS}}
  containers:
    - name: agent
      image: "{{IMAGE}}"
"#,
    )
    .unwrap();

    let api = MockPodApi::default();
    let p = provider_with(
        &api,
        KataConfig {
            pod_template: Some(path),
            ..kata_config()
        },
    );
    let id = p
        .spawn(spawn_config().with_image("python:3.12"))
        .await
        .unwrap()
        .id;
    let pod = api.pod(&pod_name(&id)).unwrap();
    assert_eq!(
        pod.metadata.annotations.unwrap()["corral.dev/cpu-limit"],
        "1000m"
    );
    let container = &pod.spec.unwrap().containers[0];
    assert_eq!(container.image.as_deref(), Some("python:3.12"));
}

#[tokio::test]
async fn bad_template_fails_construction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("missing.yaml");
    let result = KataRuntimeProvider::new(
        KataConfig {
            pod_template: Some(path),
            ..kata_config()
        },
        Arc::new(MockPodApi::default()),
    );
    assert_eq!(
        result.err().map(|e| e.code()),
        Some(ErrorCode::ConfigurationError)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_while_creating_leaves_no_pod() {
    let api = MockPodApi::default();
    let p = Arc::new(provider(&api));
    let weak = Arc::downgrade(&p);
    let outcome = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&outcome);
    p.subscribe(
        Some(EventKind::StateChange),
        Arc::new(move |event: &RuntimeEvent| {
            let RuntimeEvent::StateChange {
                runtime_id,
                current_state: RuntimeState::Creating,
                ..
            } = event
            else {
                return;
            };
            let Some(p) = weak.upgrade() else { return };
            let result = tokio::task::block_in_place(|| {
                tokio::runtime::Handle::current().block_on(p.terminate(runtime_id))
            });
            *sink.lock() = Some(result.is_ok());
        }),
    );

    let spawning = tokio::spawn({
        let p = Arc::clone(&p);
        async move { p.spawn(spawn_config()).await }
    });
    let err = spawning.await.unwrap().unwrap_err();
    assert_eq!(*outcome.lock(), Some(true));
    assert_eq!(err.code(), ErrorCode::SpawnError);
    let id = err.runtime_id().unwrap().to_owned();
    assert_eq!(api.pod_count(), 0);
    assert!(p.list_runtimes(None).await.unwrap().is_empty());
    p.terminate(&id).await.unwrap();
    assert!(p.get_runtime(&id).await.unwrap_err().is_not_found());
}
