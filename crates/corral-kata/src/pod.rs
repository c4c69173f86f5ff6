use crate::api::CONTAINER_NAME;
use crate::config::KataConfig;
use crate::template::{PodTemplate, TemplateVars};
use corral_runtime::{NetworkMode, RuntimeError, SpawnConfig};
use k8s_openapi::api::core::v1::Pod;
use serde_json::{json, Map, Value};

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_RUNTIME_ID: &str = "corral.dev/runtime-id";
pub const MANAGER: &str = "corral";

/// cgroup v2 memory usage of the agent container, as seen from inside it.
pub const MEMORY_CURRENT: &str = "/sys/fs/cgroup/memory.current";

/// Keeps the container alive so commands can be exec'd into it.
const IDLE_COMMAND: [&str; 3] = [
    "/bin/sh",
    "-c",
    "trap 'exit 0' TERM; while :; do sleep 3600 & wait $!; done",
];

pub fn pod_name(runtime_id: &str) -> String {
    format!("corral-{runtime_id}")
}

pub fn runtime_selector(runtime_id: &str) -> String {
    format!("{LABEL_RUNTIME_ID}={runtime_id}")
}

pub fn millicores(cpu: f64) -> String {
    format!("{}m", (cpu * 1000.0).round().max(1.0) as u64)
}

/// Requests and limits. Limits are twice the request.
pub fn resource_quantities(spawn: &SpawnConfig) -> Value {
    let r = &spawn.resources;
    let mut requests = Map::new();
    let mut limits = Map::new();
    requests.insert("cpu".to_owned(), json!(millicores(r.cpu)));
    limits.insert("cpu".to_owned(), json!(millicores(r.cpu * 2.0)));
    requests.insert("memory".to_owned(), json!(r.memory.to_string()));
    limits.insert(
        "memory".to_owned(),
        json!(r.memory.saturating_mul(2).to_string()),
    );
    if let Some(disk) = r.disk {
        requests.insert("ephemeral-storage".to_owned(), json!(disk.to_string()));
        limits.insert(
            "ephemeral-storage".to_owned(),
            json!(disk.saturating_mul(2).to_string()),
        );
    }
    json!({ "requests": requests, "limits": limits })
}

pub fn template_vars(runtime_id: &str, kata: &KataConfig, spawn: &SpawnConfig) -> TemplateVars {
    let r = &spawn.resources;
    let mut vars = TemplateVars::new();
    vars.insert("AGENT_ID", runtime_id.to_owned());
    vars.insert("NAMESPACE", kata.namespace.clone());
    vars.insert("IMAGE", image(kata, spawn).to_owned());
    vars.insert("RUNTIME_CLASS", kata.runtime_class.clone());
    vars.insert("CPU_REQUEST", millicores(r.cpu));
    vars.insert("CPU_LIMIT", millicores(r.cpu * 2.0));
    vars.insert("MEMORY_REQUEST", r.memory.to_string());
    vars.insert("MEMORY_LIMIT", r.memory.saturating_mul(2).to_string());
    vars
}

fn image<'a>(kata: &'a KataConfig, spawn: &'a SpawnConfig) -> &'a str {
    spawn.image.as_deref().unwrap_or(&kata.default_image)
}

fn skeleton() -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {},
        "spec": { "containers": [] },
    })
}

fn take_object(obj: &mut Map<String, Value>, key: &str) -> Map<String, Value> {
    match obj.remove(key) {
        Some(Value::Object(map)) => map,
        _ => Map::new(),
    }
}

fn take_array(obj: &mut Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// Build the runtime pod, starting from the operator template when one is
/// configured.
pub fn build_pod(
    runtime_id: &str,
    kata: &KataConfig,
    spawn: &SpawnConfig,
    template: Option<&PodTemplate>,
) -> Result<Pod, RuntimeError> {
    let doc = match template {
        Some(t) => t.build(&template_vars(runtime_id, kata, spawn), &kata.runtime_class)?,
        None => skeleton(),
    };
    let Value::Object(mut root) = doc else {
        return Err(RuntimeError::configuration("pod manifest must be a mapping"));
    };

    let mut metadata = take_object(&mut root, "metadata");
    metadata.insert("name".to_owned(), json!(pod_name(runtime_id)));
    metadata.insert("namespace".to_owned(), json!(kata.namespace));
    let mut labels = take_object(&mut metadata, "labels");
    for (k, v) in &spawn.labels {
        labels.insert(k.clone(), json!(v));
    }
    labels.insert(LABEL_MANAGED_BY.to_owned(), json!(MANAGER));
    labels.insert(LABEL_RUNTIME_ID.to_owned(), json!(runtime_id));
    metadata.insert("labels".to_owned(), Value::Object(labels));
    root.insert("metadata".to_owned(), Value::Object(metadata));

    let mut spec = take_object(&mut root, "spec");
    spec.insert("runtimeClassName".to_owned(), json!(kata.runtime_class));
    spec.insert("restartPolicy".to_owned(), json!("Never"));
    if let Some(account) = &kata.service_account {
        spec.insert("serviceAccountName".to_owned(), json!(account));
    }
    if let Some(network) = &spawn.network {
        if network.mode == NetworkMode::Host {
            spec.insert("hostNetwork".to_owned(), json!(true));
        }
        if !network.dns.is_empty() {
            spec.insert("dnsPolicy".to_owned(), json!("None"));
            spec.insert(
                "dnsConfig".to_owned(),
                json!({ "nameservers": network.dns }),
            );
        }
    }

    if !spawn.volumes.is_empty() {
        let mut volumes = take_array(&mut spec, "volumes");
        for v in &spawn.volumes {
            volumes.push(json!({
                "name": v.name,
                "hostPath": { "path": v.source.to_string_lossy() },
            }));
        }
        spec.insert("volumes".to_owned(), Value::Array(volumes));
    }

    let mut containers = take_array(&mut spec, "containers");
    let index = containers
        .iter()
        .position(|c| c.get("name").and_then(Value::as_str) == Some(CONTAINER_NAME));
    let mut container = match index {
        Some(i) => match containers.remove(i) {
            Value::Object(map) => map,
            _ => {
                return Err(RuntimeError::configuration(
                    "pod template container entries must be mappings",
                ))
            }
        },
        None => Map::new(),
    };

    container.insert("name".to_owned(), json!(CONTAINER_NAME));
    container.insert("image".to_owned(), json!(image(kata, spawn)));
    container
        .entry("command".to_owned())
        .or_insert_with(|| json!(IDLE_COMMAND));
    container.insert("workingDir".to_owned(), json!(kata.workdir));
    container.insert("resources".to_owned(), resource_quantities(spawn));

    let mut env = take_array(&mut container, "env");
    env.retain(|e| {
        e.get("name")
            .and_then(Value::as_str)
            .is_none_or(|n| !spawn.env.contains_key(n))
    });
    for (k, v) in &spawn.env {
        env.push(json!({ "name": k, "value": v }));
    }
    if !env.is_empty() {
        container.insert("env".to_owned(), Value::Array(env));
    }

    if !spawn.volumes.is_empty() {
        let mut mounts = take_array(&mut container, "volumeMounts");
        for v in &spawn.volumes {
            mounts.push(json!({
                "name": v.name,
                "mountPath": v.destination,
                "readOnly": v.read_only,
            }));
        }
        container.insert("volumeMounts".to_owned(), Value::Array(mounts));
    }

    containers.insert(index.unwrap_or(containers.len()), Value::Object(container));
    spec.insert("containers".to_owned(), Value::Array(containers));
    root.insert("spec".to_owned(), Value::Object(spec));

    serde_json::from_value(Value::Object(root)).map_err(|e| {
        RuntimeError::configuration(format!("pod manifest does not describe a valid pod: {e}"))
    })
}

/// Where a pod stands on its way to accepting exec sessions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// The pod will never become ready.
    Failed(String),
}

/// Ready means phase `Running` with every container reporting ready.
pub fn readiness(pod: &Pod) -> Readiness {
    let Some(status) = pod.status.as_ref() else {
        return Readiness::Waiting;
    };
    let unschedulable = status.conditions.iter().flatten().find(|c| {
        c.type_ == "PodScheduled"
            && c.status == "False"
            && c.reason.as_deref() == Some("Unschedulable")
    });
    if let Some(condition) = unschedulable {
        return Readiness::Failed(format!(
            "pod is unschedulable: {}",
            condition.message.as_deref().unwrap_or("no message")
        ));
    }
    match status.phase.as_deref() {
        Some("Running") => {
            let containers = status.container_statuses.as_deref().unwrap_or_default();
            if !containers.is_empty() && containers.iter().all(|c| c.ready) {
                Readiness::Ready
            } else {
                Readiness::Waiting
            }
        }
        Some(phase @ ("Failed" | "Succeeded")) => Readiness::Failed(format!(
            "pod entered phase {phase}: {}",
            status.message.as_deref().unwrap_or("no message")
        )),
        _ => Readiness::Waiting,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_runtime::{NetworkConfig, ResourceRequest, RuntimeKind, VolumeMount};
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    fn spawn_config() -> SpawnConfig {
        SpawnConfig::new(RuntimeKind::Kata)
            .with_resources(ResourceRequest {
                cpu: 0.5,
                memory: 256 * 1024 * 1024,
                disk: Some(1024),
                max_agents: None,
            })
            .with_env("MODE", "secure")
            .with_label("team", "core")
    }

    #[test]
    fn limits_are_twice_requests() {
        let pod = build_pod("kata-1-1", &KataConfig::default(), &spawn_config(), None).unwrap();
        let container = &pod.spec.as_ref().unwrap().containers[0];
        let resources = container.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(requests["cpu"], Quantity("500m".to_owned()));
        assert_eq!(limits["cpu"], Quantity("1000m".to_owned()));
        assert_eq!(requests["memory"], Quantity("268435456".to_owned()));
        assert_eq!(limits["memory"], Quantity("536870912".to_owned()));
        assert_eq!(limits["ephemeral-storage"], Quantity("2048".to_owned()));
    }

    #[test]
    fn pod_carries_identity_and_runtime_class() {
        let kata = KataConfig {
            service_account: Some("agents".to_owned()),
            ..KataConfig::default()
        };
        let pod = build_pod("kata-7-1", &kata, &spawn_config(), None).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("corral-kata-7-1"));
        let labels = pod.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[LABEL_RUNTIME_ID], "kata-7-1");
        assert_eq!(labels["team"], "core");
        let spec = pod.spec.as_ref().unwrap();
        assert_eq!(spec.runtime_class_name.as_deref(), Some("kata"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.service_account_name.as_deref(), Some("agents"));
        let container = &spec.containers[0];
        assert_eq!(container.name, CONTAINER_NAME);
        assert_eq!(container.image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(container.working_dir.as_deref(), Some("/workspace"));
        let env = container.env.as_ref().unwrap();
        assert!(env.iter().any(|e| e.name == "MODE" && e.value.as_deref() == Some("secure")));
    }

    #[test]
    fn volumes_and_dns_are_mapped() {
        let spawn = spawn_config()
            .with_volume(VolumeMount {
                name: "cache".to_owned(),
                source: "/var/cache/agents".into(),
                destination: "/cache".to_owned(),
                read_only: true,
            })
            .with_network(NetworkConfig {
                mode: NetworkMode::Bridge,
                dns: vec!["10.0.0.10".to_owned()],
                policies: Vec::new(),
            });
        let pod = build_pod("kata-2-1", &KataConfig::default(), &spawn, None).unwrap();
        let spec = pod.spec.unwrap();
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(volume.host_path.as_ref().unwrap().path, "/var/cache/agents");
        let mount = &spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.mount_path, "/cache");
        assert_eq!(mount.read_only, Some(true));
        assert_eq!(spec.dns_policy.as_deref(), Some("None"));
        assert_eq!(
            spec.dns_config.unwrap().nameservers.unwrap(),
            vec!["10.0.0.10".to_owned()]
        );
    }

    #[test]
    fn template_is_overlaid() {
        let template = PodTemplate::new(
            r#"
apiVersion: v1
kind: Pod
metadata:
  name: ignored
  labels:
    tier: sandbox
spec:
  runtimeClassName: "{{RUNTIME_CLASS}}"
  nodeSelector:
    isolation: microvm
  containers:
    - name: sidecar
      image: proxy:1
    - name: agent
      image: "{{IMAGE}}"
      command: ["/init"]
      env:
        - name: MODE
          value: overridden
"#,
        );
        let pod = build_pod("kata-3-1", &KataConfig::default(), &spawn_config(), Some(&template))
            .unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("corral-kata-3-1"));
        assert_eq!(pod.metadata.labels.as_ref().unwrap()["tier"], "sandbox");
        let spec = pod.spec.unwrap();
        assert_eq!(spec.node_selector.unwrap()["isolation"], "microvm");
        assert_eq!(spec.containers.len(), 2);
        let agent = &spec.containers[1];
        assert_eq!(agent.command.as_deref(), Some(&["/init".to_owned()][..]));
        let env = agent.env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("secure"));
    }

    fn with_status(status: PodStatus) -> Pod {
        Pod {
            status: Some(status),
            ..Pod::default()
        }
    }

    #[test]
    fn readiness_requires_running_and_ready_containers() {
        assert_eq!(readiness(&Pod::default()), Readiness::Waiting);

        let starting = with_status(PodStatus {
            phase: Some("Running".to_owned()),
            container_statuses: Some(vec![ContainerStatus {
                name: CONTAINER_NAME.to_owned(),
                ready: false,
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });
        assert_eq!(readiness(&starting), Readiness::Waiting);

        let ready = with_status(PodStatus {
            phase: Some("Running".to_owned()),
            container_statuses: Some(vec![ContainerStatus {
                name: CONTAINER_NAME.to_owned(),
                ready: true,
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        });
        assert_eq!(readiness(&ready), Readiness::Ready);
    }

    #[test]
    fn unschedulable_and_failed_pods_never_become_ready() {
        let unschedulable = with_status(PodStatus {
            phase: Some("Pending".to_owned()),
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_owned(),
                status: "False".to_owned(),
                reason: Some("Unschedulable".to_owned()),
                message: Some("0/3 nodes are available: 3 Insufficient memory.".to_owned()),
                ..PodCondition::default()
            }]),
            ..PodStatus::default()
        });
        assert!(matches!(
            readiness(&unschedulable),
            Readiness::Failed(m) if m.contains("Insufficient memory")
        ));

        let failed = with_status(PodStatus {
            phase: Some("Failed".to_owned()),
            ..PodStatus::default()
        });
        assert!(matches!(readiness(&failed), Readiness::Failed(_)));
    }
}
