//! Translation of runtime network policies into Kubernetes `NetworkPolicy`
//! objects selecting a single runtime pod.

use crate::pod::{LABEL_MANAGED_BY, LABEL_RUNTIME_ID, MANAGER};
use corral_runtime::{NetworkConfig, NetworkMode, NetworkPolicy, NetworkRule, RuntimeError};
use k8s_openapi::api::networking::v1::NetworkPolicy as KubeNetworkPolicy;
use serde_json::{json, Map, Value};

/// Kubernetes has no domain matcher; requested domains are recorded here for
/// an egress proxy or audit tooling to pick up.
pub const ANNOTATION_EGRESS_DOMAINS: &str = "corral.dev/egress-domains";

const MAX_NAME_LEN: usize = 63;

/// A policy with no rules: both directions denied.
pub fn deny_all() -> NetworkPolicy {
    NetworkPolicy {
        name: "deny-all".to_owned(),
        ingress: Vec::new(),
        egress: Vec::new(),
    }
}

/// Policies to apply for a spawn. `none` networking adds a deny-all policy
/// in front of the caller's own.
pub fn policies_for(network: Option<&NetworkConfig>) -> Vec<NetworkPolicy> {
    let Some(network) = network else {
        return Vec::new();
    };
    let mut policies = Vec::with_capacity(network.policies.len() + 1);
    if network.mode == NetworkMode::None {
        policies.push(deny_all());
    }
    policies.extend(network.policies.iter().cloned());
    policies
}

/// Object name for `policy` on `runtime_id`, as a DNS-1123 label.
pub fn policy_name(runtime_id: &str, policy: &str) -> String {
    let raw = format!("corral-{runtime_id}-{policy}").to_ascii_lowercase();
    let mut name: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    name.truncate(MAX_NAME_LEN);
    name.trim_matches('-').to_owned()
}

fn ports(rule: &NetworkRule) -> Vec<Value> {
    rule.ports
        .iter()
        .map(|p| json!({ "port": p.port, "protocol": p.protocol.to_string() }))
        .collect()
}

fn peers(rule: &NetworkRule) -> Vec<Value> {
    rule.cidrs
        .iter()
        .map(|cidr| json!({ "ipBlock": { "cidr": cidr } }))
        .collect()
}

/// Empty matcher lists are left out so they match everything.
fn rule(rule: &NetworkRule, peer_key: &str) -> Value {
    let mut out = Map::new();
    let peers = peers(rule);
    if !peers.is_empty() {
        out.insert(peer_key.to_owned(), Value::Array(peers));
    }
    let ports = ports(rule);
    if !ports.is_empty() {
        out.insert("ports".to_owned(), Value::Array(ports));
    }
    Value::Object(out)
}

pub fn to_kube(
    namespace: &str,
    runtime_id: &str,
    policy: &NetworkPolicy,
) -> Result<KubeNetworkPolicy, RuntimeError> {
    let deny_everything = policy.ingress.is_empty() && policy.egress.is_empty();
    let mut types = Vec::new();
    if deny_everything || !policy.ingress.is_empty() {
        types.push("Ingress");
    }
    if deny_everything || !policy.egress.is_empty() {
        types.push("Egress");
    }

    let domains: Vec<&str> = policy
        .ingress
        .iter()
        .chain(&policy.egress)
        .flat_map(|r| r.domains.iter().map(String::as_str))
        .collect();
    let mut annotations = Map::new();
    if !domains.is_empty() {
        annotations.insert(ANNOTATION_EGRESS_DOMAINS.to_owned(), json!(domains.join(",")));
    }

    let doc = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "NetworkPolicy",
        "metadata": {
            "name": policy_name(runtime_id, &policy.name),
            "namespace": namespace,
            "labels": {
                LABEL_MANAGED_BY: MANAGER,
                LABEL_RUNTIME_ID: runtime_id,
            },
            "annotations": annotations,
        },
        "spec": {
            "podSelector": { "matchLabels": { LABEL_RUNTIME_ID: runtime_id } },
            "policyTypes": types,
            "ingress": policy.ingress.iter().map(|r| rule(r, "from")).collect::<Vec<_>>(),
            "egress": policy.egress.iter().map(|r| rule(r, "to")).collect::<Vec<_>>(),
        },
    });

    serde_json::from_value(doc).map_err(|e| {
        RuntimeError::configuration(format!("network policy '{}' is malformed: {e}", policy.name))
            .with_runtime(runtime_id)
    })
}
