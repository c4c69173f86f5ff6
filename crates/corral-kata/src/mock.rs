//! In-memory [`PodApi`] for tests and local development.
//!
//! Pods never run anything. Exec sessions are interpreted by a small shell
//! that understands the command lines the provider emits (`cat`, `base64 -d`
//! redirection, `find`, `tar`) plus `echo`, `printenv`, `pwd`, `sleep` and
//! `exit`, joined with `;` or `&&`. Each pod carries its own in-memory file
//! tree. Failure modes are switched on through [`MockBehavior`].

use crate::api::{ApiError, ExecFrame, ExecStream, PodApi};
use crate::pod::MEMORY_CURRENT;
use crate::shell::{absolute, split_words};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use corral_runtime::InputStream;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition, PodStatus};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Switches for the failure modes the mock can simulate.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Pods stay `Pending` forever.
    pub never_ready: bool,
    /// Pods report a `PodScheduled=False` condition with reason `Unschedulable`.
    pub unschedulable: bool,
    /// Pod creation is rejected by a namespace `ResourceQuota`.
    pub quota_exceeded: bool,
    /// Pod creation fails with this transport error.
    pub fail_create: Option<String>,
    /// Number of `get_pod` calls a pod stays `Pending` for before it runs.
    pub ready_after_polls: u32,
    /// Writes to paths ending in any of these fail with "Permission denied".
    pub fail_writes_to: Vec<String>,
    /// Seed for each new pod's `memory.current`.
    pub memory_usage: u64,
}

#[derive(Debug)]
struct MockPod {
    pod: Pod,
    polls: u32,
    failed: bool,
    files: BTreeMap<String, Vec<u8>>,
    /// Directories created explicitly, which may hold no files.
    dirs: BTreeSet<String>,
}

impl MockPod {
    fn has_dir(&self, dir: &str) -> bool {
        let dir = dir.trim_end_matches('/');
        if dir.is_empty() {
            return true;
        }
        let prefix = format!("{dir}/");
        self.dirs
            .iter()
            .any(|d| d == dir || d.starts_with(&prefix))
            || self.files.keys().any(|k| k.starts_with(&prefix))
    }
}

#[derive(Debug, Default)]
struct State {
    behavior: MockBehavior,
    pods: HashMap<String, MockPod>,
    policies: BTreeMap<String, NetworkPolicy>,
    pods_created: usize,
    api_calls: usize,
    execs: Vec<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct MockPodApi {
    namespace: String,
    state: Arc<Mutex<State>>,
}

impl Default for MockPodApi {
    fn default() -> Self {
        Self::new("default")
    }
}

impl MockPodApi {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_owned(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    #[must_use]
    pub fn with_behavior(self, behavior: MockBehavior) -> Self {
        self.state.lock().behavior = behavior;
        self
    }

    pub fn set_behavior(&self, update: impl FnOnce(&mut MockBehavior)) {
        update(&mut self.state.lock().behavior);
    }

    /// Calls made through the [`PodApi`] surface so far.
    pub fn api_calls(&self) -> usize {
        self.state.lock().api_calls
    }

    pub fn pods_created(&self) -> usize {
        self.state.lock().pods_created
    }

    pub fn pod_count(&self) -> usize {
        self.state.lock().pods.len()
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state.lock().pods.get(name).map(|p| p.pod.clone())
    }

    pub fn policy_names(&self) -> Vec<String> {
        self.state.lock().policies.keys().cloned().collect()
    }

    pub fn exec_log(&self) -> Vec<Vec<String>> {
        self.state.lock().execs.clone()
    }

    pub fn file(&self, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .pods
            .get(pod)
            .and_then(|p| p.files.get(path).cloned())
    }

    pub fn put_file(&self, pod: &str, path: &str, data: &[u8]) -> bool {
        match self.state.lock().pods.get_mut(pod) {
            Some(p) => {
                p.files.insert(path.to_owned(), data.to_vec());
                true
            }
            None => false,
        }
    }

    /// Delete a pod behind the provider's back, as an operator or the
    /// cluster itself might.
    pub fn remove_out_of_band(&self, name: &str) -> bool {
        self.state.lock().pods.remove(name).is_some()
    }

    /// Move a pod to phase `Failed`.
    pub fn fail_pod(&self, name: &str) -> bool {
        match self.state.lock().pods.get_mut(name) {
            Some(p) => {
                p.failed = true;
                true
            }
            None => false,
        }
    }

    fn status(behavior: &MockBehavior, pod: &MockPod) -> PodStatus {
        if pod.failed {
            return PodStatus {
                phase: Some("Failed".to_owned()),
                message: Some("container agent terminated: OOMKilled".to_owned()),
                ..PodStatus::default()
            };
        }
        if behavior.unschedulable {
            return PodStatus {
                phase: Some("Pending".to_owned()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_owned(),
                    status: "False".to_owned(),
                    reason: Some("Unschedulable".to_owned()),
                    message: Some("0/3 nodes are available: 3 Insufficient cpu.".to_owned()),
                    ..PodCondition::default()
                }]),
                ..PodStatus::default()
            };
        }
        if behavior.never_ready || pod.polls <= behavior.ready_after_polls {
            return PodStatus {
                phase: Some("Pending".to_owned()),
                ..PodStatus::default()
            };
        }
        PodStatus {
            phase: Some("Running".to_owned()),
            container_statuses: Some(vec![ContainerStatus {
                name: crate::api::CONTAINER_NAME.to_owned(),
                ready: true,
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }
    }
}

fn selector_matches(pod: &Pod, selector: &str) -> bool {
    let labels = pod.metadata.labels.as_ref();
    selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.and_then(|l| l.get(k)).is_some_and(|have| have == v),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

fn valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(prefix) = prefix.parse::<u8>() else {
        return false;
    };
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(_)) => prefix <= 32,
        Ok(IpAddr::V6(_)) => prefix <= 128,
        Err(_) => false,
    }
}

fn policy_cidrs(policy: &NetworkPolicy) -> Vec<(String, &str)> {
    let Some(spec) = policy.spec.as_ref() else {
        return Vec::new();
    };
    let mut cidrs = Vec::new();
    for (i, rule) in spec.ingress.iter().flatten().enumerate() {
        for (j, peer) in rule.from.iter().flatten().enumerate() {
            if let Some(block) = &peer.ip_block {
                cidrs.push((format!("spec.ingress[{i}].from[{j}]"), block.cidr.as_str()));
            }
        }
    }
    for (i, rule) in spec.egress.iter().flatten().enumerate() {
        for (j, peer) in rule.to.iter().flatten().enumerate() {
            if let Some(block) = &peer.ip_block {
                cidrs.push((format!("spec.egress[{i}].to[{j}]"), block.cidr.as_str()));
            }
        }
    }
    cidrs
}

/// Shell state for one exec session.
struct Session {
    cwd: String,
    env: HashMap<String, String>,
    stdin: Vec<u8>,
    frames: Vec<ExecFrame>,
}

enum Step {
    Status(i32),
    Exit(i32),
}

impl Session {
    fn out(&mut self, data: impl Into<Bytes>) {
        self.frames.push(ExecFrame::Stdout(data.into()));
    }

    fn err(&mut self, data: impl Into<Bytes>) {
        self.frames.push(ExecFrame::Stderr(data.into()));
    }

    fn path(&self, path: &str) -> String {
        absolute(&self.cwd, path)
    }
}

impl MockPodApi {
    async fn interpret(&self, pod: &str, script: &str, stdin: Vec<u8>) -> Vec<ExecFrame> {
        let mut session = Session {
            cwd: "/".to_owned(),
            env: HashMap::new(),
            stdin,
            frames: Vec::new(),
        };

        let words = split_words(script);
        let mut status = 0;
        let mut skipping = false;
        for (op, command) in commands(&words) {
            if op == "&&" && status != 0 {
                skipping = true;
            } else if op == ";" {
                skipping = false;
            }
            if skipping {
                continue;
            }
            match self.step(pod, &mut session, command).await {
                Step::Status(code) => status = code,
                Step::Exit(code) => {
                    status = code;
                    break;
                }
            }
        }
        session.frames.push(ExecFrame::Exit(status));
        session.frames
    }

    async fn step(&self, pod: &str, s: &mut Session, argv: &[String]) -> Step {
        let args: Vec<&str> = argv.iter().map(String::as_str).collect();
        let code = match args.as_slice() {
            [] | ["true"] => 0,
            ["mkdir", "-p", "--", dir] => {
                let dir = s.path(dir);
                self.mkdir(pod, &dir);
                0
            }
            ["false"] => 1,
            ["cd", dir] => {
                s.cwd = s.path(dir);
                0
            }
            ["export", assignment] => {
                if let Some((k, v)) = assignment.split_once('=') {
                    s.env.insert(k.to_owned(), v.to_owned());
                }
                0
            }
            ["pwd"] => {
                let line = format!("{}\n", s.cwd);
                s.out(line);
                0
            }
            ["printenv", name] => match s.env.get(*name).cloned() {
                Some(value) => {
                    s.out(format!("{value}\n"));
                    0
                }
                None => 1,
            },
            ["echo", rest @ .., ">&2"] => {
                s.err(format!("{}\n", rest.join(" ")));
                0
            }
            ["echo", rest @ ..] => {
                s.out(format!("{}\n", rest.join(" ")));
                0
            }
            ["sleep", secs] => {
                let secs = secs.parse::<f64>().unwrap_or(0.0).clamp(0.0, 3600.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                0
            }
            ["exit", code] => return Step::Exit(code.parse().unwrap_or(2)),
            ["exit"] => return Step::Exit(0),
            ["cat", "--", path] => {
                let path = s.path(path);
                self.cat(pod, s, &path)
            }
            ["base64", "-d", ">", path] => {
                let path = s.path(path);
                match STANDARD.decode(s.stdin.trim_ascii()) {
                    Ok(data) => self.write(pod, s, &path, data),
                    Err(e) => {
                        s.err(format!("base64: invalid input: {e}\n"));
                        1
                    }
                }
            }
            ["find", dir, "-type", "f"] => {
                let dir = s.path(dir);
                self.find(pod, s, &dir)
            }
            ["tar", "-C", dir, "-cf", "-", "."] => {
                let dir = s.path(dir);
                self.archive(pod, s, &dir)
            }
            ["tar", "-C", dir, "-xf", "-"] => {
                let dir = s.path(dir);
                self.extract(pod, s, &dir)
            }
            [name, ..] => {
                let line = format!("sh: {name}: not found\n");
                s.err(line);
                127
            }
        };
        Step::Status(code)
    }

    fn cat(&self, pod: &str, s: &mut Session, path: &str) -> i32 {
        let data = self.file(pod, path);
        match data {
            Some(data) => {
                if !data.is_empty() {
                    s.out(data);
                }
                0
            }
            None if self.is_dir(pod, path) => {
                s.err(format!("cat: {path}: Is a directory\n"));
                1
            }
            None => {
                s.err(format!("cat: {path}: No such file or directory\n"));
                1
            }
        }
    }

    fn write(&self, pod: &str, s: &mut Session, path: &str, data: Vec<u8>) -> i32 {
        let denied = {
            let state = self.state.lock();
            state
                .behavior
                .fail_writes_to
                .iter()
                .any(|suffix| path.ends_with(suffix.as_str()))
        };
        if denied {
            s.err(format!("sh: {path}: Permission denied\n"));
            return 1;
        }
        self.put_file(pod, path, &data);
        0
    }

    fn is_dir(&self, pod: &str, path: &str) -> bool {
        self.state
            .lock()
            .pods
            .get(pod)
            .is_some_and(|p| p.has_dir(path))
    }

    fn mkdir(&self, pod: &str, dir: &str) {
        if let Some(p) = self.state.lock().pods.get_mut(pod) {
            p.dirs.insert(dir.trim_end_matches('/').to_owned());
        }
    }

    fn find(&self, pod: &str, s: &mut Session, dir: &str) -> i32 {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let files: Option<Vec<String>> = {
            let state = self.state.lock();
            state.pods.get(pod).filter(|p| p.has_dir(dir)).map(|p| {
                p.files
                    .keys()
                    .filter(|k| k.starts_with(&prefix))
                    .cloned()
                    .collect()
            })
        };
        let Some(files) = files else {
            s.err(format!("find: '{dir}': No such file or directory\n"));
            return 1;
        };
        if !files.is_empty() {
            let mut listing = files.join("\n");
            listing.push('\n');
            s.out(listing);
        }
        0
    }

    /// The archive is a JSON map of relative path to base64 content. Only the
    /// mock reads it back.
    fn archive(&self, pod: &str, s: &mut Session, dir: &str) -> i32 {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        let entries: BTreeMap<String, String> = {
            let state = self.state.lock();
            state
                .pods
                .get(pod)
                .map(|p| {
                    p.files
                        .iter()
                        .filter_map(|(k, v)| {
                            k.strip_prefix(&prefix)
                                .map(|rel| (rel.to_owned(), STANDARD.encode(v)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };
        match serde_json::to_vec(&entries) {
            Ok(bytes) => {
                s.out(bytes);
                0
            }
            Err(e) => {
                s.err(format!("tar: {e}\n"));
                2
            }
        }
    }

    fn extract(&self, pod: &str, s: &mut Session, dir: &str) -> i32 {
        let entries: BTreeMap<String, String> = match serde_json::from_slice(&s.stdin) {
            Ok(entries) => entries,
            Err(e) => {
                s.err(format!("tar: this does not look like a tar archive: {e}\n"));
                return 2;
            }
        };
        for (rel, encoded) in entries {
            let Ok(data) = STANDARD.decode(encoded) else {
                s.err(format!("tar: {rel}: corrupt entry\n"));
                return 2;
            };
            self.put_file(pod, &absolute(dir, &rel), &data);
        }
        0
    }
}

/// Split words into commands, each paired with the operator before it.
fn commands(words: &[String]) -> Vec<(&str, &[String])> {
    let mut out = Vec::new();
    let mut op = ";";
    let mut start = 0;
    for (i, word) in words.iter().enumerate() {
        if word == ";" || word == "&&" {
            out.push((op, &words[start..i]));
            op = word.as_str();
            start = i + 1;
        }
    }
    out.push((op, &words[start..]));
    out
}

#[async_trait]
impl PodApi for MockPodApi {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        let name = pod.metadata.name.clone().unwrap_or_default();
        if state.behavior.quota_exceeded {
            return Err(ApiError::Forbidden(format!(
                "pods \"{name}\" is forbidden: exceeded quota: compute-resources, \
                 requested: limits.cpu=1, used: limits.cpu=8, limited: limits.cpu=8"
            )));
        }
        if let Some(message) = state.behavior.fail_create.clone() {
            return Err(ApiError::Transport(message));
        }
        if state.pods.contains_key(&name) {
            return Err(ApiError::Conflict(format!("pods \"{name}\" already exists")));
        }

        let mut files = BTreeMap::new();
        files.insert(
            MEMORY_CURRENT.to_owned(),
            format!("{}\n", state.behavior.memory_usage).into_bytes(),
        );
        let dirs = pod
            .spec
            .iter()
            .flat_map(|spec| &spec.containers)
            .filter_map(|c| c.working_dir.clone())
            .collect();
        let mut created = pod.clone();
        created.status = Some(PodStatus {
            phase: Some("Pending".to_owned()),
            ..PodStatus::default()
        });
        state.pods.insert(
            name,
            MockPod {
                pod: created.clone(),
                polls: 0,
                failed: false,
                files,
                dirs,
            },
        );
        state.pods_created += 1;
        Ok(created)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        let behavior = state.behavior.clone();
        let Some(entry) = state.pods.get_mut(name) else {
            return Ok(None);
        };
        entry.polls = entry.polls.saturating_add(1);
        entry.pod.status = Some(Self::status(&behavior, entry));
        Ok(Some(entry.pod.clone()))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        state
            .pods
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ApiError::NotFound(format!("pods \"{name}\" not found")))
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        Ok(state
            .pods
            .values()
            .filter(|p| selector_matches(&p.pod, label_selector))
            .map(|p| p.pod.clone())
            .collect())
    }

    async fn exec(
        &self,
        pod: &str,
        command: Vec<String>,
        stdin: Option<InputStream>,
    ) -> Result<ExecStream, ApiError> {
        {
            let mut state = self.state.lock();
            state.api_calls += 1;
            if !state.pods.contains_key(pod) {
                return Err(ApiError::NotFound(format!("pods \"{pod}\" not found")));
            }
            state.execs.push(command.clone());
        }

        let script = match command.as_slice() {
            [shell, flag, script] if shell == "/bin/sh" && flag == "-c" => script.clone(),
            _ => command.join(" "),
        };
        let api = self.clone();
        let pod = pod.to_owned();
        let frames = async move {
            let mut input = Vec::new();
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.read_to_end(&mut input).await {
                    return vec![Err(ApiError::Transport(format!("stdin: {e}")))];
                }
            }
            api.interpret(&pod, &script, input)
                .await
                .into_iter()
                .map(Ok)
                .collect::<Vec<Result<ExecFrame, ApiError>>>()
        };
        Ok(stream::once(frames).flat_map(stream::iter).boxed())
    }

    async fn apply_network_policy(&self, policy: &NetworkPolicy) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        let name = policy
            .metadata
            .name
            .clone()
            .ok_or_else(|| ApiError::Invalid("metadata.name: Required value".to_owned()))?;
        if let Some((field, cidr)) = policy_cidrs(policy)
            .into_iter()
            .find(|(_, cidr)| !valid_cidr(cidr))
        {
            return Err(ApiError::Invalid(format!(
                "NetworkPolicy.networking.k8s.io \"{name}\" is invalid: \
                 {field}.ipBlock.cidr: Invalid value: \"{cidr}\": must be a valid CIDR"
            )));
        }
        state.policies.insert(name, policy.clone());
        Ok(())
    }

    async fn delete_network_policy(&self, name: &str) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.api_calls += 1;
        state.policies.remove(name).map(|_| ()).ok_or_else(|| {
            ApiError::NotFound(format!(
                "networkpolicies.networking.k8s.io \"{name}\" not found"
            ))
        })
    }
}
