//! Simulated Control Plane
//!
//! Deterministic in-memory cluster with a scheduler, a provisioner and a
//! kubelet that interprets the probe scripts against per-volume file maps.
//! The cluster advances on every API call, so polling workflows make
//! progress under a paused clock. Faults can be switched on to drive the
//! failure paths.

use super::{is_default_class, DEFAULT_CLASS_ANNOTATION};
use crate::domain::ports::{ControlPlane, ControlPlaneRef, SnapshotProvider, TakenSnapshot};
use crate::domain::types::{claim_volume_name, BindingMode, ClaimPhase, ReclaimPolicy, STORAGE_RESOURCE};
use crate::error::{Error, Result};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::{Release, Teardown};
use crate::provisioning::topology::is_ready_schedulable;
use crate::provisioning::workload::{CONTAINER_NAME, MOUNT_PATH};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStatus, Node, NodeCondition, NodeSelectorRequirement,
    NodeSelectorTerm, NodeSpec, NodeStatus, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimStatus, PersistentVolumeSpec, PersistentVolumeStatus, Pod, PodCondition, PodSpec,
    PodStatus,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Annotation the scheduler puts on delayed-binding claims
pub const SELECTED_NODE_ANNOTATION: &str = "volume.kubernetes.io/selected-node";

const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Device contents live under this file key
const DEVICE: &str = "";

type Key = (String, String);
type Files = BTreeMap<String, String>;

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

// =============================================================================
// Faults
// =============================================================================

/// Switchable misbehaviour
#[derive(Debug, Default)]
pub struct Faults {
    stall_provisioning: AtomicBool,
    drop_mount_options: AtomicBool,
    discard_writes: AtomicBool,
    fail_claim_deletes: AtomicBool,
}

impl Faults {
    /// Claims are never provisioned
    pub fn stall_provisioning(&self, on: bool) {
        self.stall_provisioning.store(on, Ordering::SeqCst);
    }

    /// Volumes are mounted without their mount options
    pub fn drop_mount_options(&self, on: bool) {
        self.drop_mount_options.store(on, Ordering::SeqCst);
    }

    /// Writes report success but never reach the volume
    pub fn discard_writes(&self, on: bool) {
        self.discard_writes.store(on, Ordering::SeqCst);
    }

    /// Claim deletion is rejected
    pub fn fail_claim_deletes(&self, on: bool) {
        self.fail_claim_deletes.store(on, Ordering::SeqCst);
    }

    fn on(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Probe Scripts
// =============================================================================

/// One command of a probe script
#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    /// Write `content` plus a newline; `None` writes the raw device
    Write { file: Option<String>, content: String },
    /// File must contain `content`
    Grep { file: String, content: String },
    /// Volume must be mounted with `option`
    MountOption(String),
    /// First `len` device bytes must contain `content`
    DeviceHead { len: usize, content: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Program {
    /// Runs until deleted
    Hold,
    Steps(Vec<Step>),
    Unknown,
}

fn quoted(s: &str) -> Option<(&str, &str)> {
    let rest = s.strip_prefix('\'')?;
    rest.split_once('\'')
}

fn parse_script(script: &str) -> Program {
    let script = script.trim();
    let file_prefix = format!("{}/", MOUNT_PATH);

    if script == "true" {
        return Program::Steps(Vec::new());
    }
    if script.starts_with("trap exit TERM") {
        return Program::Hold;
    }

    if let Some(rest) = script.strip_prefix("echo ") {
        let Some((content, rest)) = quoted(rest) else { return Program::Unknown };
        let rest = rest.trim_start();
        if let Some(target) = rest.strip_prefix("> ").and_then(|r| r.strip_prefix(file_prefix.as_str())) {
            let file = target.split_whitespace().next().unwrap_or_default();
            return Program::Steps(vec![Step::Write {
                file: Some(file.to_string()),
                content: content.to_string(),
            }]);
        }
        if rest.starts_with(&format!("| dd of={}", MOUNT_PATH)) {
            return Program::Steps(vec![Step::Write {
                file: None,
                content: content.to_string(),
            }]);
        }
        return Program::Unknown;
    }

    if let Some(rest) = script.strip_prefix("grep ") {
        let Some((content, rest)) = quoted(rest) else { return Program::Unknown };
        let Some(target) = rest.trim_start().strip_prefix(file_prefix.as_str()) else {
            return Program::Unknown;
        };
        let file = target.split_whitespace().next().unwrap_or_default();
        let mut steps = vec![Step::Grep {
            file: file.to_string(),
            content: content.to_string(),
        }];
        for (index, _) in rest.match_indices("grep -q ,") {
            let option = rest[index + "grep -q ,".len()..]
                .split(',')
                .next()
                .unwrap_or_default();
            steps.push(Step::MountOption(option.to_string()));
        }
        return Program::Steps(steps);
    }

    if let Some(rest) = script.strip_prefix("head -c ") {
        let Some((len, rest)) = rest.split_once(' ') else { return Program::Unknown };
        let Ok(len) = len.parse::<usize>() else { return Program::Unknown };
        let Some(index) = rest.find("grep ") else { return Program::Unknown };
        let Some((content, _)) = quoted(&rest[index + "grep ".len()..]) else {
            return Program::Unknown;
        };
        return Program::Steps(vec![Step::DeviceHead {
            len,
            content: content.to_string(),
        }]);
    }

    Program::Unknown
}

/// Outcome of running a script: exit code and log output
struct Execution {
    exit_code: i32,
    logs: String,
}

fn execute(steps: &[Step], files: &mut Files, mount_options: &[String], discard_writes: bool) -> Execution {
    let mut logs = String::new();
    for step in steps {
        match step {
            Step::Write { file, content } => {
                if discard_writes {
                    continue;
                }
                let written = format!("{}\n", content);
                match file {
                    Some(file) => {
                        files.insert(file.clone(), written);
                    }
                    None => {
                        let device = files.entry(DEVICE.to_string()).or_default();
                        let tail = device.get(written.len()..).unwrap_or_default().to_string();
                        *device = written + &tail;
                    }
                }
            }
            Step::Grep { file, content } => match files.get(file) {
                None => {
                    logs.push_str(&format!("grep: {}/{}: No such file or directory\n", MOUNT_PATH, file));
                    return Execution { exit_code: 2, logs };
                }
                Some(data) if data.contains(content.as_str()) => {
                    logs.push_str(data);
                }
                Some(_) => return Execution { exit_code: 1, logs },
            },
            Step::MountOption(option) => {
                if !mount_options.iter().any(|o| o == option) {
                    logs.push_str(&format!(
                        "/dev/sim on {} type ext4 ({})\n",
                        MOUNT_PATH,
                        mount_options.join(",")
                    ));
                    return Execution { exit_code: 1, logs };
                }
            }
            Step::DeviceHead { len, content } => {
                let device = files.get(DEVICE).map(String::as_str).unwrap_or_default();
                let head = device.get(..(*len).min(device.len())).unwrap_or(device);
                if !head.contains(content.as_str()) {
                    return Execution { exit_code: 1, logs };
                }
                logs.push_str(head);
            }
        }
    }
    Execution { exit_code: 0, logs }
}

// =============================================================================
// Scheduling
// =============================================================================

fn requirement_matches(requirement: &NodeSelectorRequirement, value: Option<&str>) -> bool {
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.iter().any(|x| x == v)),
        "NotIn" => !value.is_some_and(|v| values.iter().any(|x| x == v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        operator @ ("Gt" | "Lt") => {
            let actual = value.and_then(|v| v.parse::<i64>().ok());
            let bound = values.first().and_then(|b| b.parse::<i64>().ok());
            match (actual, bound) {
                (Some(actual), Some(bound)) if operator == "Gt" => actual > bound,
                (Some(actual), Some(bound)) => actual < bound,
                _ => false,
            }
        }
        _ => false,
    }
}

fn term_matches(node: &Node, term: &NodeSelectorTerm) -> bool {
    let name = node.name_any();
    let labels = node.labels();

    let fields = term.match_fields.iter().flatten().all(|r| {
        let value = (r.key == "metadata.name").then_some(name.as_str());
        requirement_matches(r, value)
    });
    let expressions = term
        .match_expressions
        .iter()
        .flatten()
        .all(|r| requirement_matches(r, labels.get(&r.key).map(String::as_str)));
    fields && expressions
}

fn node_fits(node: &Node, spec: &PodSpec) -> bool {
    let labels = node.labels();
    if let Some(selector) = &spec.node_selector {
        if !selector.iter().all(|(k, v)| labels.get(k) == Some(v)) {
            return false;
        }
    }

    let terms = spec
        .affinity
        .as_ref()
        .and_then(|a| a.node_affinity.as_ref())
        .and_then(|n| n.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|r| r.node_selector_terms.as_slice())
        .unwrap_or_default();
    terms.is_empty() || terms.iter().any(|term| term_matches(node, term))
}

fn pod_claims(pod: &Pod) -> Vec<String> {
    pod.spec
        .iter()
        .flat_map(|s| s.volumes.iter().flatten())
        .filter_map(|v| v.persistent_volume_claim.as_ref())
        .map(|c| c.claim_name.clone())
        .collect()
}

fn pod_script(pod: &Pod) -> String {
    pod.spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.args.as_ref())
        .and_then(|args| args.first())
        .cloned()
        .unwrap_or_default()
}

fn set_scheduled_condition(pod: &mut Pod, scheduled: bool) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|c| c.type_ != "PodScheduled");
    conditions.push(PodCondition {
        type_: "PodScheduled".to_string(),
        status: if scheduled { "True" } else { "False" }.to_string(),
        reason: (!scheduled).then(|| "Unschedulable".to_string()),
        message: (!scheduled).then(|| "0 nodes are available".to_string()),
        ..Default::default()
    });
}

fn ready_node(name: &str) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(HOSTNAME_LABEL.to_string(), name.to_string())])),
            ..Default::default()
        },
        spec: Some(NodeSpec::default()),
        status: Some(NodeStatus {
            conditions: Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
    }
}

// =============================================================================
// Cluster State
// =============================================================================

struct ClaimRecord {
    claim: PersistentVolumeClaim,
    created: Instant,
}

struct PodRecord {
    pod: Pod,
    logs: String,
    scheduled: bool,
    started: bool,
}

#[derive(Default)]
struct State {
    claims: BTreeMap<Key, ClaimRecord>,
    volumes: BTreeMap<String, PersistentVolume>,
    classes: BTreeMap<String, StorageClass>,
    pods: BTreeMap<Key, PodRecord>,
    nodes: BTreeMap<String, Node>,
    /// Volume name to its files
    data: BTreeMap<String, Files>,
    snapshots: BTreeMap<Key, Files>,
    /// Pod name and node, in scheduling order
    placements: Vec<(String, String)>,
    serial: u64,
    provisioning_delay: Duration,
}

impl State {
    fn next_serial(&mut self) -> u64 {
        self.serial += 1;
        self.serial
    }

    /// Fill in name, uid and resource version of a new object
    fn stamp(&mut self, meta: &mut ObjectMeta, kind: &str) -> Result<String> {
        let serial = self.next_serial();
        let name = match (meta.name.as_deref(), meta.generate_name.as_deref()) {
            (Some(name), _) if !name.is_empty() => name.to_string(),
            (_, Some(prefix)) if !prefix.is_empty() => format!("{}{:05x}", prefix, serial),
            _ => {
                return Err(Error::Platform(format!(
                    "{} needs a name or generateName",
                    kind
                )))
            }
        };
        meta.name = Some(name.clone());
        meta.uid = Some(format!("00000000-0000-4000-8000-{:012x}", serial));
        meta.resource_version = Some(serial.to_string());
        Ok(name)
    }

    fn default_class(&self) -> Result<Option<&StorageClass>> {
        let defaults: Vec<&StorageClass> = self
            .classes
            .values()
            .filter(|c| is_default_class(c))
            .collect();
        match defaults.as_slice() {
            [] => Ok(None),
            [class] => Ok(Some(class)),
            _ => Err(Error::Configuration(format!(
                "{} storage classes are marked as default",
                defaults.len()
            ))),
        }
    }

    /// Class a claim provisions from; `None` when it never gets one
    fn claim_class(&self, claim: &PersistentVolumeClaim) -> Option<&StorageClass> {
        match claim.spec.as_ref().and_then(|s| s.storage_class_name.as_deref()) {
            Some("") => None,
            Some(name) => self.classes.get(name),
            None => self.default_class().ok().flatten(),
        }
    }

    fn claim_is(&self, claim: &PersistentVolumeClaim, phase: ClaimPhase) -> bool {
        ClaimPhase::of(claim).ok() == Some(phase)
    }

    fn reconcile(&mut self, faults: &Faults, now: Instant) {
        self.schedule_pods();
        self.provision_claims(faults, now);
        self.run_pods(faults);
    }

    fn pick_node(&self, spec: &PodSpec) -> Option<String> {
        if let Some(name) = spec.node_name.as_deref().filter(|n| !n.is_empty()) {
            return self.nodes.contains_key(name).then(|| name.to_string());
        }
        self.nodes
            .values()
            .filter(|node| is_ready_schedulable(node))
            .find(|node| node_fits(node, spec))
            .map(|node| node.name_any())
    }

    fn schedule_pods(&mut self) {
        let waiting: Vec<Key> = self
            .pods
            .iter()
            .filter(|(_, record)| !record.scheduled)
            .map(|(key, _)| key.clone())
            .collect();

        for pod_key in waiting {
            let Some(pod) = self.pods.get(&pod_key).map(|r| r.pod.clone()) else { continue };

            // Missing claims and unbound immediate claims hold the pod back
            let mut delayed = Vec::new();
            let mut blocked = false;
            for claim_name in pod_claims(&pod) {
                let claim_key = key(&pod_key.0, &claim_name);
                match self.claims.get(&claim_key) {
                    None => blocked = true,
                    Some(record) if self.claim_is(&record.claim, ClaimPhase::Pending) => {
                        let mode = self
                            .claim_class(&record.claim)
                            .and_then(|c| BindingMode::of_class(c).ok())
                            .unwrap_or_default();
                        if mode == BindingMode::WaitForFirstConsumer {
                            delayed.push(claim_key);
                        } else {
                            blocked = true;
                        }
                    }
                    Some(_) => {}
                }
            }
            if blocked {
                continue;
            }

            let node = pod.spec.as_ref().and_then(|spec| self.pick_node(spec));
            let Some(record) = self.pods.get_mut(&pod_key) else { continue };
            let Some(node) = node else {
                set_scheduled_condition(&mut record.pod, false);
                continue;
            };

            debug!("scheduled pod {}/{} onto {}", pod_key.0, pod_key.1, node);
            if let Some(spec) = record.pod.spec.as_mut() {
                spec.node_name = Some(node.clone());
            }
            set_scheduled_condition(&mut record.pod, true);
            record.scheduled = true;
            self.placements.push((pod_key.1.clone(), node.clone()));

            for claim_key in delayed {
                if let Some(record) = self.claims.get_mut(&claim_key) {
                    record
                        .claim
                        .annotations_mut()
                        .insert(SELECTED_NODE_ANNOTATION.to_string(), node.clone());
                }
            }
        }
    }

    /// Files a new claim starts with; `None` while the source isn't ready
    fn source_files(&self, namespace: &str, claim: &PersistentVolumeClaim) -> Option<Files> {
        let Some(source) = claim.spec.as_ref().and_then(|s| s.data_source.as_ref()) else {
            return Some(Files::new());
        };
        match source.kind.as_str() {
            "PersistentVolumeClaim" => {
                let record = self.claims.get(&key(namespace, &source.name))?;
                if !self.claim_is(&record.claim, ClaimPhase::Bound) {
                    return None;
                }
                let volume = claim_volume_name(&record.claim)?;
                Some(self.data.get(volume).cloned().unwrap_or_default())
            }
            "VolumeSnapshot" => self.snapshots.get(&key(namespace, &source.name)).cloned(),
            _ => None,
        }
    }

    fn provision_claims(&mut self, faults: &Faults, now: Instant) {
        if Faults::on(&faults.stall_provisioning) {
            return;
        }
        let due: Vec<Key> = self
            .claims
            .iter()
            .filter(|(_, r)| self.claim_is(&r.claim, ClaimPhase::Pending))
            .filter(|(_, r)| now.duration_since(r.created) >= self.provisioning_delay)
            .map(|(key, _)| key.clone())
            .collect();

        for claim_key in due {
            let Some(claim) = self.claims.get(&claim_key).map(|r| r.claim.clone()) else { continue };
            let Some(class) = self.claim_class(&claim).cloned() else { continue };

            let mode = BindingMode::of_class(&class).unwrap_or_default();
            if mode == BindingMode::WaitForFirstConsumer
                && !claim.annotations().contains_key(SELECTED_NODE_ANNOTATION)
            {
                continue;
            }
            let Some(files) = self.source_files(&claim_key.0, &claim) else { continue };
            self.bind(&claim_key, claim, &class, files);
        }
    }

    fn bind(&mut self, claim_key: &Key, mut claim: PersistentVolumeClaim, class: &StorageClass, files: Files) {
        let uid = claim.metadata.uid.clone().unwrap_or_default();
        let volume_name = format!("pvc-{}", uid);
        let serial = self.next_serial();
        let spec = claim.spec.clone().unwrap_or_default();

        let capacity: BTreeMap<String, Quantity> = spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get(STORAGE_RESOURCE))
            .map(|q| BTreeMap::from([(STORAGE_RESOURCE.to_string(), q.clone())]))
            .unwrap_or_default();
        let policy = ReclaimPolicy::of_class(class).unwrap_or(ReclaimPolicy::Delete);

        let volume = PersistentVolume {
            metadata: ObjectMeta {
                name: Some(volume_name.clone()),
                uid: Some(format!("00000000-0000-4000-9000-{:012x}", serial)),
                resource_version: Some(serial.to_string()),
                annotations: Some(BTreeMap::from([(
                    "pv.kubernetes.io/provisioned-by".to_string(),
                    class.provisioner.clone(),
                )])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                capacity: Some(capacity.clone()),
                access_modes: spec.access_modes.clone(),
                claim_ref: Some(ObjectReference {
                    kind: Some("PersistentVolumeClaim".to_string()),
                    namespace: Some(claim_key.0.clone()),
                    name: Some(claim_key.1.clone()),
                    uid: Some(uid),
                    ..Default::default()
                }),
                persistent_volume_reclaim_policy: Some(policy.to_string()),
                mount_options: class.mount_options.clone(),
                volume_mode: Some(spec.volume_mode.clone().unwrap_or_else(|| "Filesystem".to_string())),
                storage_class_name: Some(class.name_any()),
                ..Default::default()
            }),
            status: Some(PersistentVolumeStatus {
                phase: Some("Bound".to_string()),
                ..Default::default()
            }),
        };
        debug!("provisioned {} for claim {}/{}", volume_name, claim_key.0, claim_key.1);

        if let Some(claim_spec) = claim.spec.as_mut() {
            claim_spec.volume_name = Some(volume_name.clone());
        }
        claim.status = Some(PersistentVolumeClaimStatus {
            phase: Some("Bound".to_string()),
            capacity: Some(capacity),
            access_modes: spec.access_modes,
            ..Default::default()
        });
        claim.metadata.resource_version = Some(serial.to_string());

        self.volumes.insert(volume_name.clone(), volume);
        self.data.insert(volume_name, files);
        if let Some(record) = self.claims.get_mut(claim_key) {
            record.claim = claim;
        }
    }

    /// Volume behind a bound claim
    fn bound_volume_of(&self, namespace: &str, claim_name: &str) -> Option<String> {
        let record = self.claims.get(&key(namespace, claim_name))?;
        if !self.claim_is(&record.claim, ClaimPhase::Bound) {
            return None;
        }
        claim_volume_name(&record.claim).map(str::to_string)
    }

    fn run_pods(&mut self, faults: &Faults) {
        let startable: Vec<(Key, Vec<String>)> = self
            .pods
            .iter()
            .filter(|(_, r)| r.scheduled && !r.started)
            .filter_map(|(pod_key, r)| {
                let volumes: Option<Vec<String>> = pod_claims(&r.pod)
                    .iter()
                    .map(|claim| self.bound_volume_of(&pod_key.0, claim))
                    .collect();
                volumes.map(|v| (pod_key.clone(), v))
            })
            .collect();

        for (pod_key, volumes) in startable {
            let Some(script) = self.pods.get(&pod_key).map(|r| pod_script(&r.pod)) else { continue };
            let serial = self.next_serial();

            let execution = match parse_script(&script) {
                Program::Hold => None,
                Program::Unknown => Some(Execution {
                    exit_code: 127,
                    logs: format!("sh: unsupported command: {}\n", script),
                }),
                Program::Steps(steps) => {
                    let mount_options = match volumes.first().and_then(|v| self.volumes.get(v)) {
                        Some(_) if Faults::on(&faults.drop_mount_options) => Vec::new(),
                        Some(volume) => volume
                            .spec
                            .as_ref()
                            .and_then(|s| s.mount_options.clone())
                            .unwrap_or_default(),
                        None => Vec::new(),
                    };
                    let mut scratch = Files::new();
                    let files = match volumes.first() {
                        Some(volume) => self.data.entry(volume.clone()).or_default(),
                        None => &mut scratch,
                    };
                    Some(execute(&steps, files, &mount_options, Faults::on(&faults.discard_writes)))
                }
            };

            let Some(record) = self.pods.get_mut(&pod_key) else { continue };
            record.started = true;
            let status = record.pod.status.get_or_insert_with(PodStatus::default);
            match execution {
                None => {
                    status.phase = Some("Running".to_string());
                    status.pod_ip = Some(format!("10.0.{}.{}", (serial >> 8) & 0xff, serial & 0xff));
                }
                Some(execution) => {
                    let succeeded = execution.exit_code == 0;
                    status.phase = Some(if succeeded { "Succeeded" } else { "Failed" }.to_string());
                    status.container_statuses = Some(vec![ContainerStatus {
                        name: CONTAINER_NAME.to_string(),
                        state: Some(ContainerState {
                            terminated: Some(ContainerStateTerminated {
                                exit_code: execution.exit_code,
                                reason: Some(if succeeded { "Completed" } else { "Error" }.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]);
                    record.logs = execution.logs;
                }
            }
        }
    }
}

// =============================================================================
// Simulated Cluster
// =============================================================================

struct Inner {
    state: RwLock<State>,
    faults: Faults,
}

/// In-memory cluster; clones share state
#[derive(Clone)]
pub struct SimulatedCluster {
    inner: Arc<Inner>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    /// Empty cluster without nodes or classes
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: RwLock::new(State::default()),
                faults: Faults::default(),
            }),
        }
    }

    /// Add Ready nodes labeled with their hostname
    pub fn with_nodes<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        {
            let mut state = self.inner.state.write();
            for name in names {
                let name = name.into();
                state.nodes.insert(name.clone(), ready_node(&name));
            }
        }
        self
    }

    /// Add labels to a node, creating a Ready node first if needed
    pub fn with_node_labels(self, name: &str, labels: BTreeMap<String, String>) -> Self {
        {
            let mut state = self.inner.state.write();
            let node = state
                .nodes
                .entry(name.to_string())
                .or_insert_with(|| ready_node(name));
            node.labels_mut().extend(labels);
        }
        self
    }

    /// Add a class marked as the cluster default
    pub fn with_default_class(self, name: &str, provisioner: &str) -> Self {
        let class = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(BTreeMap::from([(
                    DEFAULT_CLASS_ANNOTATION.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            provisioner: provisioner.to_string(),
            ..Default::default()
        };
        self.inner.state.write().classes.insert(name.to_string(), class);
        self
    }

    /// Provision claims no sooner than `delay` after creation
    pub fn with_provisioning_delay(self, delay: Duration) -> Self {
        self.inner.state.write().provisioning_delay = delay;
        self
    }

    pub fn faults(&self) -> &Faults {
        &self.inner.faults
    }

    pub fn handle(&self) -> ControlPlaneRef {
        Arc::new(self.clone())
    }

    pub fn claim_count(&self) -> usize {
        self.inner.state.read().claims.len()
    }

    pub fn pod_count(&self) -> usize {
        self.inner.state.read().pods.len()
    }

    pub fn volume_count(&self) -> usize {
        self.inner.state.read().volumes.len()
    }

    pub fn class_count(&self) -> usize {
        self.inner.state.read().classes.len()
    }

    /// Contents of `file` on `volume`
    pub fn read_file(&self, volume: &str, file: &str) -> Option<String> {
        self.inner.state.read().data.get(volume)?.get(file).cloned()
    }

    /// Nodes that pods named `prefix*` were scheduled onto, oldest first
    pub fn nodes_that_ran(&self, prefix: &str) -> Vec<String> {
        self.inner
            .state
            .read()
            .placements
            .iter()
            .filter(|(pod, _)| pod.starts_with(prefix))
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub fn has_snapshot(&self, namespace: &str, name: &str) -> bool {
        self.inner.state.read().snapshots.contains_key(&key(namespace, name))
    }

    pub fn delete_snapshot(&self, namespace: &str, name: &str) -> Result<()> {
        self.inner
            .state
            .write()
            .snapshots
            .remove(&key(namespace, name))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("VolumeSnapshot", format!("{}/{}", namespace, name)))
    }

    /// Advance the cluster, then act on its state
    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.inner.state.write();
        state.reconcile(&self.inner.faults, Instant::now());
        f(&mut state)
    }
}

#[async_trait]
impl ControlPlane for SimulatedCluster {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        self.with_state(|state| {
            let mut claim = claim.clone();
            let namespace = claim
                .namespace()
                .filter(|ns| !ns.is_empty())
                .ok_or_else(|| Error::Platform("claim needs a namespace".into()))?;
            if let Some(name) = claim.metadata.name.as_deref() {
                if state.claims.contains_key(&key(&namespace, name)) {
                    return Err(Error::exists("PersistentVolumeClaim", format!("{}/{}", namespace, name)));
                }
            }
            let name = state.stamp(&mut claim.metadata, "PersistentVolumeClaim")?;
            claim.status = Some(PersistentVolumeClaimStatus {
                phase: Some(ClaimPhase::Pending.to_string()),
                ..Default::default()
            });
            state.claims.insert(
                key(&namespace, &name),
                ClaimRecord {
                    claim: claim.clone(),
                    created: Instant::now(),
                },
            );
            Ok(claim)
        })
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.with_state(|state| {
            state
                .claims
                .get(&key(namespace, name))
                .map(|r| r.claim.clone())
                .ok_or_else(|| Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name)))
        })
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.with_state(|state| {
            let claim_key = key(namespace, name);
            if !state.claims.contains_key(&claim_key) {
                return Err(Error::not_found("PersistentVolumeClaim", format!("{}/{}", namespace, name)));
            }
            if Faults::on(&self.inner.faults.fail_claim_deletes) {
                return Err(Error::Platform(format!(
                    "deleting claim {}/{} was rejected",
                    namespace, name
                )));
            }

            let Some(record) = state.claims.remove(&claim_key) else { return Ok(()) };
            let Some(volume_name) = claim_volume_name(&record.claim).map(str::to_string) else {
                return Ok(());
            };
            let policy = state
                .volumes
                .get(&volume_name)
                .and_then(|v| ReclaimPolicy::of_volume(v).ok().flatten());
            if policy == Some(ReclaimPolicy::Delete) {
                state.volumes.remove(&volume_name);
                state.data.remove(&volume_name);
            } else if let Some(volume) = state.volumes.get_mut(&volume_name) {
                volume.status.get_or_insert_with(PersistentVolumeStatus::default).phase =
                    Some("Released".to_string());
            }
            Ok(())
        })
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.with_state(|state| {
            state
                .volumes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("PersistentVolume", name))
        })
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state.data.remove(name);
            state
                .volumes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("PersistentVolume", name))
        })
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass> {
        self.with_state(|state| {
            let mut class = class.clone();
            if let Some(name) = class.metadata.name.as_deref() {
                if state.classes.contains_key(name) {
                    return Err(Error::exists("StorageClass", name));
                }
            }
            let name = state.stamp(&mut class.metadata, "StorageClass")?;
            state.classes.insert(name, class.clone());
            Ok(class)
        })
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.with_state(|state| {
            state
                .classes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("StorageClass", name))
        })
    }

    async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.with_state(|state| {
            state
                .classes
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("StorageClass", name))
        })
    }

    async fn default_storage_class_name(&self) -> Result<String> {
        self.with_state(|state| {
            state
                .default_class()?
                .map(|c| c.name_any())
                .ok_or_else(|| Error::not_found("StorageClass", "default"))
        })
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        self.with_state(|state| {
            let mut pod = pod.clone();
            let namespace = pod
                .namespace()
                .filter(|ns| !ns.is_empty())
                .ok_or_else(|| Error::Platform("pod needs a namespace".into()))?;
            if let Some(name) = pod.metadata.name.as_deref() {
                if state.pods.contains_key(&key(&namespace, name)) {
                    return Err(Error::exists("Pod", format!("{}/{}", namespace, name)));
                }
            }
            let name = state.stamp(&mut pod.metadata, "Pod")?;
            pod.status = Some(PodStatus {
                phase: Some("Pending".to_string()),
                ..Default::default()
            });
            state.pods.insert(
                key(&namespace, &name),
                PodRecord {
                    pod: pod.clone(),
                    logs: String::new(),
                    scheduled: false,
                    started: false,
                },
            );
            Ok(pod)
        })
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.with_state(|state| {
            state
                .pods
                .get(&key(namespace, name))
                .map(|r| r.pod.clone())
                .ok_or_else(|| Error::not_found("Pod", format!("{}/{}", namespace, name)))
        })
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.with_state(|state| {
            state
                .pods
                .remove(&key(namespace, name))
                .map(|_| ())
                .ok_or_else(|| Error::not_found("Pod", format!("{}/{}", namespace, name)))
        })
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.with_state(|state| {
            state
                .pods
                .get(&key(namespace, name))
                .map(|r| r.logs.clone())
                .ok_or_else(|| Error::not_found("Pod", format!("{}/{}", namespace, name)))
        })
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.with_state(|state| {
            state
                .nodes
                .get(name)
                .cloned()
                .ok_or_else(|| Error::not_found("Node", name))
        })
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.with_state(|state| Ok(state.nodes.values().cloned().collect()))
    }
}

#[async_trait]
impl SnapshotProvider for SimulatedCluster {
    async fn snapshot_claim(&self, ctx: &ScenarioContext, claim: &PersistentVolumeClaim) -> Result<TakenSnapshot> {
        let namespace = claim.namespace().unwrap_or_else(|| ctx.namespace.clone());
        let claim_name = claim.name_any();

        let name = self.with_state(|state| {
            let volume = state.bound_volume_of(&namespace, &claim_name).ok_or_else(|| {
                Error::mismatch(
                    format!("{}/{}", namespace, claim_name),
                    "snapshot source",
                    "bound claim",
                    "unbound or missing claim",
                )
            })?;
            let files = state.data.get(&volume).cloned().unwrap_or_default();
            let name = format!("snapshot-{:05x}", state.next_serial());
            state.snapshots.insert(key(&namespace, &name), files);
            Ok(name)
        })?;

        let release = Teardown::new();
        let cluster = self.clone();
        let (snapshot_ns, snapshot_name) = (namespace, name.clone());
        release.push(Release::custom(
            format!("snapshot {}/{}", snapshot_ns, snapshot_name),
            move |_| async move { cluster.delete_snapshot(&snapshot_ns, &snapshot_name) },
        ));
        Ok(TakenSnapshot { name, release })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::driver::DriverDescriptor;
    use crate::domain::types::{pod_node_name, PodPhase, VolumeMode};
    use crate::provisioning::claim::claim_template;
    use crate::provisioning::wait;
    use crate::provisioning::workload::ProbeScript;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{Container, PersistentVolumeClaimVolumeSource, Volume};

    const NS: &str = "sim";

    fn class(name: &str, binding_mode: Option<&str>) -> StorageClass {
        StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            volume_binding_mode: binding_mode.map(str::to_string),
            mount_options: Some(vec!["debug".to_string()]),
            ..Default::default()
        }
    }

    fn pod(claim: &str, script: &str, node_selector: Option<BTreeMap<String, String>>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                generate_name: Some("tester-".to_string()),
                namespace: Some(NS.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.to_string(),
                    args: Some(vec![script.to_string()]),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "v".to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: claim.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                }]),
                node_selector,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_probe_scripts() {
        let write = ProbeScript::write("data", "hello world").render(VolumeMode::Filesystem);
        assert_eq!(
            parse_script(&write),
            Program::Steps(vec![Step::Write {
                file: Some("data".into()),
                content: "hello world".into()
            }])
        );

        let verify = ProbeScript::verify("data", "hello world")
            .with_mount_options(vec!["debug".into(), "noatime".into()])
            .render(VolumeMode::Filesystem);
        assert_eq!(
            parse_script(&verify),
            Program::Steps(vec![
                Step::Grep {
                    file: "data".into(),
                    content: "hello world".into()
                },
                Step::MountOption("debug".into()),
                Step::MountOption("noatime".into()),
            ])
        );

        let head = ProbeScript::verify("data", "hello").render(VolumeMode::Block);
        assert_eq!(
            parse_script(&head),
            Program::Steps(vec![Step::DeviceHead {
                len: 6,
                content: "hello".into()
            }])
        );

        assert_eq!(parse_script(&ProbeScript::Hold.render(VolumeMode::Filesystem)), Program::Hold);
        assert_eq!(parse_script("true"), Program::Steps(Vec::new()));
        assert_eq!(parse_script("rm -rf /"), Program::Unknown);
    }

    #[test]
    fn test_device_writes_overlay_from_start() {
        let mut files = Files::new();
        files.insert(DEVICE.to_string(), "xxxxxxxxxxxxxxxx".to_string());
        let write = [Step::Write {
            file: None,
            content: "abc".into(),
        }];
        assert_eq!(execute(&write, &mut files, &[], false).exit_code, 0);
        assert_eq!(files[DEVICE], "abc\nxxxxxxxxxxxx");

        let head = [Step::DeviceHead {
            len: 4,
            content: "abc".into(),
        }];
        assert_eq!(execute(&head, &mut files, &[], false).exit_code, 0);
    }

    #[test]
    fn test_requirement_operators() {
        let req = |operator: &str, values: &[&str]| NodeSelectorRequirement {
            key: "k".into(),
            operator: operator.into(),
            values: Some(values.iter().map(|v| v.to_string()).collect()),
        };
        assert!(requirement_matches(&req("In", &["a"]), Some("a")));
        assert!(!requirement_matches(&req("In", &["a"]), None));
        assert!(requirement_matches(&req("NotIn", &["a"]), None));
        assert!(!requirement_matches(&req("NotIn", &["a"]), Some("a")));
        assert!(requirement_matches(&req("Exists", &[]), Some("x")));
        assert!(requirement_matches(&req("DoesNotExist", &[]), None));
        assert!(requirement_matches(&req("Gt", &["3"]), Some("4")));
        assert!(!requirement_matches(&req("Lt", &["3"]), Some("4")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_immediate_claim_binds_on_next_call() {
        let cluster = SimulatedCluster::new();
        let cp = cluster.handle();
        cp.create_storage_class(&class("fast", None)).await.unwrap();

        let created = cp
            .create_claim(&claim_template(NS, "1Gi", Some("fast"), VolumeMode::Filesystem))
            .await
            .unwrap();
        assert_eq!(ClaimPhase::of(&created).unwrap(), ClaimPhase::Pending);
        assert!(created.metadata.resource_version.is_some());

        let claim = cp.get_claim(NS, &created.name_any()).await.unwrap();
        assert_eq!(ClaimPhase::of(&claim).unwrap(), ClaimPhase::Bound);

        let volume = cp.get_volume(claim_volume_name(&claim).unwrap()).await.unwrap();
        let spec = volume.spec.unwrap();
        assert_eq!(spec.mount_options, Some(vec!["debug".to_string()]));
        assert_eq!(spec.persistent_volume_reclaim_policy.as_deref(), Some("Delete"));
        assert_eq!(spec.claim_ref.unwrap().name.as_deref(), Some(created.name_any().as_str()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_without_class_stays_pending() {
        let cluster = SimulatedCluster::new();
        let cp = cluster.handle();

        let created = cp
            .create_claim(&claim_template(NS, "1Gi", None, VolumeMode::Filesystem))
            .await
            .unwrap();
        let claim = cp.get_claim(NS, &created.name_any()).await.unwrap();
        assert_eq!(ClaimPhase::of(&claim).unwrap(), ClaimPhase::Pending);
        assert_eq!(cluster.volume_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provisioning_delay() {
        let cluster = SimulatedCluster::new().with_provisioning_delay(Duration::from_secs(30));
        let cp = cluster.handle();
        cp.create_storage_class(&class("slow", None)).await.unwrap();
        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", Some("slow"), VolumeMode::Filesystem))
            .await
            .unwrap();

        let poll = Duration::from_secs(2);
        assert_matches!(
            wait::wait_for_claim_phase(cp.as_ref(), NS, &claim.name_any(), ClaimPhase::Bound, poll, Duration::from_secs(10))
                .await,
            Err(Error::Timeout { .. })
        );

        let start = Instant::now();
        wait::wait_for_claim_phase(cp.as_ref(), NS, &claim.name_any(), ClaimPhase::Bound, poll, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(18));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_binding_waits_for_consumer() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        let cp = cluster.handle();
        cp.create_storage_class(&class("late", Some("WaitForFirstConsumer"))).await.unwrap();
        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", Some("late"), VolumeMode::Filesystem))
            .await
            .unwrap();

        let still = cp.get_claim(NS, &claim.name_any()).await.unwrap();
        assert_eq!(ClaimPhase::of(&still).unwrap(), ClaimPhase::Pending);

        let selector = BTreeMap::from([(HOSTNAME_LABEL.to_string(), "node-b".to_string())]);
        let consumer = cp.create_pod(&pod(&claim.name_any(), "true", Some(selector))).await.unwrap();
        let finished = cp.get_pod(NS, &consumer.name_any()).await.unwrap();
        assert_eq!(PodPhase::of(&finished), PodPhase::Succeeded);
        assert_eq!(pod_node_name(&finished), Some("node-b"));

        let bound = cp.get_claim(NS, &claim.name_any()).await.unwrap();
        assert_eq!(ClaimPhase::of(&bound).unwrap(), ClaimPhase::Bound);
        assert_eq!(
            bound.annotations().get(SELECTED_NODE_ANNOTATION).map(String::as_str),
            Some("node-b")
        );
        assert_eq!(cluster.nodes_that_ran("tester-"), vec!["node-b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_selector_is_unschedulable() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let cp = cluster.handle();
        cp.create_storage_class(&class("fast", None)).await.unwrap();
        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", Some("fast"), VolumeMode::Filesystem))
            .await
            .unwrap();

        let selector = BTreeMap::from([("missing".to_string(), "label".to_string())]);
        let created = cp.create_pod(&pod(&claim.name_any(), "true", Some(selector))).await.unwrap();
        let observed = cp.get_pod(NS, &created.name_any()).await.unwrap();
        assert!(wait::is_unschedulable(&observed));
        assert!(cluster.nodes_that_ran("tester-").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_script_reports_exit_code_and_logs() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let cp = cluster.handle();
        cp.create_storage_class(&class("fast", None)).await.unwrap();
        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", Some("fast"), VolumeMode::Filesystem))
            .await
            .unwrap();

        let script = ProbeScript::verify("missing", "x").render(VolumeMode::Filesystem);
        let created = cp.create_pod(&pod(&claim.name_any(), &script, None)).await.unwrap();
        let observed = cp.get_pod(NS, &created.name_any()).await.unwrap();
        assert_eq!(PodPhase::of(&observed), PodPhase::Failed);
        let exit = observed.status.unwrap().container_statuses.unwrap()[0]
            .state
            .clone()
            .unwrap()
            .terminated
            .unwrap()
            .exit_code;
        assert_eq!(exit, 2);
        assert!(cp
            .pod_logs(NS, &created.name_any())
            .await
            .unwrap()
            .contains("No such file"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_pod_runs_with_ip() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let cp = cluster.handle();
        cp.create_storage_class(&class("fast", None)).await.unwrap();
        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", Some("fast"), VolumeMode::Filesystem))
            .await
            .unwrap();

        let hold = ProbeScript::Hold.render(VolumeMode::Filesystem);
        let created = cp.create_pod(&pod(&claim.name_any(), &hold, None)).await.unwrap();
        let observed = cp.get_pod(NS, &created.name_any()).await.unwrap();
        assert_eq!(PodPhase::of(&observed), PodPhase::Running);
        assert!(observed.status.unwrap().pod_ip.unwrap().starts_with("10.0."));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_on_claim_delete() {
        let cluster = SimulatedCluster::new();
        let cp = cluster.handle();
        let mut retain = class("keep", None);
        retain.reclaim_policy = Some("Retain".into());
        cp.create_storage_class(&retain).await.unwrap();
        cp.create_storage_class(&class("drop", None)).await.unwrap();

        let kept = cp
            .create_claim(&claim_template(NS, "1Gi", Some("keep"), VolumeMode::Filesystem))
            .await
            .unwrap();
        let dropped = cp
            .create_claim(&claim_template(NS, "1Gi", Some("drop"), VolumeMode::Filesystem))
            .await
            .unwrap();
        let kept = cp.get_claim(NS, &kept.name_any()).await.unwrap();
        let dropped = cp.get_claim(NS, &dropped.name_any()).await.unwrap();

        cp.delete_claim(NS, &kept.name_any()).await.unwrap();
        cp.delete_claim(NS, &dropped.name_any()).await.unwrap();

        let released = cp.get_volume(claim_volume_name(&kept).unwrap()).await.unwrap();
        assert_eq!(released.status.unwrap().phase.as_deref(), Some("Released"));
        assert!(cp
            .get_volume(claim_volume_name(&dropped).unwrap())
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_class_and_collisions() {
        let cluster = SimulatedCluster::new().with_default_class("standard", "csi.example.com");
        let cp = cluster.handle();
        assert_eq!(cp.default_storage_class_name().await.unwrap(), "standard");
        assert!(cp
            .create_storage_class(&class("standard", None))
            .await
            .unwrap_err()
            .is_already_exists());

        let claim = cp
            .create_claim(&claim_template(NS, "1Gi", None, VolumeMode::Block))
            .await
            .unwrap();
        let bound = cp.get_claim(NS, &claim.name_any()).await.unwrap();
        let volume = cp.get_volume(claim_volume_name(&bound).unwrap()).await.unwrap();
        assert_eq!(volume.spec.unwrap().volume_mode.as_deref(), Some("Block"));
    }

    #[test]
    fn test_snapshot_needs_bound_claim_and_is_released() {
        tokio_test::block_on(async {
            let cluster = SimulatedCluster::new();
            let cp = cluster.handle();
            let ctx = ScenarioContext::new(
                cp.clone(),
                NS,
                &RunnerConfig::new(DriverDescriptor::new("csi.example.com")),
            );

            let unbound = cp
                .create_claim(&claim_template(NS, "1Gi", Some("missing"), VolumeMode::Filesystem))
                .await
                .unwrap();
            assert_matches!(
                cluster.snapshot_claim(&ctx, &unbound).await,
                Err(Error::InvariantViolation { .. })
            );

            cp.create_storage_class(&class("fast", None)).await.unwrap();
            let claim = cp
                .create_claim(&claim_template(NS, "1Gi", Some("fast"), VolumeMode::Filesystem))
                .await
                .unwrap();
            let bound = cp.get_claim(NS, &claim.name_any()).await.unwrap();

            let snapshot = cluster.snapshot_claim(&ctx, &bound).await.unwrap();
            assert!(cluster.has_snapshot(NS, &snapshot.name));
            snapshot.release.run(&ctx).await.unwrap();
            assert!(!cluster.has_snapshot(NS, &snapshot.name));
        });
    }
}
