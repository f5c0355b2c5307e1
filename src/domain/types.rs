//! Domain value types
//!
//! Typed views over the string-valued fields of the Kubernetes storage API,
//! plus the node selection model shared by every workload the engine runs.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm,
    PersistentVolume, PersistentVolumeClaim, Pod, PodSpec,
};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Resource key for storage capacity
pub const STORAGE_RESOURCE: &str = "storage";

// =============================================================================
// Claim Phase
// =============================================================================

/// Phase of a persistent volume claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClaimPhase {
    Pending,
    Bound,
    Lost,
}

impl ClaimPhase {
    /// Phase reported by a claim; a claim without status is still Pending
    pub fn of(claim: &PersistentVolumeClaim) -> Result<Self> {
        match claim.status.as_ref().and_then(|s| s.phase.as_deref()) {
            None => Ok(ClaimPhase::Pending),
            Some(phase) => phase.parse(),
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimPhase::Pending => write!(f, "Pending"),
            ClaimPhase::Bound => write!(f, "Bound"),
            ClaimPhase::Lost => write!(f, "Lost"),
        }
    }
}

impl FromStr for ClaimPhase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Pending" => Ok(ClaimPhase::Pending),
            "Bound" => Ok(ClaimPhase::Bound),
            "Lost" => Ok(ClaimPhase::Lost),
            other => Err(Error::Platform(format!("unknown claim phase {:?}", other))),
        }
    }
}

// =============================================================================
// Reclaim Policy
// =============================================================================

/// Disposition of a volume after its claim is deleted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReclaimPolicy {
    Retain,
    Delete,
    Recycle,
}

impl ReclaimPolicy {
    /// Policy of a storage class; the API default is Delete
    pub fn of_class(class: &StorageClass) -> Result<Self> {
        match class.reclaim_policy.as_deref() {
            None => Ok(ReclaimPolicy::Delete),
            Some(policy) => policy.parse(),
        }
    }

    /// Policy recorded on a volume, if any
    pub fn of_volume(volume: &PersistentVolume) -> Result<Option<Self>> {
        volume
            .spec
            .as_ref()
            .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
            .map(str::parse)
            .transpose()
    }
}

impl std::fmt::Display for ReclaimPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReclaimPolicy::Retain => write!(f, "Retain"),
            ReclaimPolicy::Delete => write!(f, "Delete"),
            ReclaimPolicy::Recycle => write!(f, "Recycle"),
        }
    }
}

impl FromStr for ReclaimPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Retain" => Ok(ReclaimPolicy::Retain),
            "Delete" => Ok(ReclaimPolicy::Delete),
            "Recycle" => Ok(ReclaimPolicy::Recycle),
            other => Err(Error::Platform(format!("unknown reclaim policy {:?}", other))),
        }
    }
}

// =============================================================================
// Volume Mode
// =============================================================================

/// How a volume is presented to a workload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeMode {
    #[default]
    Filesystem,
    Block,
}

impl std::fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VolumeMode::Filesystem => write!(f, "Filesystem"),
            VolumeMode::Block => write!(f, "Block"),
        }
    }
}

impl FromStr for VolumeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Filesystem" => Ok(VolumeMode::Filesystem),
            "Block" => Ok(VolumeMode::Block),
            other => Err(Error::Platform(format!("unknown volume mode {:?}", other))),
        }
    }
}

// =============================================================================
// Binding Mode
// =============================================================================

/// When a storage class binds and provisions claims
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BindingMode {
    #[default]
    Immediate,
    WaitForFirstConsumer,
}

impl BindingMode {
    /// Binding mode of a storage class; the API default is Immediate
    pub fn of_class(class: &StorageClass) -> Result<Self> {
        match class.volume_binding_mode.as_deref() {
            None => Ok(BindingMode::Immediate),
            Some(mode) => mode.parse(),
        }
    }
}

impl std::fmt::Display for BindingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingMode::Immediate => write!(f, "Immediate"),
            BindingMode::WaitForFirstConsumer => write!(f, "WaitForFirstConsumer"),
        }
    }
}

impl FromStr for BindingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Immediate" => Ok(BindingMode::Immediate),
            "WaitForFirstConsumer" => Ok(BindingMode::WaitForFirstConsumer),
            other => Err(Error::Platform(format!("unknown binding mode {:?}", other))),
        }
    }
}

// =============================================================================
// Access Mode
// =============================================================================

/// Volume access modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadOnlyMany,
    ReadWriteMany,
    ReadWriteOncePod,
}

impl std::fmt::Display for AccessMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AccessMode::ReadWriteOnce => write!(f, "ReadWriteOnce"),
            AccessMode::ReadOnlyMany => write!(f, "ReadOnlyMany"),
            AccessMode::ReadWriteMany => write!(f, "ReadWriteMany"),
            AccessMode::ReadWriteOncePod => write!(f, "ReadWriteOncePod"),
        }
    }
}

impl FromStr for AccessMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ReadWriteOnce" => Ok(AccessMode::ReadWriteOnce),
            "ReadOnlyMany" => Ok(AccessMode::ReadOnlyMany),
            "ReadWriteMany" => Ok(AccessMode::ReadWriteMany),
            "ReadWriteOncePod" => Ok(AccessMode::ReadWriteOncePod),
            other => Err(Error::Platform(format!("unknown access mode {:?}", other))),
        }
    }
}

// =============================================================================
// Pod Phase
// =============================================================================

/// Phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn of(pod: &Pod) -> Self {
        match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            Some("Unknown") => PodPhase::Unknown,
            _ => PodPhase::Pending,
        }
    }
}

impl std::fmt::Display for PodPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PodPhase::Pending => write!(f, "Pending"),
            PodPhase::Running => write!(f, "Running"),
            PodPhase::Succeeded => write!(f, "Succeeded"),
            PodPhase::Failed => write!(f, "Failed"),
            PodPhase::Unknown => write!(f, "Unknown"),
        }
    }
}

// =============================================================================
// Node Selection
// =============================================================================

/// Placement constraints for a workload pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSelection {
    /// Pin to this exact node
    #[serde(default)]
    pub name: Option<String>,
    /// Node labels that must match
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    /// Required node affinity
    #[serde(default, skip)]
    pub affinity: Option<Affinity>,
}

impl NodeSelection {
    /// Selection that pins a single node
    pub fn pinned(node: impl Into<String>) -> Self {
        Self {
            name: Some(node.into()),
            ..Default::default()
        }
    }

    /// Selection matching node labels
    pub fn with_selector(selector: BTreeMap<String, String>) -> Self {
        Self {
            selector,
            ..Default::default()
        }
    }

    /// Forbid scheduling onto `node`.
    ///
    /// Adds a `metadata.name NotIn [node]` field requirement to every
    /// required node selector term, creating one when none exists.
    pub fn set_anti_affinity(&mut self, node: &str) {
        let requirement = NodeSelectorRequirement {
            key: "metadata.name".to_string(),
            operator: "NotIn".to_string(),
            values: Some(vec![node.to_string()]),
        };
        for term in self.required_terms() {
            term.match_fields
                .get_or_insert_with(Vec::new)
                .push(requirement.clone());
        }
    }

    /// Require nodes carrying every label of `segment`
    pub fn set_topology_requirement(&mut self, segment: &BTreeMap<String, String>) {
        for (key, value) in segment {
            let requirement = NodeSelectorRequirement {
                key: key.clone(),
                operator: "In".to_string(),
                values: Some(vec![value.clone()]),
            };
            for term in self.required_terms() {
                term.match_expressions
                    .get_or_insert_with(Vec::new)
                    .push(requirement.clone());
            }
        }
    }

    fn required_terms(&mut self) -> &mut Vec<NodeSelectorTerm> {
        let affinity = self.affinity.get_or_insert_with(Affinity::default);
        let node_affinity = affinity.node_affinity.get_or_insert_with(NodeAffinity::default);
        let required = node_affinity
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(|| NodeSelector {
                node_selector_terms: Vec::new(),
            });

        if required.node_selector_terms.is_empty() {
            required.node_selector_terms.push(NodeSelectorTerm::default());
        }
        &mut required.node_selector_terms
    }

    /// Apply the selection to a pod spec
    pub fn apply(&self, spec: &mut PodSpec) {
        if let Some(name) = &self.name {
            spec.node_name = Some(name.clone());
        }
        if !self.selector.is_empty() {
            spec.node_selector = Some(self.selector.clone());
        }
        if let Some(affinity) = &self.affinity {
            spec.affinity = Some(affinity.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.selector.is_empty() && self.affinity.is_none()
    }
}

// =============================================================================
// Identity helpers
// =============================================================================

/// `namespace/name` identity of a namespaced object
pub fn qualified_name<K: ResourceExt>(obj: &K) -> String {
    format!(
        "{}/{}",
        obj.namespace().unwrap_or_default(),
        obj.name_any()
    )
}

/// Storage class referenced by a claim
pub fn claim_class_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim.spec.as_ref().and_then(|s| s.storage_class_name.as_deref())
}

/// Volume a claim is bound to
pub fn claim_volume_name(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.as_deref())
        .filter(|n| !n.is_empty())
}

/// Node a pod was scheduled onto
pub fn pod_node_name(pod: &Pod) -> Option<&str> {
    pod.spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .filter(|n| !n.is_empty())
}
