//! Driver descriptor
//!
//! Describes what a storage driver under test can do. Every optional code
//! path (snapshots, cloning, block volumes, mount options) checks the
//! capability set explicitly before it runs.

use crate::capacity::SizeRange;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// =============================================================================
// Capabilities
// =============================================================================

/// Named driver capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    /// Data survives pod restarts
    Persistence,
    /// Raw block volumes
    Block,
    /// Claims populated from a volume snapshot
    SnapshotDataSource,
    /// Claims cloned from another claim
    PvcDataSource,
    /// Volume can be attached on another node after detaching
    MultiNode,
    /// Driver reports accessible topology
    Topology,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Persistence => write!(f, "persistence"),
            Capability::Block => write!(f, "block"),
            Capability::SnapshotDataSource => write!(f, "snapshotDataSource"),
            Capability::PvcDataSource => write!(f, "pvcDataSource"),
            Capability::MultiNode => write!(f, "multiNode"),
            Capability::Topology => write!(f, "topology"),
        }
    }
}

/// Set of capabilities a driver declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new(caps: impl IntoIterator<Item = Capability>) -> Self {
        Self(caps.into_iter().collect())
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.0.contains(&cap)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0.insert(cap);
    }
}

// =============================================================================
// Platform Traits
// =============================================================================

/// Properties of the cluster's node platform that change how probes run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformTraits {
    /// Nodes expose a mount table that probes can inspect
    #[serde(default = "default_true")]
    pub mount_table: bool,
}

impl Default for PlatformTraits {
    fn default() -> Self {
        Self { mount_table: true }
    }
}

fn default_true() -> bool {
    true
}

// =============================================================================
// Driver Descriptor
// =============================================================================

/// A storage driver under test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverDescriptor {
    /// Driver name, also the storage class provisioner
    pub name: String,
    /// In-tree plugin this driver replaces through CSI migration
    #[serde(default)]
    pub in_tree_plugin_name: Option<String>,
    /// Whether the in-tree plugin is migrated to this driver
    #[serde(default)]
    pub migrated: bool,
    /// Declared capabilities
    #[serde(default)]
    pub capabilities: CapabilitySet,
    /// Volume sizes the driver accepts
    #[serde(default)]
    pub supported_size_range: SizeRange,
    /// Mount options the driver accepts
    #[serde(default)]
    pub supported_mount_options: BTreeSet<String>,
    /// Mount options the driver always needs
    #[serde(default)]
    pub required_mount_options: BTreeSet<String>,
    /// Filesystem types; the empty string is the driver default
    #[serde(default = "default_fs_types")]
    pub supported_fs_types: BTreeSet<String>,
    /// Node label keys that bound where a volume is reachable
    #[serde(default)]
    pub topology_keys: Vec<String>,
    /// Extra storage class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Binding mode of the dynamic class
    #[serde(default)]
    pub binding_mode: Option<String>,
    /// Reclaim policy of the dynamic class
    #[serde(default)]
    pub reclaim_policy: Option<String>,
}

fn default_fs_types() -> BTreeSet<String> {
    BTreeSet::from([String::new()])
}

impl DriverDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            in_tree_plugin_name: None,
            migrated: false,
            capabilities: CapabilitySet::default(),
            supported_size_range: SizeRange::default(),
            supported_mount_options: BTreeSet::new(),
            required_mount_options: BTreeSet::new(),
            supported_fs_types: default_fs_types(),
            topology_keys: Vec::new(),
            parameters: BTreeMap::new(),
            binding_mode: None,
            reclaim_policy: None,
        }
    }

    pub fn has(&self, cap: Capability) -> bool {
        self.capabilities.has(cap)
    }

    pub fn supports_fs_type(&self, fs_type: &str) -> bool {
        self.supported_fs_types.contains(fs_type)
    }

    /// Mount options for the mount-options scenario, `None` if the driver
    /// declares no supported options
    pub fn mount_options(&self) -> Option<Vec<String>> {
        if self.supported_mount_options.is_empty() {
            return None;
        }
        Some(
            self.supported_mount_options
                .union(&self.required_mount_options)
                .cloned()
                .collect(),
        )
    }

    /// Dynamic-provision storage class for a test namespace
    pub fn dynamic_class(&self, namespace: &str, fs_type: &str) -> StorageClass {
        let mut parameters = self.parameters.clone();
        if !fs_type.is_empty() {
            parameters.insert("csi.storage.k8s.io/fstype".to_string(), fs_type.to_string());
        }

        StorageClass {
            metadata: ObjectMeta {
                name: Some(format!("{}-{}-sc", namespace, self.name.replace('.', "-"))),
                ..Default::default()
            },
            provisioner: self.name.clone(),
            parameters: if parameters.is_empty() { None } else { Some(parameters) },
            reclaim_policy: self.reclaim_policy.clone(),
            volume_binding_mode: self.binding_mode.clone(),
            ..Default::default()
        }
    }
}
