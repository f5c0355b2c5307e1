//! Domain Ports - Core trait definitions for the conformance engine
//!
//! These traits define the boundaries between the provisioning workflows and
//! the systems they drive. Adapters implement them against a live cluster or
//! an in-memory simulation.

use crate::error::Result;
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::Teardown;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Node, PersistentVolume, PersistentVolumeClaim, Pod, TypedLocalObjectReference,
};
use k8s_openapi::api::storage::v1::StorageClass;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Control Plane Port
// =============================================================================

/// Object management API of the orchestration platform.
///
/// Missing objects surface as `Error::ResourceNotFound`, name collisions as
/// `Error::ResourceExists`. Deletes are requests: the object may linger until
/// finalizers and controllers are done with it.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    // Claims
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim>;
    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim>;
    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()>;

    // Volumes
    async fn get_volume(&self, name: &str) -> Result<PersistentVolume>;
    async fn delete_volume(&self, name: &str) -> Result<()>;

    // Storage classes
    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass>;
    async fn get_storage_class(&self, name: &str) -> Result<StorageClass>;
    async fn delete_storage_class(&self, name: &str) -> Result<()>;

    /// Name of the class marked as the cluster default
    async fn default_storage_class_name(&self) -> Result<String>;

    // Pods
    async fn create_pod(&self, pod: &Pod) -> Result<Pod>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()>;
    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String>;

    // Nodes
    async fn get_node(&self, name: &str) -> Result<Node>;
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

// =============================================================================
// Data Source Port
// =============================================================================

/// A population source ready to be referenced from a new claim
#[derive(Debug)]
pub struct PreparedDataSource {
    /// Reference to put into the claim's `dataSource`
    pub reference: TypedLocalObjectReference,
    /// Releases everything created while preparing the source
    pub release: Teardown,
}

/// Produces a data source that new claims can be populated from
#[async_trait]
pub trait DataSourcePreparer: Send + Sync {
    /// Create and populate the source with `content`
    async fn prepare(&self, ctx: &ScenarioContext, content: &str) -> Result<PreparedDataSource>;

    /// Short name for logging
    fn kind(&self) -> &str;
}

/// A snapshot taken from a populated claim
#[derive(Debug)]
pub struct TakenSnapshot {
    /// Snapshot object name in the claim's namespace
    pub name: String,
    /// Deletes the snapshot
    pub release: Teardown,
}

/// Driver-specific snapshot support
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Snapshot `claim` and wait until the snapshot is ready to use
    async fn snapshot_claim(&self, ctx: &ScenarioContext, claim: &PersistentVolumeClaim) -> Result<TakenSnapshot>;
}

// =============================================================================
// Operation Counter Port
// =============================================================================

/// Provisioning operation counts attributed to each code path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    /// Operations handled by the legacy in-tree plugin
    pub legacy: u64,
    /// Operations handled through the migrated driver
    pub migrated: u64,
}

/// Source of operation counter snapshots, usually controller metrics
#[async_trait]
pub trait OpCountSource: Send + Sync {
    async fn snapshot(&self, plugin: &str) -> Result<OpCounts>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ControlPlaneRef = Arc<dyn ControlPlane>;
pub type DataSourcePreparerRef = Arc<dyn DataSourcePreparer>;
pub type OpCountSourceRef = Arc<dyn OpCountSource>;
pub type SnapshotProviderRef = Arc<dyn SnapshotProvider>;
