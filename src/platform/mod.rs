//! Platform adapters
//!
//! Implementations of the domain ports:
//!
//! - [`cluster`]: a live cluster reached through `kube::Client`
//! - [`simulated`]: an in-memory cluster for dry runs and tests

pub mod cluster;
pub mod simulated;

pub use cluster::{KubeControlPlane, KubeSnapshotProvider};
pub use simulated::SimulatedCluster;

use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;

/// Annotation marking the cluster default storage class
pub const DEFAULT_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Pre-GA spelling of [`DEFAULT_CLASS_ANNOTATION`], still honoured by the API server
pub const BETA_DEFAULT_CLASS_ANNOTATION: &str = "storageclass.beta.kubernetes.io/is-default-class";

/// Whether `class` is annotated as the cluster default
pub fn is_default_class(class: &StorageClass) -> bool {
    let annotations = class.annotations();
    [DEFAULT_CLASS_ANNOTATION, BETA_DEFAULT_CLASS_ANNOTATION]
        .iter()
        .any(|key| annotations.get(*key).map(String::as_str) == Some("true"))
}
