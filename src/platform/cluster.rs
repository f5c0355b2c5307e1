//! Live cluster adapter
//!
//! [`KubeControlPlane`] implements the control plane port on top of a
//! `kube::Client`. API status codes are folded into the domain errors so
//! workflows never look at HTTP details.

use super::is_default_class;
use crate::domain::ports::{ControlPlane, SnapshotProvider, TakenSnapshot};
use crate::error::{Error, Result};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::{Release, Teardown};
use crate::provisioning::wait;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PersistentVolume, PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, LogParams, PostParams,
};
use kube::{Client, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

/// Map an API failure onto the domain errors
pub(crate) fn api_error(err: kube::Error, kind: &str, name: impl Into<String>) -> Error {
    let code = match &err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    };
    match code {
        Some(404) => Error::not_found(kind, name),
        Some(409) => Error::exists(kind, name),
        _ => Error::Kube(err),
    }
}

fn qualified(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Display name of an object about to be created
fn pending_name<K: ResourceExt>(obj: &K) -> String {
    obj.meta()
        .name
        .clone()
        .or_else(|| obj.meta().generate_name.clone().map(|prefix| format!("{}*", prefix)))
        .unwrap_or_default()
}

// =============================================================================
// Control Plane
// =============================================================================

/// Control plane backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeControlPlane {
    client: Client,
}

impl KubeControlPlane {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect with the in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn claims(&self, namespace: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    fn classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

#[async_trait]
impl ControlPlane for KubeControlPlane {
    async fn create_claim(&self, claim: &PersistentVolumeClaim) -> Result<PersistentVolumeClaim> {
        let namespace = claim.namespace().unwrap_or_default();
        self.claims(&namespace)
            .create(&PostParams::default(), claim)
            .await
            .map_err(|e| api_error(e, "PersistentVolumeClaim", qualified(&namespace, &pending_name(claim))))
    }

    async fn get_claim(&self, namespace: &str, name: &str) -> Result<PersistentVolumeClaim> {
        self.claims(namespace)
            .get(name)
            .await
            .map_err(|e| api_error(e, "PersistentVolumeClaim", qualified(namespace, name)))
    }

    async fn delete_claim(&self, namespace: &str, name: &str) -> Result<()> {
        self.claims(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, "PersistentVolumeClaim", qualified(namespace, name)))
    }

    async fn get_volume(&self, name: &str) -> Result<PersistentVolume> {
        self.volumes()
            .get(name)
            .await
            .map_err(|e| api_error(e, "PersistentVolume", name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.volumes()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, "PersistentVolume", name))
    }

    async fn create_storage_class(&self, class: &StorageClass) -> Result<StorageClass> {
        self.classes()
            .create(&PostParams::default(), class)
            .await
            .map_err(|e| api_error(e, "StorageClass", pending_name(class)))
    }

    async fn get_storage_class(&self, name: &str) -> Result<StorageClass> {
        self.classes()
            .get(name)
            .await
            .map_err(|e| api_error(e, "StorageClass", name))
    }

    async fn delete_storage_class(&self, name: &str) -> Result<()> {
        self.classes()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, "StorageClass", name))
    }

    async fn default_storage_class_name(&self) -> Result<String> {
        let classes = self.classes().list(&ListParams::default()).await?;
        let defaults: Vec<String> = classes
            .items
            .iter()
            .filter(|c| is_default_class(c))
            .map(|c| c.name_any())
            .collect();
        match defaults.as_slice() {
            [] => Err(Error::not_found("StorageClass", "default")),
            [name] => Ok(name.clone()),
            names => Err(Error::Configuration(format!(
                "more than one default storage class: {}",
                names.join(", ")
            ))),
        }
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        let namespace = pod.namespace().unwrap_or_default();
        self.pods(&namespace)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| api_error(e, "Pod", qualified(&namespace, &pending_name(pod))))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(|e| api_error(e, "Pod", qualified(namespace, name)))
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<()> {
        self.pods(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map(|_| ())
            .map_err(|e| api_error(e, "Pod", qualified(namespace, name)))
    }

    async fn pod_logs(&self, namespace: &str, name: &str) -> Result<String> {
        self.pods(namespace)
            .logs(name, &LogParams::default())
            .await
            .map_err(|e| api_error(e, "Pod", qualified(namespace, name)))
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes()
            .get(name)
            .await
            .map_err(|e| api_error(e, "Node", name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self.nodes().list(&ListParams::default()).await?;
        Ok(list.items)
    }
}

// =============================================================================
// Volume Snapshots
// =============================================================================

fn snapshot_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("snapshot.storage.k8s.io", "v1", "VolumeSnapshot"))
}

/// VolumeSnapshot of `claim_name`, named by the API server
fn snapshot_object(namespace: &str, claim_name: &str, snapshot_class: Option<&str>) -> DynamicObject {
    let mut spec = json!({
        "source": { "persistentVolumeClaimName": claim_name },
    });
    if let Some(class) = snapshot_class {
        spec["volumeSnapshotClassName"] = json!(class);
    }

    let mut snapshot = DynamicObject::new("", &snapshot_resource())
        .within(namespace)
        .data(json!({ "spec": spec }));
    snapshot.metadata.name = None;
    snapshot.metadata.generate_name = Some("snapshot-".to_string());
    snapshot
}

fn ready_to_use(snapshot: &DynamicObject) -> bool {
    snapshot
        .data
        .pointer("/status/readyToUse")
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// CSI snapshots through `snapshot.storage.k8s.io/v1`
#[derive(Clone)]
pub struct KubeSnapshotProvider {
    client: Client,
    snapshot_class: Option<String>,
}

impl KubeSnapshotProvider {
    /// Snapshots are taken with `snapshot_class`, or the cluster default when unset
    pub fn new(client: Client, snapshot_class: Option<String>) -> Self {
        Self { client, snapshot_class }
    }

    fn snapshots(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &snapshot_resource())
    }
}

#[async_trait]
impl SnapshotProvider for KubeSnapshotProvider {
    async fn snapshot_claim(&self, ctx: &ScenarioContext, claim: &PersistentVolumeClaim) -> Result<TakenSnapshot> {
        let namespace = claim.namespace().unwrap_or_else(|| ctx.namespace.clone());
        let api = self.snapshots(&namespace);

        let object = snapshot_object(&namespace, &claim.name_any(), self.snapshot_class.as_deref());
        let created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| api_error(e, "VolumeSnapshot", qualified(&namespace, "snapshot-*")))?;
        let name = created.name_any();
        info!("created snapshot {}/{} of claim {}", namespace, name, claim.name_any());

        let release = Teardown::new();
        let (delete_api, delete_ns, delete_name) = (api.clone(), namespace.clone(), name.clone());
        release.push(Release::custom(
            format!("snapshot {}/{}", namespace, name),
            move |_| async move {
                match delete_api.delete(&delete_name, &DeleteParams::default()).await {
                    Ok(_) => Ok(()),
                    Err(e) => match api_error(e, "VolumeSnapshot", qualified(&delete_ns, &delete_name)) {
                        e if e.is_not_found() => Ok(()),
                        e => Err(e),
                    },
                }
            },
        ));

        let resource = qualified(&namespace, &name);
        let waited = wait::poll_until(
            "snapshot ready to use",
            &resource,
            ctx.timeouts.poll(),
            ctx.timeouts.claim_provision(),
            || async {
                let snapshot = api
                    .get(&name)
                    .await
                    .map_err(|e| api_error(e, "VolumeSnapshot", resource.clone()))?;
                debug!("snapshot {} readyToUse={}", resource, ready_to_use(&snapshot));
                Ok(ready_to_use(&snapshot))
            },
        )
        .await;

        match waited {
            Ok(()) => Ok(TakenSnapshot { name, release }),
            Err(e) => {
                if let Err(cleanup) = release.run(ctx).await {
                    debug!("releasing unready snapshot: {}", cleanup);
                }
                Err(e)
            }
        }
    }
}
