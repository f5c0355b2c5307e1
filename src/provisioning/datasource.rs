//! Data sources for pre-populated provisioning
//!
//! Both preparers create a populated source in the scenario namespace and
//! hand back the reference a new claim puts into `dataSource`, together
//! with the teardown that removes everything they created.

use crate::domain::ports::{DataSourcePreparer, PreparedDataSource, SnapshotProviderRef};
use crate::error::{Error, Result};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::probe;
use crate::provisioning::storage_class::ensure_storage_class;
use crate::provisioning::teardown::Teardown;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{info, warn};

/// File the source content is written to
pub const CONTENT_FILE: &str = "index.html";

pub const SNAPSHOT_API_GROUP: &str = "snapshot.storage.k8s.io";

/// Content every data-source scenario writes into its source
pub fn namespace_greeting(namespace: &str) -> String {
    format!("Hello from namespace {}", namespace)
}

/// Create the source claim unless it already exists in the cluster
async fn create_source_claim(
    ctx: &ScenarioContext,
    source: &PersistentVolumeClaim,
    release: &Teardown,
) -> Result<PersistentVolumeClaim> {
    if source.metadata.resource_version.is_some() {
        info!("Skipping creation of PVC {}, it already exists", source.name_any());
        release.track_claim(source);
        return Ok(source.clone());
    }

    info!("[Initialize dataSource] creating a source claim");
    let claim = match ctx.cp.create_claim(source).await {
        Ok(claim) => claim,
        Err(e) if e.is_already_exists() => {
            let namespace = source.namespace().unwrap_or_else(|| ctx.namespace.clone());
            ctx.cp.get_claim(&namespace, &source.name_any()).await?
        }
        Err(e) => return Err(e),
    };
    release.track_claim(&claim);
    Ok(claim)
}

/// Run `populate`, releasing everything registered so far when it fails
async fn prepare_with<F, Fut>(ctx: &ScenarioContext, release: Teardown, populate: F) -> Result<PreparedDataSource>
where
    F: FnOnce(Teardown) -> Fut,
    Fut: std::future::Future<Output = Result<TypedLocalObjectReference>>,
{
    match populate(release.clone()).await {
        Ok(reference) => Ok(PreparedDataSource { reference, release }),
        Err(e) => {
            if let Err(cleanup) = release.run(ctx).await {
                warn!("releasing a half-prepared data source failed: {}", cleanup);
            }
            Err(e)
        }
    }
}

// =============================================================================
// Claim Clone Source
// =============================================================================

/// Populated claim that new claims are cloned from
pub struct ClaimCloneSource {
    /// Source claim template
    pub source: PersistentVolumeClaim,
    /// Class the source is provisioned from
    pub class: StorageClass,
}

#[async_trait]
impl DataSourcePreparer for ClaimCloneSource {
    async fn prepare(&self, ctx: &ScenarioContext, content: &str) -> Result<PreparedDataSource> {
        let (_, release) = ensure_storage_class(ctx, Some(&self.class)).await?;

        prepare_with(ctx, release, |release| async move {
            let claim = create_source_claim(ctx, &self.source, &release).await?;
            probe::inject_content(ctx, &claim, CONTENT_FILE, content, &ctx.node_selection).await?;

            Ok(TypedLocalObjectReference {
                api_group: None,
                kind: "PersistentVolumeClaim".to_string(),
                name: claim.name_any(),
            })
        })
        .await
    }

    fn kind(&self) -> &str {
        "PersistentVolumeClaim"
    }
}

// =============================================================================
// Snapshot Source
// =============================================================================

/// Snapshot of a populated claim that new claims are restored from
pub struct SnapshotSource {
    /// Claim that gets populated and snapshotted
    pub source: PersistentVolumeClaim,
    /// Class the source is provisioned from
    pub class: StorageClass,
    /// Driver-specific snapshot support
    pub snapshots: SnapshotProviderRef,
}

#[async_trait]
impl DataSourcePreparer for SnapshotSource {
    async fn prepare(&self, ctx: &ScenarioContext, content: &str) -> Result<PreparedDataSource> {
        let (_, release) = ensure_storage_class(ctx, Some(&self.class)).await?;

        prepare_with(ctx, release, |release| async move {
            let claim = create_source_claim(ctx, &self.source, &release).await?;
            probe::inject_content(ctx, &claim, CONTENT_FILE, content, &ctx.node_selection).await?;

            let snapshot = self.snapshots.snapshot_claim(ctx, &claim).await?;
            if snapshot.name.is_empty() {
                return Err(Error::Platform(format!(
                    "snapshot of {} came back without a name",
                    claim.name_any()
                )));
            }
            let name = snapshot.name.clone();
            release.absorb(snapshot.release);

            Ok(TypedLocalObjectReference {
                api_group: Some(SNAPSHOT_API_GROUP.to_string()),
                kind: "VolumeSnapshot".to_string(),
                name,
            })
        })
        .await
    }

    fn kind(&self) -> &str {
        "VolumeSnapshot"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::driver::DriverDescriptor;
    use crate::domain::types::VolumeMode;
    use crate::platform::simulated::SimulatedCluster;
    use crate::provisioning::claim::claim_template;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    const NS: &str = "datasource";

    fn fixture(cluster: &SimulatedCluster) -> (ScenarioContext, StorageClass, PersistentVolumeClaim) {
        let config = RunnerConfig::new(DriverDescriptor::new("csi.example.com"));
        let ctx = ScenarioContext::new(cluster.handle(), NS, &config);
        let class = ctx.driver.dynamic_class(NS, "");
        let source = claim_template(NS, "1Gi", Some(&class.name_any()), VolumeMode::Filesystem);
        (ctx, class, source)
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_source_is_populated() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, class, source) = fixture(&cluster);
        let preparer = ClaimCloneSource { source, class };

        let prepared = preparer.prepare(&ctx, &namespace_greeting(NS)).await.unwrap();
        assert_eq!(prepared.reference.kind, "PersistentVolumeClaim");
        assert!(prepared.reference.api_group.is_none());

        let claim = ctx.cp.get_claim(NS, &prepared.reference.name).await.unwrap();
        let volume = crate::provisioning::claim::bound_volume(&ctx, &claim).await.unwrap();
        assert_eq!(
            cluster.read_file(&volume.name_any(), CONTENT_FILE).as_deref(),
            Some("Hello from namespace datasource\n")
        );

        // Class, then source claim
        assert_eq!(prepared.release.len(), 2);
        prepared.release.run(&ctx).await.unwrap();
        assert_eq!(cluster.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_source_is_not_recreated() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, class, source) = fixture(&cluster);
        ctx.cp.create_storage_class(&class).await.unwrap();
        let existing = ctx.cp.create_claim(&source).await.unwrap();

        let preparer = ClaimCloneSource {
            source: existing.clone(),
            class,
        };
        let prepared = preparer.prepare(&ctx, "payload").await.unwrap();

        assert_eq!(prepared.reference.name, existing.name_any());
        assert_eq!(cluster.claim_count(), 1);
        prepared.release.run(&ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_source_reference() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, class, source) = fixture(&cluster);
        let preparer = SnapshotSource {
            source,
            class,
            snapshots: Arc::new(cluster.clone()),
        };

        let prepared = preparer.prepare(&ctx, &namespace_greeting(NS)).await.unwrap();
        assert_eq!(prepared.reference.kind, "VolumeSnapshot");
        assert_eq!(prepared.reference.api_group.as_deref(), Some(SNAPSHOT_API_GROUP));
        assert!(cluster.has_snapshot(NS, &prepared.reference.name));

        prepared.release.run(&ctx).await.unwrap();
        assert!(!cluster.has_snapshot(NS, &prepared.reference.name));
        assert_eq!(cluster.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_population_releases_source() {
        // No nodes: the writer pod never schedules
        let cluster = SimulatedCluster::new();
        let (mut ctx, class, source) = fixture(&cluster);
        ctx.timeouts.pod_start_slow_secs = 30;
        let preparer = ClaimCloneSource { source, class };

        assert_matches!(preparer.prepare(&ctx, "payload").await, Err(Error::Timeout { .. }));
        assert_eq!(cluster.claim_count(), 0);
        assert_eq!(cluster.pod_count(), 0);
    }
}
