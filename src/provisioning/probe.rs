//! Data-Integrity Probe
//!
//! Proves a provisioned volume keeps what was written to it: a writer pod
//! stores a known payload, a reader pod greps for it. The single-node probe
//! reads on the writer's node, the multi-node probe on any other node.

use crate::domain::types::{pod_node_name, qualified_name, NodeSelection, VolumeMode};
use crate::error::{Error, Result};
use crate::provisioning::claim::bound_volume;
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::workload::{self, ProbeScript, WorkloadPod};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use tracing::info;

pub const HELLO_WORLD: &str = "hello world";
pub const DATA_FILE: &str = "data";

fn claim_mode(claim: &PersistentVolumeClaim) -> Result<VolumeMode> {
    claim
        .spec
        .as_ref()
        .and_then(|s| s.volume_mode.as_deref())
        .map(str::parse::<VolumeMode>)
        .transpose()
        .map(Option::unwrap_or_default)
}

fn ran_on(pod: &Pod) -> Result<String> {
    pod_node_name(pod)
        .map(str::to_string)
        .ok_or_else(|| Error::mismatch(qualified_name(pod), "node assignment", "scheduled pod", "no node"))
}

/// Write `content` into `file` on the claim's volume.
///
/// Returns the node the writer ran on.
pub async fn inject_content(
    ctx: &ScenarioContext,
    claim: &PersistentVolumeClaim,
    file: &str,
    content: &str,
    selection: &NodeSelection,
) -> Result<String> {
    let writer = WorkloadPod::new(ctx, &ctx.pod_prefix("injector"), &claim.name_any(), ProbeScript::write(file, content))
        .mode(claim_mode(claim)?)
        .selection(selection.clone());
    let pod = workload::run_pod(ctx, &writer).await?;
    ran_on(&pod)
}

/// Check `file` on the claim's volume holds `content`.
pub async fn verify_content(
    ctx: &ScenarioContext,
    claim: &PersistentVolumeClaim,
    file: &str,
    content: &str,
    selection: &NodeSelection,
) -> Result<()> {
    let reader = WorkloadPod::new(ctx, &ctx.pod_prefix("verifier"), &claim.name_any(), ProbeScript::verify(file, content))
        .mode(claim_mode(claim)?)
        .selection(selection.clone());
    workload::run_pod(ctx, &reader).await.map(|_| ())
}

/// Write on one node, read back on the same node.
///
/// The reader additionally checks the volume is mounted with the volume's
/// mount options when the platform exposes a mount table. Returns the
/// volume as seen between the two pods.
pub async fn write_read_single_node_check(
    ctx: &ScenarioContext,
    claim: &PersistentVolumeClaim,
    selection: &NodeSelection,
) -> Result<PersistentVolume> {
    info!("checking the created volume is writable on node {:?}", selection);
    let mode = claim_mode(claim)?;
    let writer = WorkloadPod::new(ctx, "pvc-volume-tester-writer", &claim.name_any(), ProbeScript::write(DATA_FILE, HELLO_WORLD))
        .mode(mode)
        .selection(selection.clone());
    let writer = workload::run_pod(ctx, &writer).await?;
    let node = ran_on(&writer)?;

    let volume = bound_volume(ctx, claim).await?;

    info!(
        "checking the created volume has the correct mount options, is readable and retains data on the same node {:?}",
        node
    );
    let mut script = ProbeScript::verify(DATA_FILE, HELLO_WORLD);
    if ctx.platform.mount_table {
        let options = volume
            .spec
            .as_ref()
            .and_then(|s| s.mount_options.clone())
            .unwrap_or_default();
        script = script.with_mount_options(options);
    }
    let reader = WorkloadPod::new(ctx, "pvc-volume-tester-reader", &claim.name_any(), script)
        .mode(mode)
        .selection(NodeSelection::pinned(&node));
    workload::run_pod(ctx, &reader).await?;

    Ok(volume)
}

/// Write on one node, read back on a different node.
///
/// Needs at least two eligible nodes and a selection that does not pin a
/// single node.
pub async fn multi_node_check(
    ctx: &ScenarioContext,
    claim: &PersistentVolumeClaim,
    selection: &NodeSelection,
) -> Result<()> {
    if let Some(name) = &selection.name {
        return Err(Error::Configuration(format!(
            "multi-node check only works when not locked onto a single node, got {}",
            name
        )));
    }

    info!("checking the created volume is writable on node {:?}", selection);
    let mode = claim_mode(claim)?;
    let writer = WorkloadPod::new(ctx, "pvc-writer-node1", &claim.name_any(), ProbeScript::write(DATA_FILE, HELLO_WORLD))
        .mode(mode)
        .selection(selection.clone());
    let writer = workload::run_pod(ctx, &writer).await?;
    let first_node = ran_on(&writer)?;

    let mut second = selection.clone();
    second.set_anti_affinity(&first_node);
    info!("checking the created volume is readable and retains data on another node {:?}", second);
    let reader = WorkloadPod::new(ctx, "pvc-reader-node2", &claim.name_any(), ProbeScript::verify(DATA_FILE, HELLO_WORLD))
        .mode(mode)
        .selection(second);
    let reader = workload::run_pod(ctx, &reader).await?;

    let second_node = ran_on(&reader)?;
    if second_node == first_node {
        return Err(Error::mismatch(
            qualified_name(&reader),
            "reader node",
            format!("a node other than {}", first_node),
            second_node,
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::driver::DriverDescriptor;
    use crate::domain::types::ClaimPhase;
    use crate::platform::simulated::SimulatedCluster;
    use crate::provisioning::claim::claim_template;
    use crate::provisioning::storage_class::ensure_storage_class;
    use crate::provisioning::wait;
    use assert_matches::assert_matches;
    use k8s_openapi::api::storage::v1::StorageClass;

    const NS: &str = "probe";

    fn class() -> StorageClass {
        DriverDescriptor::new("csi.example.com").dynamic_class(NS, "")
    }

    async fn bound_claim(
        cluster: &SimulatedCluster,
        class: StorageClass,
        mode: VolumeMode,
    ) -> (ScenarioContext, PersistentVolumeClaim) {
        let config = RunnerConfig::new(DriverDescriptor::new("csi.example.com"));
        let ctx = ScenarioContext::new(cluster.handle(), NS, &config);
        let (class, _) = ensure_storage_class(&ctx, Some(&class)).await.unwrap();
        let claim = ctx
            .cp
            .create_claim(&claim_template(NS, "1Gi", Some(&class.name_any()), mode))
            .await
            .unwrap();
        let claim = wait::wait_for_claim_phase(
            ctx.cp.as_ref(),
            NS,
            &claim.name_any(),
            ClaimPhase::Bound,
            ctx.timeouts.poll(),
            ctx.timeouts.claim_provision(),
        )
        .await
        .unwrap();
        (ctx, claim)
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_round_trip() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;

        let volume = write_read_single_node_check(&ctx, &claim, &NodeSelection::default())
            .await
            .unwrap();
        assert_eq!(
            cluster.read_file(&volume.name_any(), DATA_FILE).as_deref(),
            Some("hello world\n")
        );
        let nodes = cluster.nodes_that_ran("pvc-volume-tester-");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0], nodes[1]);
        assert_eq!(cluster.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_checks_mount_options() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let mut with_options = class();
        with_options.mount_options = Some(vec!["debug".into()]);
        let (ctx, claim) = bound_claim(&cluster, with_options, VolumeMode::Filesystem).await;

        write_read_single_node_check(&ctx, &claim, &NodeSelection::default())
            .await
            .unwrap();

        // Node mounts without the option: only a mount-table platform notices
        cluster.faults().drop_mount_options(true);
        assert_matches!(
            write_read_single_node_check(&ctx, &claim, &NodeSelection::default()).await,
            Err(Error::WorkloadFailed { .. })
        );

        let mut blind = ctx.clone();
        blind.platform.mount_table = false;
        assert!(write_read_single_node_check(&blind, &claim, &NodeSelection::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_node_block_volume() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Block).await;

        assert!(write_read_single_node_check(&ctx, &claim, &NodeSelection::default())
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_write_fails_reader() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;
        cluster.faults().discard_writes(true);

        assert_matches!(
            write_read_single_node_check(&ctx, &claim, &NodeSelection::default()).await,
            Err(Error::WorkloadFailed { ref pod, .. }) if pod.contains("pvc-volume-tester-reader")
        );
        assert_eq!(cluster.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_node_reads_elsewhere() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;

        multi_node_check(&ctx, &claim, &NodeSelection::default()).await.unwrap();
        let nodes = cluster.nodes_that_ran("pvc-");
        assert_eq!(nodes.len(), 2);
        assert_ne!(nodes[0], nodes[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_node_rejects_pinned_selection() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;

        assert_matches!(
            multi_node_check(&ctx, &claim, &NodeSelection::pinned("node-a")).await,
            Err(Error::Configuration(_))
        );
        assert_eq!(cluster.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_node_single_node_cluster_times_out() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;

        assert_matches!(
            multi_node_check(&ctx, &claim, &NodeSelection::default()).await,
            Err(Error::Timeout { .. })
        );
        assert_eq!(cluster.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inject_then_verify() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let (ctx, claim) = bound_claim(&cluster, class(), VolumeMode::Filesystem).await;
        let anywhere = NodeSelection::default();

        let node = inject_content(&ctx, &claim, "index.html", "Hello from namespace probe", &anywhere)
            .await
            .unwrap();
        assert_eq!(node, "node-a");
        verify_content(&ctx, &claim, "index.html", "Hello from namespace probe", &anywhere)
            .await
            .unwrap();
        assert_matches!(
            verify_content(&ctx, &claim, "index.html", "something else", &anywhere).await,
            Err(Error::WorkloadFailed { .. })
        );
    }
}
