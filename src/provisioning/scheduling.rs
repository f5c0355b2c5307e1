//! Multi-Claim Scheduling Probe
//!
//! Checks WaitForFirstConsumer binding: claims without a consumer stay
//! Pending, a single consumer binds all of them at once, and an
//! unschedulable consumer binds none.

use crate::domain::types::{pod_node_name, qualified_name, ClaimPhase};
use crate::error::{Error, Result};
use crate::provisioning::claim::bound_volume_name;
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::with_teardown;
use crate::provisioning::wait;
use crate::provisioning::workload::{ProbeScript, CONTAINER_NAME};
use k8s_openapi::api::core::v1::{
    Container, Node, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

/// Poll interval while holding the Pending window
pub const PENDING_POLL: Duration = Duration::from_secs(2);

/// Result of binding several claims through one consumer
#[derive(Debug, Clone, Default)]
pub struct BindOutcome {
    /// Bound volumes, one per claim, in claim order
    pub volumes: Vec<PersistentVolume>,
    /// Node the consumer landed on
    pub node: Option<Node>,
}

/// Pod mounting every claim at `/mnt/volume<N>`
pub fn consumer_pod(
    ctx: &ScenarioContext,
    claim_names: &[String],
    node_selector: Option<&BTreeMap<String, String>>,
) -> Pod {
    let mut volumes = Vec::with_capacity(claim_names.len());
    let mut mounts = Vec::with_capacity(claim_names.len());
    for (index, claim) in claim_names.iter().enumerate() {
        let name = format!("volume{}", index + 1);
        mounts.push(VolumeMount {
            name: name.clone(),
            mount_path: format!("/mnt/{}", name),
            ..Default::default()
        });
        volumes.push(Volume {
            name,
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.clone(),
                read_only: Some(false),
            }),
            ..Default::default()
        });
    }

    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", ctx.pod_prefix("consumer"))),
            namespace: Some(ctx.namespace.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(ctx.test_image.clone()),
                command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
                args: Some(vec![ProbeScript::Hold.render(Default::default())]),
                volume_mounts: Some(mounts),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            volumes: Some(volumes),
            node_selector: node_selector.cloned(),
            restart_policy: Some("OnFailure".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

async fn verify_claims_pending(ctx: &ScenarioContext, claims: &[PersistentVolumeClaim]) -> Result<()> {
    for claim in claims {
        let namespace = claim.namespace().unwrap_or_default();
        let current = ctx.cp.get_claim(&namespace, &claim.name_any()).await?;
        let phase = ClaimPhase::of(&current)?;
        if phase != ClaimPhase::Pending {
            return Err(Error::mismatch(qualified_name(&current), "claim phase", ClaimPhase::Pending, phase));
        }
    }
    Ok(())
}

/// Create `claims`, prove they stay Pending, then attach a single consumer.
///
/// With `expect_unschedulable` the consumer carries `node_selector` and must
/// never be scheduled; the claims must still be Pending afterwards and the
/// outcome is empty. Otherwise every claim must bind and the outcome holds
/// their volumes and the consumer's node.
pub async fn bind_many(
    ctx: &ScenarioContext,
    claims: &[PersistentVolumeClaim],
    node_selector: &BTreeMap<String, String>,
    expect_unschedulable: bool,
) -> Result<BindOutcome> {
    let Some(first) = claims.first() else {
        return Err(Error::Configuration("bind_many needs at least one claim".into()));
    };
    let namespace = first.namespace().unwrap_or_else(|| ctx.namespace.clone());

    with_teardown(ctx, |teardown| async move {
        info!("creating claims");
        let mut created = Vec::with_capacity(claims.len());
        for claim in claims {
            let claim = ctx.cp.create_claim(claim).await?;
            teardown.track_claim(&claim);
            created.push(claim);
        }
        let names: Vec<String> = created.iter().map(|c| c.name_any()).collect();

        info!("checking the claims are in pending state");
        wait::ensure_claims_stay_pending(
            ctx.cp.as_ref(),
            &namespace,
            &names,
            PENDING_POLL,
            ctx.timeouts.claim_provision_short(),
        )
        .await?;
        verify_claims_pending(ctx, &created).await?;

        info!("creating a pod referring to the claims");
        let selector = expect_unschedulable.then_some(node_selector);
        let pod = ctx.cp.create_pod(&consumer_pod(ctx, &names, selector)).await?;
        teardown.track_pod(&pod);
        let pod_name = pod.name_any();

        if expect_unschedulable {
            wait::wait_for_pod_unschedulable(
                ctx.cp.as_ref(),
                &namespace,
                &pod_name,
                ctx.timeouts.poll(),
                ctx.timeouts.pod_start(),
            )
            .await?;
            verify_claims_pending(ctx, &created).await?;
            return Ok(BindOutcome::default());
        }

        let pod = wait::wait_for_pod_running(
            ctx.cp.as_ref(),
            &namespace,
            &pod_name,
            ctx.timeouts.poll(),
            ctx.timeouts.pod_start(),
        )
        .await?;
        let node_name = pod_node_name(&pod).ok_or_else(|| {
            Error::mismatch(qualified_name(&pod), "node assignment", "scheduled pod", "no node")
        })?;
        let node = ctx.cp.get_node(node_name).await?;

        info!("re-checking the claims to see they bound");
        let mut volumes = Vec::with_capacity(created.len());
        for name in &names {
            let claim = wait::wait_for_claim_phase(
                ctx.cp.as_ref(),
                &namespace,
                name,
                ClaimPhase::Bound,
                ctx.timeouts.poll(),
                ctx.timeouts.claim_provision(),
            )
            .await?;
            volumes.push(ctx.cp.get_volume(bound_volume_name(&claim)?).await?);
        }

        if volumes.len() != created.len() {
            return Err(Error::mismatch(&namespace, "bound volumes", created.len(), volumes.len()));
        }
        Ok(BindOutcome {
            volumes,
            node: Some(node),
        })
    })
    .await
}
