//! Claim Lifecycle Engine
//!
//! Drives one claim from creation through binding, verification and
//! deletion:
//!
//! ```text
//! Created -> [ForceBinding] -> WaitingBound -> Verifying -> Draining -> Done
//! ```
//!
//! `ForceBinding` only happens for WaitForFirstConsumer classes. Any state
//! can fail; the claim is released on every path.

use crate::domain::types::{
    claim_class_name, claim_volume_name, qualified_name, BindingMode, ClaimPhase, NodeSelection,
    ReclaimPolicy, VolumeMode,
};
use crate::error::{Error, Result};
use crate::metrics;
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::with_teardown;
use crate::provisioning::verifier::{self, Expectations};
use crate::provisioning::wait::{self, VOLUME_DELETE_POLL};
use crate::provisioning::workload::{self, ProbeScript, WorkloadPod};
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::{
    PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{info, instrument};

/// Lifecycle states of a claim under test
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    ForceBinding,
    WaitingBound,
    Verifying,
    Draining,
    Done,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LifecycleState::Created => "Created",
            LifecycleState::ForceBinding => "ForceBinding",
            LifecycleState::WaitingBound => "WaitingBound",
            LifecycleState::Verifying => "Verifying",
            LifecycleState::Draining => "Draining",
            LifecycleState::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Extra verification run against the bound claim
pub type PvCheck =
    Arc<dyn Fn(ScenarioContext, PersistentVolumeClaim) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure as a [`PvCheck`]
pub fn pv_check<F, Fut>(check: F) -> PvCheck
where
    F: Fn(ScenarioContext, PersistentVolumeClaim) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx, claim| Box::pin(check(ctx, claim)))
}

/// One dynamic provisioning test case
#[derive(Clone)]
pub struct ProvisioningSpec {
    /// Claim template; needs `generate_name` and a namespace
    pub claim: PersistentVolumeClaim,
    /// Class to provision from, `None` for the cluster default
    pub class: Option<StorageClass>,
    /// Requested size
    pub claim_size: String,
    /// Size the volume must end up with
    pub expected_size: String,
    /// Placement for pods this test starts
    pub node_selection: NodeSelection,
    /// Extra check against the bound claim
    pub check: Option<PvCheck>,
}

impl std::fmt::Debug for ProvisioningSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningSpec")
            .field("claim", &self.claim.metadata.generate_name)
            .field("class", &self.class.as_ref().map(|c| c.name_any()))
            .field("claim_size", &self.claim_size)
            .field("expected_size", &self.expected_size)
            .field("check", &self.check.is_some())
            .finish()
    }
}

/// Claim template with generated name, size and optional class
pub fn claim_template(
    namespace: &str,
    size: &str,
    class_name: Option<&str>,
    mode: VolumeMode,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some("pvc-".to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            storage_class_name: class_name.map(str::to_string),
            volume_mode: Some(mode.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Re-read the claim and fetch the volume it is bound to
pub async fn bound_volume(ctx: &ScenarioContext, claim: &PersistentVolumeClaim) -> Result<PersistentVolume> {
    let namespace = claim.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let current = ctx.cp.get_claim(&namespace, &claim.name_any()).await?;

    // Bound never goes back to Pending
    let phase = ClaimPhase::of(&current)?;
    if phase != ClaimPhase::Bound {
        return Err(Error::mismatch(qualified_name(&current), "claim phase", ClaimPhase::Bound, phase));
    }

    ctx.cp.get_volume(bound_volume_name(&current)?).await
}

/// Volume name of a bound claim; an empty name is an invariant violation
pub fn bound_volume_name(claim: &PersistentVolumeClaim) -> Result<&str> {
    claim_volume_name(claim)
        .ok_or_else(|| Error::mismatch(qualified_name(claim), "volume name", "bound volume", "empty"))
}

fn validate(spec: &ProvisioningSpec) -> Result<()> {
    let generate_name = spec.claim.metadata.generate_name.as_deref().unwrap_or_default();
    if generate_name.is_empty() {
        return Err(Error::Configuration("claim template needs generate_name".into()));
    }
    if spec.claim.namespace().unwrap_or_default().is_empty() {
        return Err(Error::Configuration("claim template needs a namespace".into()));
    }
    if spec.claim_size.is_empty() || spec.expected_size.is_empty() {
        return Err(Error::Configuration("claim and expected sizes are required".into()));
    }
    Ok(())
}

/// Binding mode of the cluster default class; Immediate when there is none
async fn default_binding_mode(ctx: &ScenarioContext) -> Result<BindingMode> {
    let name = match ctx.cp.default_storage_class_name().await {
        Ok(name) => name,
        Err(e) if e.is_not_found() => return Ok(BindingMode::Immediate),
        Err(e) => return Err(e),
    };
    let class = ctx.cp.get_storage_class(&name).await?;
    let mode = BindingMode::of_class(&class)?;
    info!("claim without a class provisions from the default {} ({})", name, mode);
    Ok(mode)
}

fn transition(claim: &str, state: LifecycleState) {
    info!(claim = %claim, state = %state, "claim lifecycle");
}

/// Run one dynamic provisioning test.
///
/// Returns the volume the claim was bound to.
#[instrument(skip_all, fields(claim = ?spec.claim.metadata.generate_name))]
pub async fn test_dynamic_provisioning(
    ctx: &ScenarioContext,
    spec: &ProvisioningSpec,
) -> Result<Option<PersistentVolume>> {
    validate(spec)?;

    // The class must be present before anything is created
    let class = match &spec.class {
        Some(requested) => Some(ctx.cp.get_storage_class(&requested.name_any()).await.map_err(|e| {
            if e.is_not_found() {
                Error::Configuration(format!(
                    "storage class {} couldn't be fetched from the cluster",
                    requested.name_any()
                ))
            } else {
                e
            }
        })?),
        None => None,
    };
    let binding_mode = match &class {
        Some(c) => BindingMode::of_class(c)?,
        None => default_binding_mode(ctx).await?,
    };

    let ctx = &ctx.with_node_selection(spec.node_selection.clone());
    let class = class.as_ref();
    with_teardown(ctx, |teardown| async move {
        info!("creating claim {:?}", spec.claim.metadata.generate_name);
        let claim = ctx.cp.create_claim(&spec.claim).await?;
        teardown.track_claim(&claim);
        let identity = qualified_name(&claim);
        transition(&identity, LifecycleState::Created);

        if let Some(class) = class {
            let referenced = claim_class_name(&claim).unwrap_or_default();
            if referenced != class.name_any() {
                return Err(Error::mismatch(&identity, "storage class", class.name_any(), referenced));
            }
        }

        if binding_mode == BindingMode::WaitForFirstConsumer {
            transition(&identity, LifecycleState::ForceBinding);
            let mode = claim
                .spec
                .as_ref()
                .and_then(|s| s.volume_mode.as_deref())
                .map(str::parse::<VolumeMode>)
                .transpose()?
                .unwrap_or_default();
            let binder = WorkloadPod::new(ctx, &ctx.pod_prefix("binder"), &claim.name_any(), ProbeScript::Noop)
                .mode(mode);
            // Stopped right away, otherwise the volume can't be deleted below
            workload::run_pod(ctx, &binder).await?;
        }

        transition(&identity, LifecycleState::WaitingBound);
        let started = Instant::now();
        wait::wait_for_claim_phase(
            ctx.cp.as_ref(),
            &claim.namespace().unwrap_or_default(),
            &claim.name_any(),
            ClaimPhase::Bound,
            ctx.timeouts.poll(),
            ctx.timeouts.claim_provision(),
        )
        .await?;
        metrics::observe_bind_latency(started.elapsed());

        transition(&identity, LifecycleState::Verifying);
        if let Some(check) = &spec.check {
            check(ctx.clone(), claim.clone()).await?;
        }
        let volume = bound_volume(ctx, &claim).await?;
        verifier::verify_volume(
            &claim,
            &volume,
            Expectations {
                claim_size: &spec.claim_size,
                expected_size: &spec.expected_size,
                class,
            },
        )?;
        metrics::volume_verified();

        transition(&identity, LifecycleState::Draining);
        info!("deleting claim {}", identity);
        ctx.cp
            .delete_claim(&claim.namespace().unwrap_or_default(), &claim.name_any())
            .await?;

        // A retained volume stays around; the caller owns it from here
        if ReclaimPolicy::of_volume(&volume)? == Some(ReclaimPolicy::Delete) {
            info!("deleting the claim's volume {}", volume.name_any());
            wait::wait_for_volume_deleted(
                ctx.cp.as_ref(),
                &volume.name_any(),
                VOLUME_DELETE_POLL,
                ctx.timeouts.pv_delete_slow(),
            )
            .await?;
        }

        transition(&identity, LifecycleState::Done);
        Ok(Some(volume))
    })
    .await
}
