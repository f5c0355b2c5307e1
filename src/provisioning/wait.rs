//! Bounded polling
//!
//! Every wait in the engine polls at a fixed interval under a budget and
//! fails with `Error::Timeout` naming what it waited for.

use crate::domain::ports::ControlPlane;
use crate::domain::types::{ClaimPhase, PodPhase};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Poll interval used while waiting for a volume to be deleted
pub const VOLUME_DELETE_POLL: Duration = Duration::from_secs(5);

/// Poll `check` until it yields a value or `timeout` elapses.
///
/// The first check runs immediately. An error from `check` ends the wait.
pub async fn poll_for<T, F, Fut>(
    waiting_for: &str,
    resource: &str,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let start = Instant::now();
    loop {
        if let Some(value) = check().await? {
            debug!(
                "{} ({}) satisfied after {:?}",
                waiting_for,
                resource,
                start.elapsed()
            );
            return Ok(value);
        }

        if start.elapsed() >= timeout {
            return Err(Error::Timeout {
                waiting_for: waiting_for.to_string(),
                resource: resource.to_string(),
                budget: timeout,
            });
        }

        sleep(interval).await;
    }
}

/// Poll a boolean condition
pub async fn poll_until<F, Fut>(
    waiting_for: &str,
    resource: &str,
    interval: Duration,
    timeout: Duration,
    mut condition: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    poll_for(waiting_for, resource, interval, timeout, || {
        let fut = condition();
        async move { Ok(fut.await?.then_some(())) }
    })
    .await
}

// =============================================================================
// Claims
// =============================================================================

/// Wait for a claim to reach `phase` and return the claim as observed then
pub async fn wait_for_claim_phase(
    cp: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    phase: ClaimPhase,
    interval: Duration,
    timeout: Duration,
) -> Result<PersistentVolumeClaim> {
    info!(
        "Waiting up to {:?} for PersistentVolumeClaim {}/{} to have phase {}",
        timeout, namespace, name, phase
    );
    let resource = format!("{}/{}", namespace, name);
    poll_for(&format!("claim phase {}", phase), &resource, interval, timeout, || async {
        let claim = cp.get_claim(namespace, name).await?;
        let current = ClaimPhase::of(&claim)?;
        if current == phase {
            Ok(Some(claim))
        } else {
            debug!("claim {} is {}, want {}", resource, current, phase);
            Ok(None)
        }
    })
    .await
}

/// Wait until any (or all) of `names` reach `phase`
pub async fn wait_for_claims_phase(
    cp: &dyn ControlPlane,
    namespace: &str,
    names: &[String],
    phase: ClaimPhase,
    interval: Duration,
    timeout: Duration,
    match_any: bool,
) -> Result<()> {
    let resource = format!("{}/{{{}}}", namespace, names.join(","));
    poll_until(&format!("claims phase {}", phase), &resource, interval, timeout, || async {
        let mut reached = 0;
        for name in names {
            let claim = cp.get_claim(namespace, name).await?;
            if ClaimPhase::of(&claim)? == phase {
                reached += 1;
                if match_any {
                    return Ok(true);
                }
            }
        }
        Ok(!names.is_empty() && reached == names.len())
    })
    .await
}

/// Hold a window of `window` during which none of `names` may reach Bound.
///
/// Any claim observed Bound ends the window with an invariant violation.
pub async fn ensure_claims_stay_pending(
    cp: &dyn ControlPlane,
    namespace: &str,
    names: &[String],
    interval: Duration,
    window: Duration,
) -> Result<()> {
    match wait_for_claims_phase(cp, namespace, names, ClaimPhase::Bound, interval, window, true)
        .await
    {
        Ok(()) => Err(Error::mismatch(
            format!("{}/{{{}}}", namespace, names.join(",")),
            "premature binding",
            "all claims Pending without a consumer",
            "a claim reached Bound",
        )),
        Err(Error::Timeout { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Pods
// =============================================================================

fn pod_failure_reason(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let reason = status.and_then(|s| s.reason.clone());
    let message = status.and_then(|s| s.message.clone());
    let exit = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.first())
        .and_then(|c| c.state.as_ref())
        .and_then(|s| s.terminated.as_ref())
        .map(|t| format!("exit code {}", t.exit_code));

    [reason, message, exit]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(", ")
}

/// Wait for a pod to run to completion successfully
pub async fn wait_for_pod_success(
    cp: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Pod> {
    let resource = format!("{}/{}", namespace, name);
    poll_for("pod success", &resource, interval, timeout, || async {
        let pod = cp.get_pod(namespace, name).await?;
        match PodPhase::of(&pod) {
            PodPhase::Succeeded => Ok(Some(pod)),
            PodPhase::Failed => Err(Error::WorkloadFailed {
                pod: resource.clone(),
                reason: pod_failure_reason(&pod),
            }),
            _ => Ok(None),
        }
    })
    .await
}

/// Wait for a pod to be running
pub async fn wait_for_pod_running(
    cp: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Pod> {
    let resource = format!("{}/{}", namespace, name);
    poll_for("pod running", &resource, interval, timeout, || async {
        let pod = cp.get_pod(namespace, name).await?;
        match PodPhase::of(&pod) {
            PodPhase::Running => Ok(Some(pod)),
            PodPhase::Succeeded | PodPhase::Failed => Err(Error::WorkloadFailed {
                pod: resource.clone(),
                reason: format!("terminated before running: {}", pod_failure_reason(&pod)),
            }),
            _ => Ok(None),
        }
    })
    .await
}

/// Whether the scheduler reported the pod as unschedulable
pub fn is_unschedulable(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions.iter().any(|c| {
                c.type_ == "PodScheduled"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("Unschedulable")
            })
        })
        .unwrap_or(false)
}

/// Wait for the scheduler to give up on a pod
pub async fn wait_for_pod_unschedulable(
    cp: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<Pod> {
    let resource = format!("{}/{}", namespace, name);
    poll_for("pod unschedulable", &resource, interval, timeout, || async {
        let pod = cp.get_pod(namespace, name).await?;
        if PodPhase::of(&pod) == PodPhase::Running {
            return Err(Error::mismatch(&resource, "schedulability", "unschedulable", "Running"));
        }
        Ok(is_unschedulable(&pod).then_some(pod))
    })
    .await
}

/// Wait for a pod to disappear from the control plane
pub async fn wait_for_pod_gone(
    cp: &dyn ControlPlane,
    namespace: &str,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let resource = format!("{}/{}", namespace, name);
    poll_until("pod deletion", &resource, interval, timeout, || async {
        match cp.get_pod(namespace, name).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => Err(e),
        }
    })
    .await
}

// =============================================================================
// Volumes
// =============================================================================

/// Wait for a volume to be deleted.
///
/// Lookup errors other than not-found are logged and polling continues;
/// attach/detach races routinely make the volume briefly unreadable.
pub async fn wait_for_volume_deleted(
    cp: &dyn ControlPlane,
    name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    info!("Waiting up to {:?} for PersistentVolume {} to get deleted", timeout, name);
    poll_until("volume deletion", name, interval, timeout, || async {
        match cp.get_volume(name).await {
            Ok(volume) => {
                let phase = volume
                    .status
                    .as_ref()
                    .and_then(|s| s.phase.clone())
                    .unwrap_or_default();
                debug!("PersistentVolume {} found and phase={}", name, phase);
                Ok(false)
            }
            Err(e) if e.is_not_found() => Ok(true),
            Err(e) => {
                warn!("Get persistent volume {} failed, ignoring: {}", name, e);
                Ok(false)
            }
        }
    })
    .await
}
