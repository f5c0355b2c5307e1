//! Teardown Coordinator
//!
//! Resources are registered as they are acquired and released in reverse
//! order on every exit path. Each release logs its own failure and the
//! remaining releases still run; all failures come back together as one
//! `Error::Cleanup`.

use crate::error::{Error, Result};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::wait;
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, info, warn};

type ReleaseFn = Box<dyn FnOnce(ScenarioContext) -> BoxFuture<'static, Result<()>> + Send>;

// =============================================================================
// Release Actions
// =============================================================================

/// A single registered release
pub enum Release {
    /// Capture logs, delete, wait until gone
    Pod { namespace: String, name: String },
    /// Delete a claim
    Claim { namespace: String, name: String },
    /// Delete a volume
    Volume { name: String },
    /// Delete a storage class
    StorageClass { name: String },
    /// Anything else
    Custom { description: String, action: ReleaseFn },
}

impl Release {
    pub fn custom<F, Fut>(description: impl Into<String>, action: F) -> Self
    where
        F: FnOnce(ScenarioContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Release::Custom {
            description: description.into(),
            action: Box::new(move |ctx| action(ctx).boxed()),
        }
    }

    fn describe(&self) -> String {
        match self {
            Release::Pod { namespace, name } => format!("pod {}/{}", namespace, name),
            Release::Claim { namespace, name } => format!("claim {}/{}", namespace, name),
            Release::Volume { name } => format!("volume {}", name),
            Release::StorageClass { name } => format!("storage class {}", name),
            Release::Custom { description, .. } => description.clone(),
        }
    }

    async fn execute(self, ctx: &ScenarioContext) -> Result<()> {
        let tolerate_missing = |res: Result<()>| match res {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        };

        match self {
            Release::Pod { namespace, name } => stop_pod(ctx, &namespace, &name).await,
            Release::Claim { namespace, name } => {
                info!("deleting claim {}/{}", namespace, name);
                tolerate_missing(ctx.cp.delete_claim(&namespace, &name).await)
            }
            Release::Volume { name } => {
                info!("deleting volume {}", name);
                tolerate_missing(ctx.cp.delete_volume(&name).await)
            }
            Release::StorageClass { name } => {
                info!("deleting storage class {}", name);
                tolerate_missing(ctx.cp.delete_storage_class(&name).await)
            }
            Release::Custom { action, .. } => action(ctx.clone()).await,
        }
    }
}

/// Capture a pod's logs, delete it and wait for it to disappear.
///
/// Log capture is best effort; a pod that is already gone counts as stopped.
pub async fn stop_pod(ctx: &ScenarioContext, namespace: &str, name: &str) -> Result<()> {
    match ctx.cp.pod_logs(namespace, name).await {
        Ok(body) => info!("Pod {}/{} has the following logs: {}", namespace, name, body),
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => warn!("Error getting logs for pod {}/{}: {}", namespace, name, e),
    }

    match ctx.cp.delete_pod(namespace, name).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }

    wait::wait_for_pod_gone(
        ctx.cp.as_ref(),
        namespace,
        name,
        ctx.timeouts.poll(),
        ctx.timeouts.pod_delete(),
    )
    .await
}

// =============================================================================
// Teardown Ledger
// =============================================================================

struct Ledger {
    actions: Mutex<Vec<Release>>,
}

impl Drop for Ledger {
    fn drop(&mut self) {
        let pending = self.actions.get_mut();
        if !pending.is_empty() {
            let leaked: Vec<String> = pending.iter().map(Release::describe).collect();
            warn!("teardown dropped without running, leaking: {}", leaked.join(", "));
        }
    }
}

/// Shared, ordered list of release actions.
///
/// Cloning yields another handle to the same ledger, so a workflow body can
/// keep registering resources while the caller holds on to the teardown.
#[derive(Clone)]
pub struct Teardown {
    ledger: Arc<Ledger>,
}

impl std::fmt::Debug for Release {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("pending", &*self.ledger.actions.lock())
            .finish()
    }
}

impl Default for Teardown {
    fn default() -> Self {
        Self::new()
    }
}

impl Teardown {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Ledger {
                actions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn push(&self, release: Release) {
        debug!("registered release of {}", release.describe());
        self.ledger.actions.lock().push(release);
    }

    pub fn track_pod(&self, pod: &Pod) {
        self.push(Release::Pod {
            namespace: pod.namespace().unwrap_or_default(),
            name: pod.name_any(),
        });
    }

    pub fn track_claim(&self, claim: &PersistentVolumeClaim) {
        self.push(Release::Claim {
            namespace: claim.namespace().unwrap_or_default(),
            name: claim.name_any(),
        });
    }

    pub fn track_storage_class(&self, name: &str) {
        self.push(Release::StorageClass {
            name: name.to_string(),
        });
    }

    /// Move every action of `other` into this ledger, keeping their order
    pub fn absorb(&self, other: Teardown) {
        let moved: Vec<Release> = std::mem::take(&mut *other.ledger.actions.lock());
        self.ledger.actions.lock().extend(moved);
    }

    pub fn len(&self) -> usize {
        self.ledger.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every registered release, last registered first.
    ///
    /// Releases registered while running are picked up as well.
    pub async fn run(&self, ctx: &ScenarioContext) -> Result<()> {
        let mut failures = Vec::new();

        loop {
            // Pop under the lock, release without it
            let next = self.ledger.actions.lock().pop();
            let Some(release) = next else { break };

            let description = release.describe();
            if let Err(e) = release.execute(ctx).await {
                warn!("failed to release {}: {}", description, e);
                failures.push(format!("{}: {}", description, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Cleanup { failures })
        }
    }
}

/// Run `body` with a fresh teardown and release everything afterwards.
///
/// A body error wins over cleanup errors, which are only logged in that
/// case. A panicking body still gets its teardown before the panic resumes.
pub async fn with_teardown<T, F, Fut>(ctx: &ScenarioContext, body: F) -> Result<T>
where
    F: FnOnce(Teardown) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let teardown = Teardown::new();
    let outcome = AssertUnwindSafe(body(teardown.clone())).catch_unwind().await;
    let cleanup = teardown.run(ctx).await;

    match outcome {
        Err(panic) => {
            if let Err(e) = cleanup {
                warn!("cleanup after panic failed: {}", e);
            }
            std::panic::resume_unwind(panic)
        }
        Ok(Err(e)) => {
            if let Err(cleanup_err) = cleanup {
                warn!("cleanup after failure also failed: {}", cleanup_err);
            }
            Err(e)
        }
        Ok(Ok(value)) => cleanup.map(|_| value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::driver::DriverDescriptor;
    use crate::platform::simulated::SimulatedCluster;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(cluster: &SimulatedCluster) -> ScenarioContext {
        let config = RunnerConfig::new(DriverDescriptor::new("csi.example.com"));
        ScenarioContext::new(cluster.handle(), "teardown", &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_lists_pending_releases() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let teardown = Teardown::new();
        teardown.track_storage_class("fast");
        teardown.push(Release::Volume { name: "pv-1".into() });

        let rendered = format!("{:?}", teardown);
        assert_eq!(rendered, "Teardown { pending: [storage class fast, volume pv-1] }");

        teardown.run(&ctx).await.unwrap();
        assert_eq!(format!("{:?}", teardown), "Teardown { pending: [] }");
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_in_reverse_order() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let order = Arc::new(Mutex::new(Vec::new()));

        let teardown = Teardown::new();
        for i in 0..3 {
            let order = order.clone();
            teardown.push(Release::custom(format!("step {}", i), move |_| async move {
                order.lock().push(i);
                Ok(())
            }));
        }

        teardown.run(&ctx).await.unwrap();
        assert_eq!(*order.lock(), vec![2, 1, 0]);
        assert!(teardown.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_do_not_stop_later_releases() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let ran = Arc::new(AtomicUsize::new(0));

        let teardown = Teardown::new();
        {
            let ran = ran.clone();
            teardown.push(Release::custom("first", move |_| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        teardown.push(Release::custom("broken", |_| async {
            Err(Error::Platform("denied".into()))
        }));
        teardown.push(Release::custom("also broken", |_| async {
            Err(Error::Platform("still denied".into()))
        }));

        let err = teardown.run(&ctx).await.unwrap_err();
        assert_matches!(err, Error::Cleanup { ref failures } if failures.len() == 2);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_objects_are_released() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);

        let teardown = Teardown::new();
        teardown.push(Release::Claim {
            namespace: "teardown".into(),
            name: "never-created".into(),
        });
        teardown.push(Release::Pod {
            namespace: "teardown".into(),
            name: "never-created".into(),
        });
        teardown.track_storage_class("never-created");

        assert!(teardown.run(&ctx).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_error_wins_over_cleanup_error() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);

        let result: Result<()> = with_teardown(&ctx, |td| async move {
            td.push(Release::custom("broken", |_| async {
                Err(Error::Platform("denied".into()))
            }));
            Err(Error::mismatch("ns/a", "capacity", "1Gi", "2Gi"))
        })
        .await;

        assert_matches!(result, Err(Error::InvariantViolation { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_error_surfaces_after_success() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);

        let result = with_teardown(&ctx, |td| async move {
            td.push(Release::custom("broken", |_| async {
                Err(Error::Platform("denied".into()))
            }));
            Ok(7)
        })
        .await;

        assert_matches!(result, Err(Error::Cleanup { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_absorb_keeps_relative_order() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let order = Arc::new(Mutex::new(Vec::new()));

        let outer = Teardown::new();
        let inner = Teardown::new();
        for (td, label) in [(&outer, "outer"), (&inner, "inner-a"), (&inner, "inner-b")] {
            let order = order.clone();
            td.push(Release::custom(label, move |_| async move {
                order.lock().push(label);
                Ok(())
            }));
        }

        outer.absorb(inner.clone());
        assert!(inner.is_empty());
        outer.run(&ctx).await.unwrap();
        assert_eq!(*order.lock(), vec!["inner-b", "inner-a", "outer"]);
    }
}
