//! Storage Class Provisioner
//!
//! Resolves the class a scenario provisions from. A requested class is
//! reused when present and created otherwise; without a request the
//! cluster default is used. Only a class created here is ever deleted.

use crate::error::{Error, Result};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown::Teardown;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::info;

/// Make sure `requested` exists, or resolve the default class.
///
/// The returned teardown deletes the class only if this call created it.
pub async fn ensure_storage_class(
    ctx: &ScenarioContext,
    requested: Option<&StorageClass>,
) -> Result<(StorageClass, Teardown)> {
    let release = Teardown::new();

    let Some(requested) = requested else {
        let name = ctx.cp.default_storage_class_name().await?;
        info!("Wanted storage class is nil, fetching default StorageClass={}", name);
        let class = ctx.cp.get_storage_class(&name).await?;
        return Ok((class, release));
    };

    let name = requested.name_any();
    if name.is_empty() {
        return Err(Error::Configuration("storage class needs a name".into()));
    }

    match ctx.cp.get_storage_class(&name).await {
        Ok(existing) => {
            info!("Storage class {} is already created, skipping creation.", name);
            return Ok((existing, release));
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }

    info!("Creating a StorageClass {}", name);
    match ctx.cp.create_storage_class(requested).await {
        Ok(_) => {
            release.track_storage_class(&name);
        }
        // Another scenario created it in between; it owns the class
        Err(e) if e.is_already_exists() => {
            info!("Storage class {} appeared concurrently, reusing it", name);
        }
        Err(e) => return Err(e),
    }

    let class = ctx.cp.get_storage_class(&name).await?;
    Ok((class, release))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::domain::driver::DriverDescriptor;
    use crate::platform::simulated::SimulatedCluster;
    use assert_matches::assert_matches;

    fn context(cluster: &SimulatedCluster) -> ScenarioContext {
        let config = RunnerConfig::new(DriverDescriptor::new("csi.example.com"));
        ScenarioContext::new(cluster.handle(), "sc", &config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_and_releases_missing_class() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let requested = ctx.driver.dynamic_class("sc", "");

        let (class, release) = ensure_storage_class(&ctx, Some(&requested)).await.unwrap();
        assert_eq!(class.provisioner, "csi.example.com");
        assert_eq!(release.len(), 1);

        release.run(&ctx).await.unwrap();
        assert!(ctx.cp.get_storage_class(&class.name_any()).await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_existing_class_without_release() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let requested = ctx.driver.dynamic_class("sc", "");
        ctx.cp.create_storage_class(&requested).await.unwrap();

        let (_, release) = ensure_storage_class(&ctx, Some(&requested)).await.unwrap();
        assert!(release.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_creation_converges() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);
        let requested = ctx.driver.dynamic_class("sc", "");

        let (a, b) = tokio::join!(
            ensure_storage_class(&ctx, Some(&requested)),
            ensure_storage_class(&ctx, Some(&requested))
        );
        let (class_a, release_a) = a.unwrap();
        let (class_b, release_b) = b.unwrap();

        assert_eq!(class_a.name_any(), class_b.name_any());
        // Exactly one of them owns the class
        assert_eq!(release_a.len() + release_b.len(), 1);
        release_a.run(&ctx).await.unwrap();
        release_b.run(&ctx).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_class() {
        let cluster = SimulatedCluster::new().with_default_class("standard", "csi.example.com");
        let ctx = context(&cluster);

        let (class, release) = ensure_storage_class(&ctx, None).await.unwrap();
        assert_eq!(class.name_any(), "standard");
        assert!(release.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_default_class() {
        let cluster = SimulatedCluster::new();
        let ctx = context(&cluster);

        assert_matches!(ensure_storage_class(&ctx, None).await, Err(Error::ResourceNotFound { .. }));
    }
}
