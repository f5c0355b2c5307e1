//! Provisioning suite
//!
//! Scenario entry points. Every run gets a fresh [`ScenarioContext`], checks
//! the driver's declared capabilities first and reports an [`Outcome`]
//! instead of failing the whole run.

use crate::capacity::SizeRange;
use crate::config::RunnerConfig;
use crate::domain::driver::Capability;
use crate::domain::ports::{ControlPlaneRef, DataSourcePreparerRef, OpCountSourceRef, SnapshotProviderRef};
use crate::domain::types::{qualified_name, NodeSelection, ReclaimPolicy, VolumeMode};
use crate::error::{Error, Result};
use crate::metrics;
use crate::provisioning::claim::{self, claim_template, pv_check, PvCheck, ProvisioningSpec};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::datasource::{namespace_greeting, ClaimCloneSource, SnapshotSource, CONTENT_FILE};
use crate::provisioning::migration::MigrationOpCheck;
use crate::provisioning::parallel;
use crate::provisioning::probe;
use crate::provisioning::scheduling;
use crate::provisioning::storage_class::ensure_storage_class;
use crate::provisioning::teardown::{with_teardown, Release, Teardown};
use crate::provisioning::topology::{ensure_topology_requirements, Placement};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Smallest claim the suite asks for
pub const SUITE_MIN_SIZE: &str = "1Mi";

/// Claims bound through a single consumer in the multi-claim scenarios
pub const MULTI_CLAIM_COUNT: usize = 3;

/// Node label no node carries
pub const UNSATISFIABLE_LABEL: (&str, &str) = ("storage-conformance.io/nonexistent", "true");

// =============================================================================
// Scenarios & Patterns
// =============================================================================

/// Scenarios the suite can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scenario {
    MountOptions,
    SnapshotDataSource,
    PvcDataSource,
    PvcDataSourceParallel,
    MultiNode,
    WaitForFirstConsumerMultiClaim,
    UnschedulableConsumer,
    ReclaimRetain,
}

impl Scenario {
    pub const ALL: [Scenario; 8] = [
        Scenario::MountOptions,
        Scenario::SnapshotDataSource,
        Scenario::PvcDataSource,
        Scenario::PvcDataSourceParallel,
        Scenario::MultiNode,
        Scenario::WaitForFirstConsumerMultiClaim,
        Scenario::UnschedulableConsumer,
        Scenario::ReclaimRetain,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::MountOptions => "mount-options",
            Scenario::SnapshotDataSource => "snapshot-data-source",
            Scenario::PvcDataSource => "pvc-data-source",
            Scenario::PvcDataSourceParallel => "pvc-data-source-parallel",
            Scenario::MultiNode => "multi-node",
            Scenario::WaitForFirstConsumerMultiClaim => "wait-for-first-consumer-multi-claim",
            Scenario::UnschedulableConsumer => "unschedulable-consumer",
            Scenario::ReclaimRetain => "reclaim-retain",
        }
    }
}

impl std::fmt::Display for Scenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Scenario::ALL
            .into_iter()
            .find(|scenario| scenario.name() == s)
            .ok_or_else(|| Error::Configuration(format!("unknown scenario {:?}", s)))
    }
}

/// Volume mode and filesystem a scenario runs with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestPattern {
    pub name: String,
    pub volume_mode: VolumeMode,
    /// Empty for the driver default
    pub fs_type: String,
}

impl TestPattern {
    pub fn default_fs() -> Self {
        Self {
            name: "Dynamic PV (default fs)".to_string(),
            volume_mode: VolumeMode::Filesystem,
            fs_type: String::new(),
        }
    }

    pub fn block() -> Self {
        Self {
            name: "Dynamic PV (block volmode)".to_string(),
            volume_mode: VolumeMode::Block,
            fs_type: String::new(),
        }
    }

    pub fn filesystem(fs_type: &str) -> Self {
        Self {
            name: format!("Dynamic PV ({})", fs_type),
            volume_mode: VolumeMode::Filesystem,
            fs_type: fs_type.to_string(),
        }
    }

    pub fn defaults() -> Vec<Self> {
        vec![Self::default_fs(), Self::block(), Self::filesystem("ntfs")]
    }
}

impl FromStr for TestPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" => Err(Error::Configuration("empty test pattern".into())),
            "default" | "default-fs" => Ok(Self::default_fs()),
            "block" => Ok(Self::block()),
            fs_type => Ok(Self::filesystem(fs_type)),
        }
    }
}

// =============================================================================
// Reports
// =============================================================================

/// How a scenario ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Skipped { reason: String },
    Failed { class: String, message: String },
}

impl Outcome {
    pub fn failed(err: &Error) -> Self {
        Outcome::Failed {
            class: err.class().to_string(),
            message: err.to_string(),
        }
    }

    /// Metrics label: `passed`, `skipped` or the error class
    pub fn label(&self) -> String {
        match self {
            Outcome::Passed => "passed".to_string(),
            Outcome::Skipped { .. } => "skipped".to_string(),
            Outcome::Failed { class, .. } => class.clone(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Outcome::Failed { .. })
    }
}

/// Result of one scenario under one pattern
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub scenario: String,
    pub pattern: String,
    pub namespace: String,
    pub driver: String,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub outcome: Outcome,
}

// =============================================================================
// Suite
// =============================================================================

/// Per-scenario templates, built after the capability checks passed
struct Fixture {
    claim_size: String,
    class: StorageClass,
    claim: PersistentVolumeClaim,
    source_claim: PersistentVolumeClaim,
}

impl Fixture {
    fn spec(&self) -> ProvisioningSpec {
        ProvisioningSpec {
            claim: self.claim.clone(),
            class: Some(self.class.clone()),
            claim_size: self.claim_size.clone(),
            expected_size: self.claim_size.clone(),
            node_selection: NodeSelection::default(),
            check: None,
        }
    }
}

fn with_data_source(spec: &mut ProvisioningSpec, reference: TypedLocalObjectReference) {
    if let Some(claim_spec) = spec.claim.spec.as_mut() {
        claim_spec.data_source = Some(reference);
    }
}

/// Prepare `source`, hand its release to `teardown` and return the reference
async fn prepare_source(
    ctx: &ScenarioContext,
    source: DataSourcePreparerRef,
    content: &str,
    teardown: &Teardown,
) -> Result<TypedLocalObjectReference> {
    info!("preparing a {} data source", source.kind());
    let prepared = source.prepare(ctx, content).await?;
    teardown.absorb(prepared.release);
    Ok(prepared.reference)
}

fn content_check(content: String, selection: NodeSelection) -> PvCheck {
    pv_check(move |ctx, claim| {
        let content = content.clone();
        let selection = selection.clone();
        async move {
            info!("checking whether the created volume has the pre-populated data");
            probe::verify_content(&ctx, &claim, CONTENT_FILE, &content, &selection).await
        }
    })
}

/// Dynamic provisioning scenarios for one driver
pub struct ProvisioningSuite {
    config: RunnerConfig,
    cp: ControlPlaneRef,
    snapshots: Option<SnapshotProviderRef>,
    op_counts: Option<OpCountSourceRef>,
}

impl ProvisioningSuite {
    pub fn new(config: RunnerConfig, cp: ControlPlaneRef) -> Self {
        Self {
            config,
            cp,
            snapshots: None,
            op_counts: None,
        }
    }

    pub fn with_snapshots(mut self, snapshots: SnapshotProviderRef) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_op_counts(mut self, op_counts: OpCountSourceRef) -> Self {
        self.op_counts = Some(op_counts);
        self
    }

    /// Why `scenario` cannot run under `pattern`, if it cannot
    pub fn skip_reason(&self, scenario: Scenario, pattern: &TestPattern) -> Option<String> {
        let driver = &self.config.driver;
        let block = pattern.volume_mode == VolumeMode::Block;

        if block && !driver.has(Capability::Block) {
            return Some(format!("Driver {} doesn't support {} -- skipping", driver.name, pattern.volume_mode));
        }
        if !driver.supports_fs_type(&pattern.fs_type) {
            return Some(format!(
                "Driver {:?} does not support {:?} fs type - skipping",
                driver.name, pattern.fs_type
            ));
        }

        match scenario {
            Scenario::MountOptions if driver.mount_options().is_none() => Some(format!(
                "Driver {:?} does not define supported mount option - skipping",
                driver.name
            )),
            Scenario::MountOptions if block => {
                Some("Block volumes do not support mount options - skipping".to_string())
            }
            Scenario::SnapshotDataSource if !driver.has(Capability::SnapshotDataSource) => Some(format!(
                "Driver {:?} does not support populate data from snapshot - skipping",
                driver.name
            )),
            Scenario::PvcDataSource | Scenario::PvcDataSourceParallel
                if !driver.has(Capability::PvcDataSource) =>
            {
                Some(format!("Driver {:?} does not support cloning - skipping", driver.name))
            }
            Scenario::MultiNode if !driver.has(Capability::MultiNode) => Some(format!(
                "Driver {:?} does not support multi-node access - skipping",
                driver.name
            )),
            Scenario::MultiNode if !driver.has(Capability::Persistence) => Some(format!(
                "Driver {:?} does not provide persistence - skipping",
                driver.name
            )),
            Scenario::WaitForFirstConsumerMultiClaim | Scenario::UnschedulableConsumer if block => {
                Some("Multi-claim consumers mount filesystems only - skipping".to_string())
            }
            _ => None,
        }
    }

    /// Run every scenario under every pattern, one after another
    pub async fn run_all(
        &self,
        scenarios: &[Scenario],
        patterns: &[TestPattern],
        namespace: &str,
    ) -> Vec<ScenarioReport> {
        let mut reports = Vec::with_capacity(scenarios.len() * patterns.len());
        for pattern in patterns {
            for scenario in scenarios {
                reports.push(self.run(*scenario, pattern, namespace).await);
            }
        }
        reports
    }

    /// Run one scenario and report how it ended
    pub async fn run(&self, scenario: Scenario, pattern: &TestPattern, namespace: &str) -> ScenarioReport {
        let started_at = Utc::now();
        let clock = Instant::now();

        let outcome = match self.skip_reason(scenario, pattern) {
            Some(reason) => {
                info!(scenario = %scenario, pattern = %pattern.name, "{}", reason);
                Outcome::Skipped { reason }
            }
            None => {
                info!(scenario = %scenario, pattern = %pattern.name, namespace, "running scenario");
                let ctx = ScenarioContext::new(self.cp.clone(), namespace, &self.config);
                match self.execute_checked(&ctx, scenario, pattern).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(scenario = %scenario, class = %e.class(), "scenario failed: {}", e);
                        Outcome::failed(&e)
                    }
                }
            }
        };

        metrics::record_scenario(scenario.name(), &outcome.label());
        ScenarioReport {
            scenario: scenario.name().to_string(),
            pattern: pattern.name.clone(),
            namespace: namespace.to_string(),
            driver: self.config.driver.name.clone(),
            started_at,
            duration_secs: clock.elapsed().as_secs_f64(),
            outcome,
        }
    }

    /// Execute with the migration counter check around it
    async fn execute_checked(
        &self,
        ctx: &ScenarioContext,
        scenario: Scenario,
        pattern: &TestPattern,
    ) -> Result<Outcome> {
        let migration = match &self.op_counts {
            Some(source) => MigrationOpCheck::start(source.clone(), &ctx.driver).await?,
            None => None,
        };

        let outcome = self.execute(ctx, scenario, pattern).await;

        if let Some(check) = migration {
            match (&outcome, check.validate().await) {
                (Ok(_), Err(e)) => return Err(e),
                (Err(_), Err(e)) => warn!("migration op count check failed as well: {}", e),
                _ => {}
            }
        }
        outcome
    }

    async fn execute(&self, ctx: &ScenarioContext, scenario: Scenario, pattern: &TestPattern) -> Result<Outcome> {
        let fixture = self.init(ctx, pattern)?;
        match scenario {
            Scenario::MountOptions => self.mount_options(ctx, fixture).await,
            Scenario::SnapshotDataSource => self.snapshot_data_source(ctx, fixture).await,
            Scenario::PvcDataSource => self.pvc_data_source(ctx, fixture).await,
            Scenario::PvcDataSourceParallel => self.pvc_data_source_parallel(ctx, fixture).await,
            Scenario::MultiNode => self.multi_node(ctx, fixture).await,
            Scenario::WaitForFirstConsumerMultiClaim => self.bind_through_consumer(ctx, fixture, false).await,
            Scenario::UnschedulableConsumer => self.bind_through_consumer(ctx, fixture, true).await,
            Scenario::ReclaimRetain => self.reclaim_retain(ctx, fixture).await,
        }
    }

    /// Claim size, class and claim templates for a scenario
    fn init(&self, ctx: &ScenarioContext, pattern: &TestPattern) -> Result<Fixture> {
        let suite_range = SizeRange::new(Some(SUITE_MIN_SIZE), None);
        let claim_size = suite_range.intersection(&ctx.driver.supported_size_range)?;

        let class = ctx.driver.dynamic_class(&ctx.namespace, &pattern.fs_type);
        let class_name = class.name_any();
        let claim = claim_template(&ctx.namespace, &claim_size, Some(&class_name), pattern.volume_mode);
        let source_claim = claim_template(&ctx.namespace, &claim_size, Some(&class_name), pattern.volume_mode);
        info!(
            class = %class_name,
            claim_size = %claim_size,
            "In creating storage class object and pvc objects for driver"
        );

        Ok(Fixture {
            claim_size,
            class,
            claim,
            source_claim,
        })
    }

    /// Confine client pods to a topology segment unless a node is pinned
    async fn confine_to_topology(
        &self,
        ctx: &ScenarioContext,
        min_nodes: usize,
    ) -> Result<std::result::Result<ScenarioContext, String>> {
        if ctx.node_selection.name.is_some() {
            return Ok(Ok(ctx.clone()));
        }
        let mut selection = ctx.node_selection.clone();
        match ensure_topology_requirements(ctx.cp.as_ref(), &mut selection, &ctx.driver, min_nodes).await? {
            Placement::Ready => Ok(Ok(ctx.with_node_selection(selection))),
            Placement::Unavailable(reason) => Ok(Err(reason)),
        }
    }

    async fn mount_options(&self, ctx: &ScenarioContext, mut fixture: Fixture) -> Result<Outcome> {
        fixture.class.mount_options = ctx.driver.mount_options();

        with_teardown(ctx, |teardown| async move {
            let (class, release) = ensure_storage_class(ctx, Some(&fixture.class)).await?;
            teardown.absorb(release);

            let mut spec = fixture.spec();
            spec.class = Some(class);
            let selection = ctx.node_selection.clone();
            spec.check = Some(pv_check(move |ctx, claim| {
                let selection = selection.clone();
                async move {
                    probe::write_read_single_node_check(&ctx, &claim, &selection)
                        .await
                        .map(|_| ())
                }
            }));

            claim::test_dynamic_provisioning(ctx, &spec).await?;
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn snapshot_data_source(&self, ctx: &ScenarioContext, fixture: Fixture) -> Result<Outcome> {
        let Some(snapshots) = self.snapshots.clone() else {
            return Err(Error::Configuration(format!(
                "driver {} declares snapshotDataSource but no snapshot provider is configured",
                ctx.driver.name
            )));
        };

        with_teardown(ctx, |teardown| async move {
            let content = namespace_greeting(&ctx.namespace);
            let source = Arc::new(SnapshotSource {
                source: fixture.source_claim.clone(),
                class: fixture.class.clone(),
                snapshots,
            });
            let reference = prepare_source(ctx, source, &content, &teardown).await?;

            let mut spec = fixture.spec();
            with_data_source(&mut spec, reference);
            spec.check = Some(content_check(content, ctx.node_selection.clone()));

            claim::test_dynamic_provisioning(ctx, &spec).await?;
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn pvc_data_source(&self, ctx: &ScenarioContext, fixture: Fixture) -> Result<Outcome> {
        // Some drivers can't clone across topology segments
        let ctx = match self.confine_to_topology(ctx, 1).await? {
            Ok(ctx) => ctx,
            Err(reason) => return Ok(Outcome::Skipped { reason }),
        };
        let ctx = &ctx;

        with_teardown(ctx, |teardown| async move {
            let content = namespace_greeting(&ctx.namespace);
            let source = Arc::new(ClaimCloneSource {
                source: fixture.source_claim.clone(),
                class: fixture.class.clone(),
            });
            let reference = prepare_source(ctx, source, &content, &teardown).await?;

            let mut spec = fixture.spec();
            with_data_source(&mut spec, reference);
            spec.node_selection = ctx.node_selection.clone();
            spec.check = Some(content_check(content, ctx.node_selection.clone()));

            claim::test_dynamic_provisioning(ctx, &spec).await?;
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn pvc_data_source_parallel(&self, ctx: &ScenarioContext, fixture: Fixture) -> Result<Outcome> {
        let ctx = match self.confine_to_topology(ctx, 1).await? {
            Ok(ctx) => ctx,
            Err(reason) => return Ok(Outcome::Skipped { reason }),
        };
        let ctx = &ctx;
        let clones = self.config.parallel_clones;

        with_teardown(ctx, |teardown| async move {
            let content = namespace_greeting(&ctx.namespace);
            let source = Arc::new(ClaimCloneSource {
                source: fixture.source_claim.clone(),
                class: fixture.class.clone(),
            });
            let reference = prepare_source(ctx, source, &content, &teardown).await?;

            let mut spec = fixture.spec();
            with_data_source(&mut spec, reference);
            spec.node_selection = ctx.node_selection.clone();

            let volumes = parallel::clone_in_parallel(ctx, &spec, clones, &content).await?;
            info!("{} clones provisioned from one source", volumes.len());
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn multi_node(&self, ctx: &ScenarioContext, fixture: Fixture) -> Result<Outcome> {
        if ctx.node_selection.name.is_some() {
            return Ok(Outcome::Skipped {
                reason: "client pods are pinned to a single node".to_string(),
            });
        }
        let ctx = match self.confine_to_topology(ctx, 2).await? {
            Ok(ctx) => ctx,
            Err(reason) => return Ok(Outcome::Skipped { reason }),
        };
        let ctx = &ctx;

        with_teardown(ctx, |teardown| async move {
            let (class, release) = ensure_storage_class(ctx, Some(&fixture.class)).await?;
            teardown.absorb(release);

            let mut spec = fixture.spec();
            spec.class = Some(class);
            spec.node_selection = ctx.node_selection.clone();
            let selection = ctx.node_selection.clone();
            spec.check = Some(pv_check(move |ctx, claim| {
                let selection = selection.clone();
                async move { probe::multi_node_check(&ctx, &claim, &selection).await }
            }));

            claim::test_dynamic_provisioning(ctx, &spec).await?;
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn bind_through_consumer(
        &self,
        ctx: &ScenarioContext,
        mut fixture: Fixture,
        expect_unschedulable: bool,
    ) -> Result<Outcome> {
        fixture.class.volume_binding_mode = Some("WaitForFirstConsumer".to_string());

        with_teardown(ctx, |teardown| async move {
            let (_, release) = ensure_storage_class(ctx, Some(&fixture.class)).await?;
            teardown.absorb(release);

            let claims: Vec<PersistentVolumeClaim> =
                (0..MULTI_CLAIM_COUNT).map(|_| fixture.claim.clone()).collect();
            let selector = BTreeMap::from([(
                UNSATISFIABLE_LABEL.0.to_string(),
                UNSATISFIABLE_LABEL.1.to_string(),
            )]);

            let outcome = scheduling::bind_many(ctx, &claims, &selector, expect_unschedulable).await?;
            if expect_unschedulable {
                if !outcome.volumes.is_empty() {
                    return Err(Error::mismatch(
                        &ctx.namespace,
                        "bound volumes",
                        0,
                        outcome.volumes.len(),
                    ));
                }
                return Ok(Outcome::Passed);
            }

            let node = outcome.node.map(|n| n.name_any()).unwrap_or_default();
            info!("{} claims bound through one consumer on node {}", outcome.volumes.len(), node);
            Ok(Outcome::Passed)
        })
        .await
    }

    async fn reclaim_retain(&self, ctx: &ScenarioContext, mut fixture: Fixture) -> Result<Outcome> {
        fixture.class.reclaim_policy = Some(ReclaimPolicy::Retain.to_string());

        with_teardown(ctx, |teardown| async move {
            let (class, release) = ensure_storage_class(ctx, Some(&fixture.class)).await?;
            teardown.absorb(release);

            let mut spec = fixture.spec();
            spec.class = Some(class);
            let volume = claim::test_dynamic_provisioning(ctx, &spec).await?.ok_or_else(|| {
                Error::mismatch(&ctx.namespace, "provisioned volume", "a volume", "none")
            })?;
            let name = volume.name_any();
            teardown.push(Release::Volume { name: name.clone() });

            // Claim is gone; a retained volume must not be
            let retained = ctx.cp.get_volume(&name).await.map_err(|e| {
                if e.is_not_found() {
                    Error::mismatch(&name, "retained volume", "present after claim deletion", "deleted")
                } else {
                    e
                }
            })?;
            let policy = ReclaimPolicy::of_volume(&retained)?;
            if policy != Some(ReclaimPolicy::Retain) {
                return Err(Error::mismatch(
                    qualified_name(&retained),
                    "reclaim policy",
                    ReclaimPolicy::Retain,
                    policy.map(|p| p.to_string()).unwrap_or_else(|| "unset".to_string()),
                ));
            }
            Ok(Outcome::Passed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::driver::{CapabilitySet, DriverDescriptor};
    use crate::domain::ports::{OpCountSource, OpCounts};
    use crate::platform::simulated::SimulatedCluster;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    const NS: &str = "suite";

    fn capable_driver() -> DriverDescriptor {
        let mut driver = DriverDescriptor::new("csi.example.com");
        driver.capabilities = CapabilitySet::new([
            Capability::Persistence,
            Capability::Block,
            Capability::PvcDataSource,
            Capability::SnapshotDataSource,
            Capability::MultiNode,
        ]);
        driver.supported_mount_options = BTreeSet::from(["debug".to_string()]);
        driver
    }

    fn suite(cluster: &SimulatedCluster, driver: DriverDescriptor) -> ProvisioningSuite {
        ProvisioningSuite::new(RunnerConfig::new(driver), cluster.handle())
    }

    async fn run(suite: &ProvisioningSuite, scenario: Scenario) -> Outcome {
        suite.run(scenario, &TestPattern::default_fs(), NS).await.outcome
    }

    #[test]
    fn test_scenario_names_round_trip() {
        for scenario in Scenario::ALL {
            assert_eq!(scenario.name().parse::<Scenario>().unwrap(), scenario);
        }
        assert!("everything".parse::<Scenario>().is_err());
        assert_eq!("block".parse::<TestPattern>().unwrap(), TestPattern::block());
        assert_eq!("xfs".parse::<TestPattern>().unwrap().fs_type, "xfs");
    }

    #[test]
    fn test_capability_gating() {
        let cluster = SimulatedCluster::new();
        let suite = suite(&cluster, DriverDescriptor::new("csi.example.com"));
        let fs = TestPattern::default_fs();

        assert!(suite.skip_reason(Scenario::MountOptions, &fs).unwrap().contains("mount option"));
        assert!(suite.skip_reason(Scenario::PvcDataSource, &fs).unwrap().contains("cloning"));
        assert!(suite.skip_reason(Scenario::SnapshotDataSource, &fs).is_some());
        assert!(suite
            .skip_reason(Scenario::ReclaimRetain, &TestPattern::block())
            .unwrap()
            .contains("Block"));
        assert!(suite
            .skip_reason(Scenario::ReclaimRetain, &TestPattern::filesystem("ntfs"))
            .unwrap()
            .contains("ntfs"));
        assert!(suite.skip_reason(Scenario::ReclaimRetain, &fs).is_none());

        let capable = self::suite(&cluster, capable_driver());
        assert!(capable
            .skip_reason(Scenario::MountOptions, &TestPattern::block())
            .unwrap()
            .contains("Block volumes"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prepared_source_is_released_with_the_scenario() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let config = RunnerConfig::new(capable_driver());
        let ctx = ScenarioContext::new(cluster.handle(), NS, &config);
        let class = ctx.driver.dynamic_class(NS, "");
        let source = Arc::new(ClaimCloneSource {
            source: claim_template(NS, "1Gi", Some(&class.name_any()), VolumeMode::Filesystem),
            class,
        });

        let teardown = Teardown::new();
        let reference = prepare_source(&ctx, source, "payload", &teardown).await.unwrap();
        assert_eq!(reference.kind, "PersistentVolumeClaim");
        assert_eq!(teardown.len(), 2);

        teardown.run(&ctx).await.unwrap();
        assert_eq!(cluster.claim_count(), 0);
        assert_eq!(cluster.class_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_options_scenario() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let suite = suite(&cluster, capable_driver());

        let report = suite.run(Scenario::MountOptions, &TestPattern::default_fs(), NS).await;
        assert_eq!(report.outcome, Outcome::Passed);
        assert_eq!(report.scenario, "mount-options");
        assert_eq!(cluster.claim_count(), 0);
        assert_eq!(cluster.pod_count(), 0);
        assert_eq!(cluster.class_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_options_not_applied_fails() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        cluster.faults().drop_mount_options(true);
        let suite = suite(&cluster, capable_driver());

        assert_eq!(
            run(&suite, Scenario::MountOptions).await.label(),
            crate::error::ErrorClass::Workload.to_string()
        );
        assert_eq!(cluster.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clone_scenarios() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        let suite = suite(&cluster, capable_driver());

        assert_eq!(run(&suite, Scenario::PvcDataSource).await, Outcome::Passed);
        assert_eq!(run(&suite, Scenario::PvcDataSourceParallel).await, Outcome::Passed);
        assert_eq!(cluster.claim_count(), 0);
        assert_eq!(cluster.volume_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_scenario_needs_provider() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let without = suite(&cluster, capable_driver());
        assert!(matches!(
            run(&without, Scenario::SnapshotDataSource).await,
            Outcome::Failed { ref class, .. } if class == "configuration"
        ));

        let with = suite(&cluster, capable_driver()).with_snapshots(Arc::new(cluster.clone()));
        assert_eq!(run(&with, Scenario::SnapshotDataSource).await, Outcome::Passed);
        assert_eq!(cluster.claim_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_node_needs_two_nodes() {
        let single = SimulatedCluster::new().with_nodes(["node-a"]);
        assert!(matches!(
            run(&suite(&single, capable_driver()), Scenario::MultiNode).await,
            Outcome::Skipped { .. }
        ));

        let pair = SimulatedCluster::new().with_nodes(["node-a", "node-b"]);
        assert_eq!(run(&suite(&pair, capable_driver()), Scenario::MultiNode).await, Outcome::Passed);
        assert_eq!(pair.nodes_that_ran("pvc-").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consumer_scenarios() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let suite = suite(&cluster, capable_driver());

        assert_eq!(run(&suite, Scenario::WaitForFirstConsumerMultiClaim).await, Outcome::Passed);
        assert_eq!(run(&suite, Scenario::UnschedulableConsumer).await, Outcome::Passed);
        assert_eq!(cluster.claim_count(), 0);
        assert_eq!(cluster.pod_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reclaim_retain_scenario_cleans_up_volume() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let suite = suite(&cluster, capable_driver());

        assert_eq!(run(&suite, Scenario::ReclaimRetain).await, Outcome::Passed);
        assert_eq!(cluster.volume_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_size_range_is_configuration_failure() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let mut driver = capable_driver();
        driver.supported_size_range = SizeRange::new(None, Some("512Ki"));

        assert!(matches!(
            run(&suite(&cluster, driver), Scenario::ReclaimRetain).await,
            Outcome::Failed { ref class, .. } if class == "configuration"
        ));
        assert_eq!(cluster.claim_count(), 0);
    }

    struct GrowingLegacyCounts(Mutex<u64>);

    #[async_trait]
    impl OpCountSource for GrowingLegacyCounts {
        async fn snapshot(&self, _plugin: &str) -> Result<OpCounts> {
            let mut legacy = self.0.lock();
            *legacy += 1;
            Ok(OpCounts {
                legacy: *legacy,
                migrated: 0,
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_migration_violation_fails_passing_scenario() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let mut driver = capable_driver();
        driver.in_tree_plugin_name = Some("kubernetes.io/gce-pd".into());
        driver.migrated = true;
        let suite = suite(&cluster, driver).with_op_counts(Arc::new(GrowingLegacyCounts(Mutex::new(0))));

        assert!(matches!(
            run(&suite, Scenario::ReclaimRetain).await,
            Outcome::Failed { ref class, .. } if class == "invariant"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_all_reports_every_combination() {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let suite = suite(&cluster, DriverDescriptor::new("csi.example.com"));

        let reports = suite
            .run_all(
                &[Scenario::ReclaimRetain, Scenario::PvcDataSource],
                &[TestPattern::default_fs(), TestPattern::block()],
                NS,
            )
            .await;
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[0].outcome, Outcome::Passed);
        assert!(matches!(reports[1].outcome, Outcome::Skipped { .. }));
        assert!(reports[2..].iter().all(|r| matches!(r.outcome, Outcome::Skipped { .. })));

        let json = serde_json::to_value(&reports[0]).unwrap();
        assert_eq!(json["outcome"]["result"], "passed");
        assert_eq!(json["scenario"], "reclaim-retain");
    }
}
