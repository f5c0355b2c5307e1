//! Provisioning engine
//!
//! Drives dynamic provisioning end to end: storage class setup, claim
//! binding, volume verification, data probes and scheduling checks. Every
//! workflow registers what it creates on a [`Teardown`] so scenarios leave
//! the cluster as they found it.
//!
//! # Modules
//!
//! - [`storage_class`]: create-or-reuse of the class under test
//! - [`claim`]: the claim lifecycle and its deferred cleanup
//! - [`verifier`]: bound volume property checks
//! - [`probe`]: write/read and cross-node data probes
//! - [`scheduling`]: delayed binding through a single consumer
//! - [`datasource`]: clone and snapshot population sources
//! - [`parallel`]: concurrent clone fan-out
//! - [`suite`]: capability-gated scenario entry points

pub mod claim;
pub mod context;
pub mod datasource;
pub mod migration;
pub mod parallel;
pub mod probe;
pub mod scheduling;
pub mod storage_class;
pub mod suite;
pub mod teardown;
pub mod topology;
pub mod verifier;
pub mod wait;
pub mod workload;

pub use claim::{bound_volume, claim_template, test_dynamic_provisioning, LifecycleState, ProvisioningSpec};
pub use context::ScenarioContext;
pub use datasource::{ClaimCloneSource, SnapshotSource};
pub use migration::{MetricsEndpointOpCounts, MigrationOpCheck};
pub use parallel::clone_in_parallel;
pub use scheduling::{bind_many, BindOutcome};
pub use storage_class::ensure_storage_class;
pub use suite::{Outcome, ProvisioningSuite, Scenario, ScenarioReport, TestPattern};
pub use teardown::{with_teardown, Release, Teardown};
pub use verifier::{verify_volume, Expectations};
pub use workload::{ProbeScript, WorkloadPod};
