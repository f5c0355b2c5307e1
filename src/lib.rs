//! Storage Conformance - Dynamic Provisioning Conformance Engine
//!
//! Drives a Kubernetes storage driver through dynamic provisioning end to
//! end and checks that what comes back matches what was asked for: size,
//! access modes, reclaim policy, mount options, binding mode and data
//! population. A secondary check verifies an HTTP router keeps serving its
//! routes under configuration churn.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Provisioning Suite                                  │
//! │        (capability gating, test patterns, scenario reports)                  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │  Storage Class  │  │ Claim Lifecycle │  │    Data-Integrity Probe     │  │
//! │  │   Provisioner   │  │     Engine      │  │  (single / multi node)      │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           │                    │                         │                   │
//! │  ┌────────┴────────┐  ┌────────┴────────┐  ┌─────────────┴───────────────┐  │
//! │  │    Capacity     │  │ Volume Property │  │   Multi-Claim Scheduling    │  │
//! │  │   Reconciler    │  │    Verifier     │  │          Probe              │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! │                                                                              │
//! │                    ┌───────────────────────┐                                │
//! │                    │ Teardown Coordinator  │                                │
//! │                    │   (LIFO release)      │                                │
//! │                    └───────────────────────┘                                │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Control Plane Port                                  │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │     Kubernetes API          │  │        Simulated Cluster            │   │
//! │  │   (kube::Client)            │  │   (in-memory, dry runs & tests)     │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`provisioning`]: the provisioning workflows and scenario suite
//! - [`platform`]: live and simulated control plane adapters
//! - [`router`]: router route-churn verification
//! - [`capacity`]: capacity parsing and size range reconciliation
//! - [`domain`]: core domain types and ports
//! - [`config`]: runner configuration
//! - [`error`]: error types and classification

pub mod capacity;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod platform;
pub mod provisioning;
pub mod router;

// Re-export commonly used types
pub use capacity::{capacity_equal, parse_quantity, SizeRange};

pub use config::{RunnerConfig, TimeoutBudget};

pub use domain::driver::{Capability, CapabilitySet, DriverDescriptor, PlatformTraits};

pub use domain::ports::{
    ControlPlane, ControlPlaneRef, DataSourcePreparer, OpCountSource, OpCounts, PreparedDataSource,
    SnapshotProvider, TakenSnapshot,
};

pub use error::{Error, ErrorClass, Result};

pub use platform::{KubeControlPlane, KubeSnapshotProvider, SimulatedCluster};

pub use provisioning::{
    Outcome, ProvisioningSpec, ProvisioningSuite, Scenario, ScenarioContext, ScenarioReport, Teardown,
    TestPattern,
};

pub use router::{HttpRouteProber, KubeRouteAdmin, RouteTarget, RouterChurnScenario, RouterConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
