//! Runner configuration
//!
//! Timeout budgets, the driver under test and platform traits. Everything
//! can come from a YAML file; unset fields fall back to the usual
//! Kubernetes e2e defaults.

use crate::domain::driver::{DriverDescriptor, PlatformTraits};
use crate::domain::types::NodeSelection;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Image used by every verification pod
pub const DEFAULT_TEST_IMAGE: &str = "registry.k8s.io/e2e-test-images/busybox:1.29-4";

// =============================================================================
// Timeout Budget
// =============================================================================

/// Poll interval and timeout budgets for every bounded wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutBudget {
    /// Interval between polls
    pub poll_secs: u64,
    /// Claim reaching Bound
    pub claim_provision_secs: u64,
    /// Window in which unconsumed claims must stay Pending
    pub claim_provision_short_secs: u64,
    /// Pod start
    pub pod_start_secs: u64,
    /// Pod start when the volume attach is slow
    pub pod_start_slow_secs: u64,
    /// Pod removal
    pub pod_delete_secs: u64,
    /// Volume removal
    pub pv_delete_secs: u64,
    /// Volume removal tolerating attach/detach races
    pub pv_delete_slow_secs: u64,
}

impl Default for TimeoutBudget {
    fn default() -> Self {
        Self {
            poll_secs: 2,
            claim_provision_secs: 5 * 60,
            claim_provision_short_secs: 60,
            pod_start_secs: 5 * 60,
            pod_start_slow_secs: 15 * 60,
            pod_delete_secs: 5 * 60,
            pv_delete_secs: 5 * 60,
            pv_delete_slow_secs: 20 * 60,
        }
    }
}

impl TimeoutBudget {
    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn claim_provision(&self) -> Duration {
        Duration::from_secs(self.claim_provision_secs)
    }

    pub fn claim_provision_short(&self) -> Duration {
        Duration::from_secs(self.claim_provision_short_secs)
    }

    pub fn pod_start(&self) -> Duration {
        Duration::from_secs(self.pod_start_secs)
    }

    pub fn pod_start_slow(&self) -> Duration {
        Duration::from_secs(self.pod_start_slow_secs)
    }

    pub fn pod_delete(&self) -> Duration {
        Duration::from_secs(self.pod_delete_secs)
    }

    pub fn pv_delete(&self) -> Duration {
        Duration::from_secs(self.pv_delete_secs)
    }

    pub fn pv_delete_slow(&self) -> Duration {
        Duration::from_secs(self.pv_delete_slow_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_secs == 0 {
            return Err(Error::Configuration("poll interval must be positive".into()));
        }
        let budgets = [
            ("claimProvisionSecs", self.claim_provision_secs),
            ("claimProvisionShortSecs", self.claim_provision_short_secs),
            ("podStartSecs", self.pod_start_secs),
            ("podStartSlowSecs", self.pod_start_slow_secs),
            ("podDeleteSecs", self.pod_delete_secs),
            ("pvDeleteSecs", self.pv_delete_secs),
            ("pvDeleteSlowSecs", self.pv_delete_slow_secs),
        ];
        for (name, secs) in budgets {
            if secs < self.poll_secs {
                return Err(Error::Configuration(format!(
                    "{} ({}s) is shorter than the poll interval ({}s)",
                    name, secs, self.poll_secs
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Runner Configuration
// =============================================================================

/// Top-level configuration for a conformance run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    /// Driver under test
    pub driver: DriverDescriptor,
    /// Timeout budgets
    #[serde(default)]
    pub timeouts: TimeoutBudget,
    /// Node platform traits
    #[serde(default)]
    pub platform: PlatformTraits,
    /// Image for verification pods
    #[serde(default = "default_image")]
    pub test_image: String,
    /// Number of concurrent clones in the parallel scenario
    #[serde(default = "default_parallel_clones")]
    pub parallel_clones: usize,
    /// Where client pods may run
    #[serde(default)]
    pub node_selection: NodeSelection,
}

fn default_image() -> String {
    DEFAULT_TEST_IMAGE.to_string()
}

fn default_parallel_clones() -> usize {
    5
}

impl RunnerConfig {
    pub fn new(driver: DriverDescriptor) -> Self {
        Self {
            driver,
            timeouts: TimeoutBudget::default(),
            platform: PlatformTraits::default(),
            test_image: default_image(),
            parallel_clones: default_parallel_clones(),
            node_selection: NodeSelection::default(),
        }
    }

    /// Load and validate a YAML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: RunnerConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.name.is_empty() {
            return Err(Error::Configuration("driver name is required".into()));
        }
        if self.parallel_clones == 0 {
            return Err(Error::Configuration("parallelClones must be positive".into()));
        }
        self.driver.supported_size_range.bounds()?;
        self.timeouts.validate()
    }
}
