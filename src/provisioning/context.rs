//! Per-scenario context
//!
//! Built fresh at the start of every scenario and passed by reference
//! through the workflow. Nothing in here outlives the scenario.

use crate::config::{RunnerConfig, TimeoutBudget};
use crate::domain::driver::{DriverDescriptor, PlatformTraits};
use crate::domain::ports::ControlPlaneRef;
use crate::domain::types::NodeSelection;
use std::sync::Arc;

/// Everything a workflow needs to talk to the cluster
#[derive(Clone)]
pub struct ScenarioContext {
    /// Control plane handle
    pub cp: ControlPlaneRef,
    /// Namespace all namespaced objects go into
    pub namespace: String,
    /// Poll interval and budgets
    pub timeouts: TimeoutBudget,
    /// Driver under test
    pub driver: Arc<DriverDescriptor>,
    /// Node platform traits
    pub platform: PlatformTraits,
    /// Image for verification pods
    pub test_image: String,
    /// Name prefix for pods this context creates
    pub prefix: String,
    /// Placement for client pods
    pub node_selection: NodeSelection,
}

impl ScenarioContext {
    pub fn new(cp: ControlPlaneRef, namespace: impl Into<String>, config: &RunnerConfig) -> Self {
        let namespace = namespace.into();
        Self {
            cp,
            prefix: "provisioning".to_string(),
            namespace,
            timeouts: config.timeouts,
            driver: Arc::new(config.driver.clone()),
            platform: config.platform,
            test_image: config.test_image.clone(),
            node_selection: config.node_selection.clone(),
        }
    }

    /// Copy of this context for the `index`-th concurrent unit of work.
    ///
    /// The derived prefix keeps pod names of sibling units disjoint.
    pub fn child(&self, index: usize) -> Self {
        let mut child = self.clone();
        child.prefix = format!("{}-{}", self.prefix, index);
        child
    }

    pub fn with_node_selection(&self, selection: NodeSelection) -> Self {
        let mut ctx = self.clone();
        ctx.node_selection = selection;
        ctx
    }

    /// Pod name prefix scoped to this context
    pub fn pod_prefix(&self, role: &str) -> String {
        format!("{}-{}", self.prefix, role)
    }
}

impl std::fmt::Debug for ScenarioContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioContext")
            .field("namespace", &self.namespace)
            .field("driver", &self.driver.name)
            .field("prefix", &self.prefix)
            .finish()
    }
}
