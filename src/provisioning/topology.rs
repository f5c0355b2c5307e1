//! Topology readiness
//!
//! Some drivers only clone or attach within one topology segment, such as
//! a cloud availability zone. Before those scenarios run, client pods are
//! confined to the first segment with enough ready nodes.

use crate::domain::driver::{Capability, DriverDescriptor};
use crate::domain::ports::ControlPlane;
use crate::domain::types::NodeSelection;
use crate::error::Result;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Whether a scenario can be placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// The selection was updated (or needed no update)
    Ready,
    /// Not enough nodes; the scenario should be skipped
    Unavailable(String),
}

/// Ready and not cordoned
pub fn is_ready_schedulable(node: &Node) -> bool {
    let cordoned = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);
    ready && !cordoned
}

/// Confine `selection` to a topology segment holding `min_count` ready nodes.
///
/// Drivers without the topology capability, or without topology keys, only
/// need `min_count` ready nodes overall.
/// Nodes missing any of the keys belong to no segment.
pub async fn ensure_topology_requirements(
    cp: &dyn ControlPlane,
    selection: &mut NodeSelection,
    driver: &DriverDescriptor,
    min_count: usize,
) -> Result<Placement> {
    let nodes: Vec<Node> = cp
        .list_nodes()
        .await?
        .into_iter()
        .filter(is_ready_schedulable)
        .collect();
    if nodes.len() < min_count {
        return Ok(Placement::Unavailable(format!(
            "the test requires {} schedulable nodes, got only {}",
            min_count,
            nodes.len()
        )));
    }

    if !driver.has(Capability::Topology) || driver.topology_keys.is_empty() {
        return Ok(Placement::Ready);
    }

    let mut segments: BTreeMap<BTreeMap<String, String>, usize> = BTreeMap::new();
    for node in &nodes {
        let labels = node.labels();
        let segment: Option<BTreeMap<String, String>> = driver
            .topology_keys
            .iter()
            .map(|key| labels.get(key).map(|value| (key.clone(), value.clone())))
            .collect();
        match segment {
            Some(segment) => *segments.entry(segment).or_default() += 1,
            None => debug!("node {} carries no complete topology segment", node.name_any()),
        }
    }

    match segments.into_iter().find(|(_, count)| *count >= min_count) {
        Some((segment, count)) => {
            info!(?segment, nodes = count, "confining client pods to topology segment");
            selection.set_topology_requirement(&segment);
            Ok(Placement::Ready)
        }
        None => Ok(Placement::Unavailable(format!(
            "no topology segment with at least {} nodes found",
            min_count
        ))),
    }
}
