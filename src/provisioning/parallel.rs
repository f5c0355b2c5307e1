//! Parallel clone fan-out
//!
//! Runs several independent provisioning tests against the same data
//! source. Every task gets its own context prefix; all tasks are joined
//! before anything is reported.

use crate::error::{Error, Result};
use crate::provisioning::claim::{self, pv_check, ProvisioningSpec};
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::datasource::CONTENT_FILE;
use crate::provisioning::probe;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use std::collections::BTreeSet;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Provision `count` clones of `spec`'s data source concurrently.
///
/// Each clone is checked for `expected_content`. Returns the clones'
/// volumes in task order. Task failures are collected into
/// `Error::Parallel`; a panicking task is re-raised after the join.
pub async fn clone_in_parallel(
    ctx: &ScenarioContext,
    spec: &ProvisioningSpec,
    count: usize,
    expected_content: &str,
) -> Result<Vec<PersistentVolume>> {
    let mut tasks = JoinSet::new();

    for index in 0..count {
        let task_ctx = ctx.child(index);
        let mut task_spec = spec.clone();
        let content = expected_content.to_string();
        let selection = spec.node_selection.clone();
        task_spec.check = Some(pv_check(move |ctx, claim| {
            let content = content.clone();
            let selection = selection.clone();
            async move {
                info!("checking whether the created volume {} has the pre-populated data", index);
                probe::verify_content(&ctx, &claim, CONTENT_FILE, &content, &selection).await
            }
        }));

        tasks.spawn(async move {
            info!("Cloning volume nr. {}", index);
            let volume = claim::test_dynamic_provisioning(&task_ctx, &task_spec).await;
            (index, volume)
        });
    }

    let mut volumes: Vec<Option<PersistentVolume>> = vec![None; count];
    let mut failures = Vec::new();
    let mut panicked = None;

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Ok(volume))) => volumes[index] = volume,
            Ok((index, Err(e))) => {
                error!("clone {} failed: {}", index, e);
                failures.push(format!("clone {}: {}", index, e));
            }
            Err(join_err) if join_err.is_panic() => {
                // Keep joining the rest before re-raising
                if panicked.is_none() {
                    panicked = Some(join_err.into_panic());
                }
            }
            Err(join_err) => failures.push(format!("clone task: {}", join_err)),
        }
    }

    if let Some(payload) = panicked {
        std::panic::resume_unwind(payload);
    }
    if !failures.is_empty() {
        failures.sort();
        return Err(Error::Parallel {
            total: count,
            failures,
        });
    }

    let volumes: Vec<PersistentVolume> = volumes.into_iter().flatten().collect();
    let distinct: BTreeSet<String> = volumes.iter().map(|v| v.name_any()).collect();
    if distinct.len() != volumes.len() {
        return Err(Error::mismatch(
            &ctx.namespace,
            "distinct clone volumes",
            volumes.len(),
            distinct.len(),
        ));
    }
    Ok(volumes)
}
