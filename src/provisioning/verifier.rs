//! Volume Property Verifier
//!
//! Checks a bound volume against the claim that requested it and the class
//! it was provisioned from. Every mismatch is an invariant violation naming
//! the check, the expected value and the observed one.

use crate::capacity::capacity_equal;
use crate::domain::types::{qualified_name, AccessMode, ReclaimPolicy, STORAGE_RESOURCE};
use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

/// What a provisioned volume is checked against
#[derive(Debug, Clone, Copy)]
pub struct Expectations<'a> {
    /// Size the claim asked for
    pub claim_size: &'a str,
    /// Size the volume must report
    pub expected_size: &'a str,
    /// Class the claim was provisioned from; `None` for the cluster default
    pub class: Option<&'a StorageClass>,
}

fn storage_quantity(resources: Option<&BTreeMap<String, Quantity>>) -> Option<&str> {
    resources
        .and_then(|r| r.get(STORAGE_RESOURCE))
        .map(|q| q.0.as_str())
}

fn joined<T: std::fmt::Display>(values: impl IntoIterator<Item = T>) -> String {
    let values: Vec<String> = values.into_iter().map(|v| v.to_string()).collect();
    format!("[{}]", values.join(","))
}

fn access_modes(modes: Option<&Vec<String>>) -> Result<BTreeSet<AccessMode>> {
    modes.into_iter().flatten().map(|m| m.parse()).collect()
}

/// Verify `volume`, bound to `claim`, against `expect`
pub fn verify_volume(
    claim: &PersistentVolumeClaim,
    volume: &PersistentVolume,
    expect: Expectations<'_>,
) -> Result<()> {
    let subject = format!("volume {} for claim {}", volume.name_any(), qualified_name(claim));
    info!("checking the claim and its volume {}", volume.name_any());

    let claim_spec = claim.spec.clone().unwrap_or_default();
    let volume_spec = volume.spec.clone().unwrap_or_default();

    // Sizes
    let volume_capacity = storage_quantity(volume_spec.capacity.as_ref()).unwrap_or("0");
    if !capacity_equal(volume_capacity, expect.expected_size)? {
        return Err(Error::mismatch(&subject, "volume capacity", expect.expected_size, volume_capacity));
    }

    let requested = storage_quantity(
        claim_spec
            .resources
            .as_ref()
            .and_then(|r| r.requests.as_ref()),
    )
    .unwrap_or("0");
    if !capacity_equal(requested, expect.claim_size)? {
        return Err(Error::mismatch(&subject, "claim request", expect.claim_size, requested));
    }

    // Access modes: non-empty and a subset of the claim's
    let volume_modes = access_modes(volume_spec.access_modes.as_ref())?;
    let claim_modes = access_modes(claim_spec.access_modes.as_ref())?;
    if volume_modes.is_empty() {
        return Err(Error::mismatch(&subject, "access modes", "at least one", "none"));
    }
    if let Some(extra) = volume_modes.difference(&claim_modes).next() {
        return Err(Error::mismatch(
            &subject,
            "access modes",
            format!("subset of {}", joined(&claim_modes)),
            format!("{} includes {}", joined(&volume_modes), extra),
        ));
    }

    // Back-reference
    let claim_ref = volume_spec.claim_ref.clone().unwrap_or_default();
    let ref_identity = format!(
        "{}/{}",
        claim_ref.namespace.unwrap_or_default(),
        claim_ref.name.unwrap_or_default()
    );
    if ref_identity != qualified_name(claim) {
        return Err(Error::mismatch(&subject, "claim reference", qualified_name(claim), ref_identity));
    }

    // Reclaim policy and mount options
    let expected_policy = match expect.class {
        Some(class) => ReclaimPolicy::of_class(class)?,
        None => ReclaimPolicy::Delete,
    };
    let actual_policy = ReclaimPolicy::of_volume(volume)?;
    if actual_policy != Some(expected_policy) {
        return Err(Error::mismatch(
            &subject,
            "reclaim policy",
            expected_policy,
            actual_policy.map(|p| p.to_string()).unwrap_or_else(|| "unset".into()),
        ));
    }

    if let Some(class) = expect.class {
        let want = class.mount_options.clone().unwrap_or_default();
        let got = volume_spec.mount_options.clone().unwrap_or_default();
        if want != got {
            return Err(Error::mismatch(&subject, "mount options", joined(&want), joined(&got)));
        }
    }

    // Volume mode, only when the claim asked for one
    if let Some(want) = claim_spec.volume_mode.as_deref() {
        match volume_spec.volume_mode.as_deref() {
            Some(got) if got == want => {}
            got => {
                return Err(Error::mismatch(&subject, "volume mode", want, got.unwrap_or("unset")));
            }
        }
    }

    Ok(())
}
