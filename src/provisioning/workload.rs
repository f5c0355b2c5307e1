//! Verification workloads
//!
//! Short-lived pods that mount a single claim and run a shell probe against
//! it. Filesystem volumes are mounted at [`MOUNT_PATH`]; block volumes are
//! attached as a raw device at the same path.

use crate::domain::types::{NodeSelection, VolumeMode};
use crate::error::Result;
use crate::provisioning::context::ScenarioContext;
use crate::provisioning::teardown;
use crate::provisioning::wait;
use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeDevice, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::info;

pub const MOUNT_PATH: &str = "/mnt/test";
pub const VOLUME_NAME: &str = "my-volume";
pub const CONTAINER_NAME: &str = "volume-tester";

// =============================================================================
// Probe Script
// =============================================================================

/// What a workload pod does with its volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeScript {
    /// Write `content` into `file`
    Write { file: String, content: String },
    /// Check `file` holds `content` and the volume carries `mount_options`
    Verify {
        file: String,
        content: String,
        mount_options: Vec<String>,
    },
    /// Exit right away; used to make the scheduler pick a node
    Noop,
    /// Sleep until deleted
    Hold,
}

impl ProbeScript {
    pub fn write(file: &str, content: &str) -> Self {
        ProbeScript::Write {
            file: file.to_string(),
            content: content.to_string(),
        }
    }

    pub fn verify(file: &str, content: &str) -> Self {
        ProbeScript::Verify {
            file: file.to_string(),
            content: content.to_string(),
            mount_options: Vec::new(),
        }
    }

    pub fn with_mount_options(mut self, options: Vec<String>) -> Self {
        if let ProbeScript::Verify { mount_options, .. } = &mut self {
            *mount_options = options;
        }
        self
    }

    /// Shell command for the given volume mode
    pub fn render(&self, mode: VolumeMode) -> String {
        match (self, mode) {
            (ProbeScript::Write { file, content }, VolumeMode::Filesystem) => {
                format!("echo '{}' > {}/{}", content, MOUNT_PATH, file)
            }
            (ProbeScript::Write { content, .. }, VolumeMode::Block) => {
                format!("echo '{}' | dd of={} conv=fsync", content, MOUNT_PATH)
            }
            (
                ProbeScript::Verify {
                    file,
                    content,
                    mount_options,
                },
                VolumeMode::Filesystem,
            ) => {
                let mut command = format!("grep '{}' {}/{}", content, MOUNT_PATH, file);
                for option in mount_options {
                    // Option lists print as "(rw,relatime)"; wrap in commas to match whole words
                    command.push_str(&format!(
                        " && ( mount | grep 'on {}' | awk '{{print $6}}' | sed 's/^(/,/; s/)$/,/' | grep -q ,{}, )",
                        MOUNT_PATH, option
                    ));
                }
                if !mount_options.is_empty() {
                    command.push_str(&format!(" || (mount | grep 'on {}'; false)", MOUNT_PATH));
                }
                command
            }
            (ProbeScript::Verify { content, .. }, VolumeMode::Block) => {
                format!("head -c {} {} | grep '{}'", content.len() + 1, MOUNT_PATH, content)
            }
            (ProbeScript::Noop, _) => "true".to_string(),
            (ProbeScript::Hold, _) => "trap exit TERM; while true; do sleep 1; done".to_string(),
        }
    }
}

// =============================================================================
// Pod Builder
// =============================================================================

/// A single-claim workload pod
#[derive(Debug, Clone)]
pub struct WorkloadPod {
    pub prefix: String,
    pub namespace: String,
    pub claim_name: String,
    pub script: ProbeScript,
    pub mode: VolumeMode,
    pub selection: NodeSelection,
    pub image: String,
}

impl WorkloadPod {
    pub fn new(ctx: &ScenarioContext, prefix: &str, claim_name: &str, script: ProbeScript) -> Self {
        Self {
            prefix: prefix.to_string(),
            namespace: ctx.namespace.clone(),
            claim_name: claim_name.to_string(),
            script,
            mode: VolumeMode::Filesystem,
            selection: ctx.node_selection.clone(),
            image: ctx.test_image.clone(),
        }
    }

    pub fn mode(mut self, mode: VolumeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn selection(mut self, selection: NodeSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Render the pod object
    pub fn build(&self) -> Pod {
        let mut container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(self.image.clone()),
            command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            args: Some(vec![self.script.render(self.mode)]),
            ..Default::default()
        };
        match self.mode {
            VolumeMode::Filesystem => {
                container.volume_mounts = Some(vec![VolumeMount {
                    name: VOLUME_NAME.to_string(),
                    mount_path: MOUNT_PATH.to_string(),
                    ..Default::default()
                }]);
            }
            VolumeMode::Block => {
                container.volume_devices = Some(vec![VolumeDevice {
                    name: VOLUME_NAME.to_string(),
                    device_path: MOUNT_PATH.to_string(),
                }]);
            }
        }

        let mut spec = PodSpec {
            containers: vec![container],
            restart_policy: Some("Never".to_string()),
            volumes: Some(vec![Volume {
                name: VOLUME_NAME.to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: self.claim_name.clone(),
                    read_only: Some(false),
                }),
                ..Default::default()
            }]),
            ..Default::default()
        };
        self.selection.apply(&mut spec);

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", self.prefix)),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([("app".to_string(), self.prefix.clone())])),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }
}

// =============================================================================
// Pod Lifecycle
// =============================================================================

/// Create the workload pod and return it as created
pub async fn start_pod(ctx: &ScenarioContext, workload: &WorkloadPod) -> Result<Pod> {
    let pod = ctx.cp.create_pod(&workload.build()).await?;
    info!(
        "Started pod {}/{} for claim {}",
        workload.namespace,
        pod.name_any(),
        workload.claim_name
    );
    Ok(pod)
}

/// Start the pod, wait for it to succeed, then stop it.
///
/// Returns the pod as observed after completion, so the caller can read
/// the node it ran on. The pod is stopped on every path.
pub async fn run_pod(ctx: &ScenarioContext, workload: &WorkloadPod) -> Result<Pod> {
    let pod = start_pod(ctx, workload).await?;
    let namespace = pod.namespace().unwrap_or_else(|| ctx.namespace.clone());
    let name = pod.name_any();

    let finished = wait::wait_for_pod_success(
        ctx.cp.as_ref(),
        &namespace,
        &name,
        ctx.timeouts.poll(),
        ctx.timeouts.pod_start_slow(),
    )
    .await;
    let stopped = teardown::stop_pod(ctx, &namespace, &name).await;

    let pod = finished?;
    stopped?;
    Ok(pod)
}
