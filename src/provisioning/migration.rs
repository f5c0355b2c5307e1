//! Migration operation counter check
//!
//! For drivers that replace an in-tree plugin, volume operations must keep
//! flowing through the path the migration setting promises. Counts are
//! snapshotted when a scenario starts and compared when it ends.

use crate::domain::driver::DriverDescriptor;
use crate::domain::ports::{OpCountSource, OpCountSourceRef, OpCounts};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Metric that counts storage operations per volume plugin
pub const OPERATION_METRIC: &str = "storage_operation_duration_seconds_count";

/// Start-of-scenario snapshot for one in-tree plugin
pub struct MigrationOpCheck {
    source: OpCountSourceRef,
    plugin: String,
    migrated: bool,
    before: OpCounts,
}

impl MigrationOpCheck {
    /// Snapshot the counters, or `None` when the driver replaces no plugin
    pub async fn start(source: OpCountSourceRef, driver: &DriverDescriptor) -> Result<Option<Self>> {
        let Some(plugin) = driver.in_tree_plugin_name.clone().filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        let before = source.snapshot(&plugin).await?;
        debug!(plugin = %plugin, ?before, "migration op counts at start");
        Ok(Some(Self {
            source,
            plugin,
            migrated: driver.migrated,
            before,
        }))
    }

    /// Compare the counters with the start snapshot
    pub async fn validate(&self) -> Result<()> {
        let after = self.source.snapshot(&self.plugin).await?;
        info!(plugin = %self.plugin, migrated = self.migrated, ?after, "validating migration op counts");

        if self.migrated && after.legacy != self.before.legacy {
            return Err(Error::mismatch(
                &self.plugin,
                "in-tree operation count",
                self.before.legacy,
                after.legacy,
            ));
        }
        if !self.migrated && after.migrated != self.before.migrated {
            return Err(Error::mismatch(
                &self.plugin,
                "migrated operation count",
                self.before.migrated,
                after.migrated,
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Metrics endpoint source
// =============================================================================

/// Reads operation counts from a controller's Prometheus text endpoint
pub struct MetricsEndpointOpCounts {
    url: String,
    client: reqwest::Client,
}

impl MetricsEndpointOpCounts {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl OpCountSource for MetricsEndpointOpCounts {
    async fn snapshot(&self, plugin: &str) -> Result<OpCounts> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_op_counts(&body, plugin))
    }
}

fn label_value<'a>(labels: &'a str, name: &str) -> Option<&'a str> {
    labels.split(',').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().trim_matches('"'))
    })
}

/// Sum operation counts for `plugin` out of a text exposition body
pub fn parse_op_counts(body: &str, plugin: &str) -> OpCounts {
    let mut counts = OpCounts::default();

    for line in body.lines() {
        let Some(rest) = line.strip_prefix(OPERATION_METRIC) else { continue };
        let Some(rest) = rest.strip_prefix('{') else { continue };
        let Some((labels, value)) = rest.split_once('}') else { continue };

        if label_value(labels, "volume_plugin") != Some(plugin) {
            continue;
        }
        let Ok(value) = value.trim().parse::<f64>() else { continue };
        let value = value as u64;

        if label_value(labels, "migrated") == Some("true") {
            counts.migrated += value;
        } else {
            counts.legacy += value;
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const PLUGIN: &str = "kubernetes.io/gce-pd";

    struct FakeCounts(Mutex<OpCounts>);

    #[async_trait]
    impl OpCountSource for FakeCounts {
        async fn snapshot(&self, _plugin: &str) -> Result<OpCounts> {
            Ok(*self.0.lock())
        }
    }

    fn driver(migrated: bool) -> DriverDescriptor {
        let mut driver = DriverDescriptor::new("pd.csi.storage.gke.io");
        driver.in_tree_plugin_name = Some(PLUGIN.into());
        driver.migrated = migrated;
        driver
    }

    #[test]
    fn test_parse_exposition() {
        let body = r#"
# HELP storage_operation_duration_seconds_count Storage operation duration
# TYPE storage_operation_duration_seconds_count counter
storage_operation_duration_seconds_count{migrated="false",operation_name="volume_provision",status="success",volume_plugin="kubernetes.io/gce-pd"} 4
storage_operation_duration_seconds_count{migrated="true",operation_name="volume_provision",status="success",volume_plugin="kubernetes.io/gce-pd"} 7
storage_operation_duration_seconds_count{migrated="true",operation_name="volume_delete",status="success",volume_plugin="kubernetes.io/gce-pd"} 2
storage_operation_duration_seconds_count{migrated="false",operation_name="volume_provision",status="success",volume_plugin="kubernetes.io/aws-ebs"} 9
storage_operation_duration_seconds_sum{migrated="false",operation_name="volume_provision",status="success",volume_plugin="kubernetes.io/gce-pd"} 12.5
"#;
        assert_eq!(parse_op_counts(body, PLUGIN), OpCounts { legacy: 4, migrated: 9 });
    }

    #[tokio::test]
    async fn test_no_plugin_no_check() {
        let source = Arc::new(FakeCounts(Mutex::new(OpCounts::default())));
        let check = MigrationOpCheck::start(source, &DriverDescriptor::new("csi.example.com"))
            .await
            .unwrap();
        assert!(check.is_none());
    }

    #[tokio::test]
    async fn test_migrated_plugin_must_not_use_legacy_path() {
        let source = Arc::new(FakeCounts(Mutex::new(OpCounts { legacy: 3, migrated: 1 })));
        let check = MigrationOpCheck::start(source.clone(), &driver(true))
            .await
            .unwrap()
            .unwrap();

        source.0.lock().migrated = 5;
        assert!(check.validate().await.is_ok());

        source.0.lock().legacy = 4;
        assert_matches!(
            check.validate().await,
            Err(Error::InvariantViolation { ref check, .. }) if check == "in-tree operation count"
        );
    }

    #[tokio::test]
    async fn test_unmigrated_plugin_must_not_use_driver_path() {
        let source = Arc::new(FakeCounts(Mutex::new(OpCounts::default())));
        let check = MigrationOpCheck::start(source.clone(), &driver(false))
            .await
            .unwrap()
            .unwrap();

        source.0.lock().legacy = 2;
        assert!(check.validate().await.is_ok());

        source.0.lock().migrated = 1;
        assert!(check.validate().await.is_err());
    }
}
