//! Prometheus metrics
//!
//! Registered once into the default registry and served by the binary's
//! `/metrics` endpoint.

use crate::error::{Error, ErrorClass, Result};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, TextEncoder};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

struct Metrics {
    scenarios: IntCounterVec,
    bind_seconds: Histogram,
    volumes_verified: IntCounter,
    cleanup_failures: IntCounter,
}

impl Metrics {
    fn register() -> prometheus::Result<Self> {
        let scenarios = IntCounterVec::new(
            Opts::new(
                "storage_conformance_scenarios_total",
                "Scenario runs by scenario and outcome",
            ),
            &["scenario", "outcome"],
        )?;
        let bind_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "storage_conformance_claim_bind_seconds",
                "Time from claim creation until the claim is Bound",
            )
            .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        )?;
        let volumes_verified = IntCounter::new(
            "storage_conformance_volumes_verified_total",
            "Volumes that passed property verification",
        )?;
        let cleanup_failures = IntCounter::new(
            "storage_conformance_cleanup_failures_total",
            "Teardowns that left resources behind",
        )?;

        let registry = prometheus::default_registry();
        registry.register(Box::new(scenarios.clone()))?;
        registry.register(Box::new(bind_seconds.clone()))?;
        registry.register(Box::new(volumes_verified.clone()))?;
        registry.register(Box::new(cleanup_failures.clone()))?;

        Ok(Self {
            scenarios,
            bind_seconds,
            volumes_verified,
            cleanup_failures,
        })
    }
}

fn metrics() -> Option<&'static Metrics> {
    static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();
    METRICS
        .get_or_init(|| match Metrics::register() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("metrics disabled: {}", e);
                None
            }
        })
        .as_ref()
}

/// Count a finished scenario; `outcome` is `passed`, `skipped` or an error class
pub fn record_scenario(scenario: &str, outcome: &str) {
    if let Some(m) = metrics() {
        m.scenarios.with_label_values(&[scenario, outcome]).inc();
        if outcome == ErrorClass::Cleanup.to_string() {
            m.cleanup_failures.inc();
        }
    }
}

pub fn observe_bind_latency(elapsed: Duration) {
    if let Some(m) = metrics() {
        m.bind_seconds.observe(elapsed.as_secs_f64());
    }
}

pub fn volume_verified() {
    if let Some(m) = metrics() {
        m.volumes_verified.inc();
    }
}

/// Render every registered metric in the text exposition format
pub fn render() -> Result<String> {
    // Make sure our collectors exist even before the first scenario
    let _ = metrics();

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Platform(format!("encoding metrics: {}", e)))?;
    String::from_utf8(buffer).map_err(|e| Error::Platform(format!("encoding metrics: {}", e)))
}
