//! Storage Conformance
//!
//! Command line runner for the dynamic provisioning conformance suite and
//! the router churn check.
//!
//! ```text
//! storage-conformance provision --config driver.yaml --namespace e2e-storage
//! storage-conformance provision --config driver.yaml --simulated-nodes 3
//! storage-conformance router --namespace router-test
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use storage_conformance::provisioning::MetricsEndpointOpCounts;
use storage_conformance::router::RouterConfig;
use storage_conformance::{
    metrics, ControlPlaneRef, Error, HttpRouteProber, KubeControlPlane, KubeRouteAdmin, KubeSnapshotProvider,
    ProvisioningSuite, Result, RouterChurnScenario, RunnerConfig, Scenario, ScenarioReport, SimulatedCluster,
    TestPattern,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Storage Conformance - dynamic provisioning conformance for Kubernetes storage drivers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Health server bind address
    #[arg(long, global = true, env = "HEALTH_ADDR")]
    health_addr: Option<String>,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the dynamic provisioning scenarios
    Provision(ProvisionArgs),
    /// Run the router route-churn check
    Router(RouterArgs),
}

#[derive(clap::Args, Debug)]
struct ProvisionArgs {
    /// Runner configuration file (YAML)
    #[arg(long, env = "CONFORMANCE_CONFIG")]
    config: PathBuf,

    /// Namespace for claims and pods
    #[arg(long, env = "CONFORMANCE_NAMESPACE", default_value = "storage-conformance")]
    namespace: String,

    /// Scenarios to run; all when empty
    #[arg(long, value_delimiter = ',')]
    scenarios: Vec<Scenario>,

    /// Test patterns (`default`, `block` or an fs type); the standard set when empty
    #[arg(long, value_delimiter = ',')]
    patterns: Vec<TestPattern>,

    /// VolumeSnapshotClass for snapshot sources
    #[arg(long, env = "SNAPSHOT_CLASS")]
    snapshot_class: Option<String>,

    /// Controller metrics URL used to validate operation counts of migrated drivers
    #[arg(long, env = "MIGRATION_METRICS_URL")]
    migration_metrics_url: Option<String>,

    /// Run against an in-memory cluster with this many nodes instead of a live one
    #[arg(long, env = "SIMULATED_NODES")]
    simulated_nodes: Option<usize>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct RouterArgs {
    /// Router configuration file (YAML); flags override it
    #[arg(long, env = "ROUTER_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace of the router and its routes
    #[arg(long, env = "ROUTER_NAMESPACE")]
    namespace: Option<String>,

    /// Router pod name
    #[arg(long, env = "ROUTER_POD")]
    router_pod: Option<String>,

    /// Rounds of route churn
    #[arg(long)]
    rounds: Option<usize>,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Storage Conformance");
    info!("  Version: {}", storage_conformance::VERSION);

    // Start health server
    if let Some(health_addr) = args.health_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_health_server(&health_addr).await {
                error!("Health server error: {}", e);
            }
        });
    }

    // Start metrics server
    if let Some(metrics_addr) = args.metrics_addr.clone() {
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    match args.command {
        Command::Provision(provision) => run_provisioning(provision).await,
        Command::Router(router) => run_router(router).await,
    }
}

// =============================================================================
// Provisioning
// =============================================================================

async fn run_provisioning(args: ProvisionArgs) -> anyhow::Result<()> {
    let config = RunnerConfig::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!("  Driver: {}", config.driver.name);
    info!("  Namespace: {}", args.namespace);

    let scenarios = if args.scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        args.scenarios.clone()
    };
    let patterns = if args.patterns.is_empty() {
        TestPattern::defaults()
    } else {
        args.patterns.clone()
    };

    let suite = match args.simulated_nodes {
        Some(nodes) => {
            info!("  Simulated cluster: {} node(s)", nodes);
            let cluster = SimulatedCluster::new().with_nodes((0..nodes).map(|i| format!("node-{}", i)));
            ProvisioningSuite::new(config, cluster.handle()).with_snapshots(Arc::new(cluster))
        }
        None => {
            let cp = KubeControlPlane::try_default().await.context("connecting to the cluster")?;
            let snapshots = KubeSnapshotProvider::new(cp.client(), args.snapshot_class.clone());
            let handle: ControlPlaneRef = Arc::new(cp);
            ProvisioningSuite::new(config, handle).with_snapshots(Arc::new(snapshots))
        }
    };
    let suite = match &args.migration_metrics_url {
        Some(url) => suite.with_op_counts(Arc::new(MetricsEndpointOpCounts::new(url.clone())?)),
        None => suite,
    };

    let reports = suite.run_all(&scenarios, &patterns, &args.namespace).await;
    write_report(&reports, args.report.as_ref())?;

    let failed = reports.iter().filter(|r| r.outcome.is_failure()).count();
    let skipped = reports.iter().filter(|r| r.outcome.label() == "skipped").count();
    info!(
        total = reports.len(),
        failed,
        skipped,
        "provisioning scenarios finished"
    );
    if failed > 0 {
        bail!("{} of {} scenario run(s) failed", failed, reports.len());
    }
    Ok(())
}

fn write_report(reports: &[ScenarioReport], path: Option<&PathBuf>) -> anyhow::Result<()> {
    let body = serde_json::to_string_pretty(reports)?;
    match path {
        Some(path) => {
            std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
            info!("report written to {}", path.display());
        }
        None => println!("{}", body),
    }
    Ok(())
}

// =============================================================================
// Router
// =============================================================================

async fn run_router(args: RouterArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<RouterConfig>(&raw).map_err(Error::from)?
        }
        None => RouterConfig::default(),
    };
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(router_pod) = args.router_pod {
        config.router_pod = router_pod;
    }
    if let Some(rounds) = args.rounds {
        config.churn_rounds = rounds;
    }
    info!("  Router: {}/{}", config.namespace, config.router_pod);

    let cp = KubeControlPlane::try_default().await.context("connecting to the cluster")?;
    let admin = Arc::new(KubeRouteAdmin::new(cp.client()));
    let scenario = RouterChurnScenario::new(config, Arc::new(cp), admin, Arc::new(HttpRouteProber));

    let outcome = scenario.run().await;
    metrics::record_scenario(
        "router-churn",
        &match &outcome {
            Ok(()) => "passed".to_string(),
            Err(e) => e.class().to_string(),
        },
    );
    outcome?;
    info!("router served every route");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn", "rustls=warn"] {
        match directive.parse() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => warn!("ignoring log directive {}: {}", directive, e),
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn plain_response(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => plain_response(StatusCode::OK, "ok"),
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Platform(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/metrics" => match metrics::render() {
                    Ok(text) => {
                        let mut response = plain_response(StatusCode::OK, text);
                        response.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        response
                    }
                    Err(e) => plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                },
                _ => plain_response(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Platform(format!("Metrics server error: {}", e)))?;

    Ok(())
}
