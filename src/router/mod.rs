//! Router verification
//!
//! Checks that an HTTP router serves its routes while the route set
//! changes underneath it. Requests go straight to the router pod IP with the
//! route host pinned, so no external DNS is involved.

pub mod churn;

pub use churn::{ChurnPlan, ChurnStep, KubeRouteAdmin, RouteAdmin, RouteKind, RouteSpec, RouterChurnScenario};

use crate::domain::ports::ControlPlane;
use crate::error::{Error, Result};
use crate::provisioning::wait;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Router stats/health port
pub const HEALTHZ_PORT: u16 = 1936;

/// Per-request timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

// =============================================================================
// Configuration
// =============================================================================

/// Where the router under test runs and how long to wait for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterConfig {
    /// Namespace of the router pod and its routes
    pub namespace: String,
    /// Router pod name
    pub router_pod: String,
    /// Interval between route probes
    pub poll_secs: u64,
    /// Budget for every wait
    pub timeout_secs: u64,
    /// Rounds of route churn
    pub churn_rounds: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            router_pod: "router-haproxy-cfgmgr".to_string(),
            poll_secs: 1,
            timeout_secs: 180,
            churn_rounds: 16,
        }
    }
}

impl RouterConfig {
    pub fn poll(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_secs == 0 || self.timeout_secs < self.poll_secs {
            return Err(Error::Configuration(format!(
                "router timeout ({}s) must be at least the poll interval ({}s), which must be positive",
                self.timeout_secs, self.poll_secs
            )));
        }
        if self.router_pod.is_empty() {
            return Err(Error::Configuration("router pod name is required".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Route Target
// =============================================================================

/// One URL served by the router
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub proto: String,
    pub host: String,
    pub path: String,
    /// Explicit port; `None` uses the protocol default
    pub port: Option<u16>,
}

impl RouteTarget {
    pub fn new(proto: &str, host: &str, path: &str) -> Self {
        Self {
            proto: proto.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            port: None,
        }
    }

    pub fn http(host: &str) -> Self {
        Self::new("http", host, "/")
    }

    pub fn https(host: &str) -> Self {
        Self::new("https", host, "/")
    }

    /// Router health endpoint
    pub fn healthz(router_ip: IpAddr) -> Self {
        Self {
            port: Some(HEALTHZ_PORT),
            ..Self::new("http", &router_ip.to_string(), "/healthz")
        }
    }

    /// Port requests go to; https defaults to 443, everything else to 80
    pub fn effective_port(&self) -> u16 {
        match (self.port, self.proto.as_str()) {
            (Some(port), _) if port != 0 => port,
            (_, "https") => 443,
            _ => 80,
        }
    }

    pub fn uri(&self) -> String {
        let host = match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{}]", v6),
            _ => self.host.clone(),
        };
        format!("{}://{}:{}{}", self.proto, host, self.effective_port(), self.path)
    }
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uri())
    }
}

// =============================================================================
// Route Prober
// =============================================================================

/// Issues a single request to a route through the router
#[async_trait]
pub trait RouteProber: Send + Sync {
    /// HTTP status of one request; transport failures are errors
    async fn status(&self, target: &RouteTarget, router_ip: IpAddr) -> Result<u16>;
}

pub type RouteProberRef = Arc<dyn RouteProber>;

/// Prober over `reqwest` with the route host resolved to the router IP
#[derive(Debug, Clone, Default)]
pub struct HttpRouteProber;

#[async_trait]
impl RouteProber for HttpRouteProber {
    async fn status(&self, target: &RouteTarget, router_ip: IpAddr) -> Result<u16> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .resolve(&target.host, SocketAddr::new(router_ip, target.effective_port()))
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let response = client.get(target.uri()).send().await?;
        Ok(response.status().as_u16())
    }
}

/// Poll `target` until it answers 200.
///
/// A 503 means the router has not picked up the route yet and polling
/// continues. Any other status fails right away. Transport errors are
/// logged and retried. Running out of budget is an `Error::Timeout`.
pub async fn wait_for_route_to_respond(
    prober: &dyn RouteProber,
    target: &RouteTarget,
    router_ip: IpAddr,
    interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let uri = target.uri();
    let history: Mutex<Vec<String>> = Mutex::new(Vec::new());

    let result = wait::poll_until("route to answer 200", &uri, interval, timeout, || async {
        match prober.status(target, router_ip).await {
            Ok(200) => Ok(true),
            Ok(503) => {
                history.lock().push("503".to_string());
                Ok(false)
            }
            Ok(code) => {
                let mut seen = history.lock();
                seen.push(code.to_string());
                Err(Error::RouteUnavailable {
                    uri: uri.clone(),
                    reason: format!("unexpected status {} (responses: {})", code, seen.join(", ")),
                })
            }
            Err(e) => {
                warn!("request to {} failed: {}", target, e);
                history.lock().push("error".to_string());
                Ok(false)
            }
        }
    })
    .await;

    match &result {
        Ok(()) => debug!("{} answered 200", target),
        Err(Error::Timeout { .. }) => {
            warn!("{} never answered 200 (responses: {})", target, history.lock().join(", "))
        }
        Err(_) => {}
    }
    result
}

/// Wait until the router pod reports an IP
pub async fn wait_for_router_ip(
    cp: &dyn ControlPlane,
    namespace: &str,
    pod_name: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<IpAddr> {
    let resource = format!("{}/{}", namespace, pod_name);
    let ip = wait::poll_for("router pod IP", &resource, interval, timeout, || async {
        let pod = cp.get_pod(namespace, pod_name).await?;
        let ip = pod
            .status
            .and_then(|s| s.pod_ip)
            .filter(|ip| !ip.is_empty());
        ip.map(|ip| {
            ip.parse::<IpAddr>()
                .map_err(|e| Error::Platform(format!("router pod {} has bad IP {:?}: {}", resource, ip, e)))
        })
        .transpose()
    })
    .await?;
    info!("router {} is at {}", resource, ip);
    Ok(ip)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::{BTreeMap, VecDeque};
    use tokio::time::Instant;

    /// Scripted answers per host; an exhausted script keeps answering 200
    #[derive(Default)]
    pub(crate) struct ScriptedProber {
        answers: Mutex<BTreeMap<String, VecDeque<Result<u16>>>>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        pub(crate) fn answer(&self, host: &str, answers: Vec<Result<u16>>) {
            self.answers.lock().insert(host.to_string(), answers.into());
        }
    }

    #[async_trait]
    impl RouteProber for ScriptedProber {
        async fn status(&self, target: &RouteTarget, _router_ip: IpAddr) -> Result<u16> {
            self.requests.lock().push(target.uri());
            self.answers
                .lock()
                .get_mut(&target.host)
                .and_then(|answers| answers.pop_front())
                .unwrap_or(Ok(200))
        }
    }

    fn router_ip() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn test_default_ports_and_uri() {
        assert_eq!(RouteTarget::http("a.test").uri(), "http://a.test:80/");
        assert_eq!(RouteTarget::https("a.test").uri(), "https://a.test:443/");
        assert_eq!(RouteTarget::new("ftp", "a.test", "/x").effective_port(), 80);
        assert_eq!(RouteTarget::healthz(router_ip()).uri(), "http://10.0.0.7:1936/healthz");

        let v6 = RouteTarget::healthz("fd00::7".parse().unwrap());
        assert_eq!(v6.uri(), "http://[fd00::7]:1936/healthz");
    }

    #[test]
    fn test_router_config_defaults() {
        let config: RouterConfig = serde_yaml::from_str("namespace: routers").unwrap();
        assert_eq!(config.namespace, "routers");
        assert_eq!(config.timeout(), Duration::from_secs(180));
        assert_eq!(config.churn_rounds, 16);
        assert!(config.validate().is_ok());

        let bad = RouterConfig {
            poll_secs: 0,
            ..Default::default()
        };
        assert_matches!(bad.validate(), Err(Error::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_route_is_retried() {
        let prober = ScriptedProber::default();
        prober.answer(
            "a.test",
            vec![Ok(503), Err(Error::Platform("connection refused".into())), Ok(503), Ok(200)],
        );

        wait_for_route_to_respond(
            &prober,
            &RouteTarget::http("a.test"),
            router_ip(),
            Duration::from_secs(1),
            Duration::from_secs(180),
        )
        .await
        .unwrap();
        assert_eq!(prober.requests.lock().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_status_fails_fast() {
        let prober = ScriptedProber::default();
        prober.answer("a.test", vec![Ok(503), Ok(404)]);

        let err = wait_for_route_to_respond(
            &prober,
            &RouteTarget::https("a.test"),
            router_ip(),
            Duration::from_secs(1),
            Duration::from_secs(180),
        )
        .await
        .unwrap_err();
        assert_matches!(&err, Error::RouteUnavailable { uri, reason }
            if uri == "https://a.test:443/" && reason.contains("503, 404"));
        assert_eq!(prober.requests.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_expires_while_unavailable() {
        let prober = ScriptedProber::default();
        prober.answer("a.test", (0..100).map(|_| Ok(503)).collect());

        let start = Instant::now();
        let err = wait_for_route_to_respond(
            &prober,
            &RouteTarget::http("a.test"),
            router_ip(),
            Duration::from_secs(1),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert_matches!(err, Error::Timeout { ref resource, budget, .. }
            if resource == "http://a.test:80/" && budget == Duration::from_secs(10));
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert!(start.elapsed() < Duration::from_secs(12));
    }
}
