//! Route churn
//!
//! Adds and removes routes of every termination type in rounds and checks
//! the router starts serving each one before it is removed again.

use super::{wait_for_route_to_respond, wait_for_router_ip, RouteProberRef, RouteTarget, RouterConfig};
use crate::domain::ports::ControlPlaneRef;
use crate::platform::cluster::api_error;
use crate::error::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// Domain every churn host lives under
pub const CHURN_DOMAIN: &str = "hapcm.test";

/// Label the router selects its routes by
pub const ROUTE_SELECTOR: (&str, &str) = ("select", "haproxy-cfgmgr");

pub const INSECURE_SERVICE: &str = "insecure-service";
pub const SECURE_SERVICE: &str = "secure-service";

// =============================================================================
// Routes
// =============================================================================

/// TLS termination of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    /// Plain HTTP
    Insecure,
    /// TLS terminated at the router
    Edge,
    /// TLS terminated at the router and re-encrypted to the backend
    Reencrypt,
    /// TLS passed through to the backend
    Passthrough,
}

impl RouteKind {
    /// Kinds churned through in every round, in order
    pub const ALL: [RouteKind; 4] = [
        RouteKind::Insecure,
        RouteKind::Edge,
        RouteKind::Reencrypt,
        RouteKind::Passthrough,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RouteKind::Insecure => "insecure",
            RouteKind::Edge => "edge",
            RouteKind::Reencrypt => "reencrypt",
            RouteKind::Passthrough => "passthrough",
        }
    }

    /// `spec.tls.termination` value; `None` for plain routes
    pub fn termination(&self) -> Option<&'static str> {
        match self {
            RouteKind::Insecure => None,
            RouteKind::Edge => Some("edge"),
            RouteKind::Reencrypt => Some("reencrypt"),
            RouteKind::Passthrough => Some("passthrough"),
        }
    }

    /// Edge routes talk plain HTTP to their backend
    pub fn service(&self) -> &'static str {
        match self {
            RouteKind::Insecure | RouteKind::Edge => INSECURE_SERVICE,
            RouteKind::Reencrypt | RouteKind::Passthrough => SECURE_SERVICE,
        }
    }

    pub fn proto(&self) -> &'static str {
        match self {
            RouteKind::Insecure => "http",
            _ => "https",
        }
    }
}

impl std::fmt::Display for RouteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A route to create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    pub name: String,
    pub host: String,
    pub kind: RouteKind,
    pub service: String,
    /// Labels set at creation
    pub labels: BTreeMap<String, String>,
}

impl RouteSpec {
    pub fn target(&self) -> RouteTarget {
        RouteTarget::new(self.kind.proto(), &self.host, "/")
    }
}

/// Route management API
#[async_trait]
pub trait RouteAdmin: Send + Sync {
    async fn create_route(&self, namespace: &str, route: &RouteSpec) -> Result<()>;
    async fn label_route(&self, namespace: &str, name: &str, labels: &BTreeMap<String, String>) -> Result<()>;
    async fn delete_route(&self, namespace: &str, name: &str) -> Result<()>;
    /// Route name and admitted host, for failure diagnostics
    async fn list_routes(&self, namespace: &str) -> Result<Vec<(String, String)>>;
}

pub type RouteAdminRef = Arc<dyn RouteAdmin>;

// =============================================================================
// Churn Plan
// =============================================================================

/// One route's life within a round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChurnStep {
    pub route: RouteSpec,
    /// Labels applied after creation
    pub relabel: Option<BTreeMap<String, String>>,
}

/// Rounds of route churn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChurnPlan {
    pub rounds: usize,
}

impl Default for ChurnPlan {
    fn default() -> Self {
        Self { rounds: 16 }
    }
}

fn selector_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(ROUTE_SELECTOR.0.to_string(), ROUTE_SELECTOR.1.to_string())])
}

impl ChurnPlan {
    pub fn new(rounds: usize) -> Self {
        Self { rounds }
    }

    /// Steps of round `round`.
    ///
    /// The insecure route is exposed with the selector label already set;
    /// TLS routes get it in a separate update so the router sees a relabel.
    pub fn round(&self, round: usize) -> Vec<ChurnStep> {
        RouteKind::ALL
            .iter()
            .map(|&kind| {
                let route = RouteSpec {
                    name: format!("hapcm-stress-{}-{}", kind, round),
                    host: format!("stress.{}-{}.{}", kind, round, CHURN_DOMAIN),
                    kind,
                    service: kind.service().to_string(),
                    labels: if kind == RouteKind::Insecure {
                        selector_labels()
                    } else {
                        BTreeMap::new()
                    },
                };
                ChurnStep {
                    route,
                    relabel: (kind != RouteKind::Insecure).then(selector_labels),
                }
            })
            .collect()
    }

    pub fn steps(&self) -> impl Iterator<Item = ChurnStep> + '_ {
        (0..self.rounds).flat_map(|round| self.round(round))
    }
}

/// Routes the router ships with
pub fn static_routes() -> Vec<RouteTarget> {
    vec![
        RouteTarget::http(&format!("insecure.{}", CHURN_DOMAIN)),
        RouteTarget::https(&format!("edge.allow.{}", CHURN_DOMAIN)),
        RouteTarget::https(&format!("reencrypt.{}", CHURN_DOMAIN)),
        RouteTarget::https(&format!("passthrough.{}", CHURN_DOMAIN)),
    ]
}

// =============================================================================
// Scenario
// =============================================================================

/// Health, static routes, then route churn against one router
pub struct RouterChurnScenario {
    config: RouterConfig,
    cp: ControlPlaneRef,
    admin: RouteAdminRef,
    prober: RouteProberRef,
}

impl RouterChurnScenario {
    pub fn new(config: RouterConfig, cp: ControlPlaneRef, admin: RouteAdminRef, prober: RouteProberRef) -> Self {
        Self {
            config,
            cp,
            admin,
            prober,
        }
    }

    pub async fn run(&self) -> Result<()> {
        self.config.validate()?;
        let result = self.run_checks().await;
        if let Err(e) = &result {
            warn!("router churn failed: {}", e);
            self.dump_routes().await;
        }
        result
    }

    async fn run_checks(&self) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        let router_ip = wait_for_router_ip(
            self.cp.as_ref(),
            namespace,
            &self.config.router_pod,
            self.config.poll(),
            self.config.timeout(),
        )
        .await?;

        info!("waiting for the healthz endpoint to respond");
        self.wait_for(&RouteTarget::healthz(router_ip), router_ip).await?;

        info!("waiting for the static routes to respond");
        for target in static_routes() {
            self.wait_for(&target, router_ip).await?;
        }

        let plan = ChurnPlan::new(self.config.churn_rounds);
        info!(rounds = plan.rounds, "adding and removing routes");
        for step in plan.steps() {
            self.churn(&step, router_ip).await?;
        }
        Ok(())
    }

    async fn wait_for(&self, target: &RouteTarget, router_ip: IpAddr) -> Result<()> {
        wait_for_route_to_respond(
            self.prober.as_ref(),
            target,
            router_ip,
            self.config.poll(),
            self.config.timeout(),
        )
        .await
    }

    /// Create, label, probe and delete one route; the route is removed on every path
    async fn churn(&self, step: &ChurnStep, router_ip: IpAddr) -> Result<()> {
        let namespace = self.config.namespace.as_str();
        let route = &step.route;
        self.admin.create_route(namespace, route).await?;

        let served = async {
            if let Some(labels) = &step.relabel {
                self.admin.label_route(namespace, &route.name, labels).await?;
            }
            self.wait_for(&route.target(), router_ip).await
        }
        .await;

        let deleted = self.admin.delete_route(namespace, &route.name).await;
        match (served, deleted) {
            (Err(e), Err(cleanup)) => {
                warn!("removing route {} also failed: {}", route.name, cleanup);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), deleted) => deleted,
        }
    }

    async fn dump_routes(&self) {
        match self.admin.list_routes(&self.config.namespace).await {
            Ok(routes) => {
                for (name, host) in routes {
                    info!("route {} admitted for {}", name, host);
                }
            }
            Err(e) => warn!("listing routes failed: {}", e),
        }
    }
}

// =============================================================================
// Kubernetes Route Admin
// =============================================================================

fn route_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk("route.openshift.io", "v1", "Route"))
}

fn route_object(namespace: &str, route: &RouteSpec) -> DynamicObject {
    let mut spec = json!({
        "host": route.host,
        "to": { "kind": "Service", "name": route.service },
    });
    if let Some(termination) = route.kind.termination() {
        spec["tls"] = json!({ "termination": termination });
    }

    let mut object = DynamicObject::new(&route.name, &route_resource())
        .within(namespace)
        .data(json!({ "spec": spec }));
    if !route.labels.is_empty() {
        object.metadata.labels = Some(route.labels.clone());
    }
    object
}

fn route_error(err: kube::Error, namespace: &str, name: &str) -> Error {
    api_error(err, "Route", format!("{}/{}", namespace, name))
}

/// Routes through `route.openshift.io/v1`
#[derive(Clone)]
pub struct KubeRouteAdmin {
    client: Client,
}

impl KubeRouteAdmin {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn routes(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &route_resource())
    }
}

#[async_trait]
impl RouteAdmin for KubeRouteAdmin {
    async fn create_route(&self, namespace: &str, route: &RouteSpec) -> Result<()> {
        self.routes(namespace)
            .create(&PostParams::default(), &route_object(namespace, route))
            .await
            .map_err(|e| route_error(e, namespace, &route.name))?;
        info!("created {} route {}/{} for {}", route.kind, namespace, route.name, route.host);
        Ok(())
    }

    async fn label_route(&self, namespace: &str, name: &str, labels: &BTreeMap<String, String>) -> Result<()> {
        let patch = json!({ "metadata": { "labels": labels } });
        self.routes(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| route_error(e, namespace, name))?;
        Ok(())
    }

    async fn delete_route(&self, namespace: &str, name: &str) -> Result<()> {
        self.routes(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| route_error(e, namespace, name))
    }

    async fn list_routes(&self, namespace: &str) -> Result<Vec<(String, String)>> {
        let routes = self.routes(namespace).list(&ListParams::default()).await?;
        Ok(routes
            .items
            .iter()
            .map(|route| {
                let host = route
                    .data
                    .pointer("/spec/host")
                    .and_then(|h| h.as_str())
                    .unwrap_or_default()
                    .to_string();
                (route.name_any(), host)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::simulated::SimulatedCluster;
    use crate::provisioning::workload::{ProbeScript, CONTAINER_NAME};
    use crate::domain::types::VolumeMode;
    use crate::router::tests::ScriptedProber;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{Container, Pod, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Op {
        Create(String),
        Label(String),
        Delete(String),
    }

    #[derive(Default)]
    struct RecordingAdmin {
        ops: Mutex<Vec<Op>>,
        live: Mutex<BTreeMap<String, String>>,
    }

    impl RecordingAdmin {
        fn count(&self, f: impl Fn(&Op) -> bool) -> usize {
            self.ops.lock().iter().filter(|op| f(op)).count()
        }
    }

    #[async_trait]
    impl RouteAdmin for RecordingAdmin {
        async fn create_route(&self, _namespace: &str, route: &RouteSpec) -> Result<()> {
            self.ops.lock().push(Op::Create(route.name.clone()));
            self.live.lock().insert(route.name.clone(), route.host.clone());
            Ok(())
        }

        async fn label_route(&self, _namespace: &str, name: &str, _labels: &BTreeMap<String, String>) -> Result<()> {
            self.ops.lock().push(Op::Label(name.to_string()));
            Ok(())
        }

        async fn delete_route(&self, namespace: &str, name: &str) -> Result<()> {
            self.ops.lock().push(Op::Delete(name.to_string()));
            self.live
                .lock()
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| Error::not_found("Route", format!("{}/{}", namespace, name)))
        }

        async fn list_routes(&self, _namespace: &str) -> Result<Vec<(String, String)>> {
            Ok(self.live.lock().clone().into_iter().collect())
        }
    }

    const NS: &str = "routers";

    async fn cluster_with_router() -> SimulatedCluster {
        let cluster = SimulatedCluster::new().with_nodes(["node-a"]);
        let router = Pod {
            metadata: ObjectMeta {
                name: Some("router-haproxy-cfgmgr".into()),
                namespace: Some(NS.into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: CONTAINER_NAME.into(),
                    args: Some(vec![ProbeScript::Hold.render(VolumeMode::Filesystem)]),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            ..Default::default()
        };
        cluster.handle().create_pod(&router).await.unwrap();
        cluster
    }

    fn scenario(cluster: &SimulatedCluster, admin: Arc<RecordingAdmin>, prober: Arc<ScriptedProber>) -> RouterChurnScenario {
        let config = RouterConfig {
            namespace: NS.into(),
            ..Default::default()
        };
        RouterChurnScenario::new(config, cluster.handle(), admin, prober)
    }

    #[test]
    fn test_round_layout() {
        let steps = ChurnPlan::default().round(3);
        assert_eq!(steps.len(), 4);

        let insecure = &steps[0];
        assert_eq!(insecure.route.name, "hapcm-stress-insecure-3");
        assert_eq!(insecure.route.host, "stress.insecure-3.hapcm.test");
        assert_eq!(insecure.route.service, INSECURE_SERVICE);
        assert_eq!(insecure.route.labels.get("select").map(String::as_str), Some("haproxy-cfgmgr"));
        assert!(insecure.relabel.is_none());
        assert_eq!(insecure.route.target().uri(), "http://stress.insecure-3.hapcm.test:80/");

        let edge = &steps[1];
        assert_eq!(edge.route.name, "hapcm-stress-edge-3");
        assert_eq!(edge.route.service, INSECURE_SERVICE);
        assert!(edge.route.labels.is_empty());
        assert!(edge.relabel.is_some());

        assert_eq!(steps[2].route.service, SECURE_SERVICE);
        assert_eq!(steps[3].route.target().uri(), "https://stress.passthrough-3.hapcm.test:443/");
    }

    #[test]
    fn test_route_object() {
        let step = &ChurnPlan::default().round(0)[2];
        let object = route_object(NS, &step.route);
        assert_eq!(object.metadata.name.as_deref(), Some("hapcm-stress-reencrypt-0"));
        assert_eq!(object.data.pointer("/spec/tls/termination"), Some(&json!("reencrypt")));
        assert_eq!(object.data.pointer("/spec/to/name"), Some(&json!(SECURE_SERVICE)));

        let insecure = route_object(NS, &ChurnPlan::default().round(0)[0].route);
        assert!(insecure.data.pointer("/spec/tls").is_none());
        assert!(insecure.metadata.labels.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_churn() {
        let cluster = cluster_with_router().await;
        let admin = Arc::new(RecordingAdmin::default());
        let prober = Arc::new(ScriptedProber::default());
        prober.answer("stress.edge-5.hapcm.test", vec![Ok(503), Ok(503), Ok(200)]);

        scenario(&cluster, admin.clone(), prober.clone()).run().await.unwrap();

        assert_eq!(admin.count(|op| matches!(op, Op::Create(_))), 64);
        assert_eq!(admin.count(|op| matches!(op, Op::Label(_))), 48);
        assert_eq!(admin.count(|op| matches!(op, Op::Delete(_))), 64);
        assert!(admin.live.lock().is_empty());

        let requests = prober.requests.lock();
        assert!(requests[0].ends_with(":1936/healthz"));
        assert_eq!(requests[1], "http://insecure.hapcm.test:80/");
        // health, four static routes, 64 churned routes, two extra polls
        assert_eq!(requests.len(), 1 + 4 + 64 + 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_route_is_still_removed() {
        let cluster = cluster_with_router().await;
        let admin = Arc::new(RecordingAdmin::default());
        let prober = Arc::new(ScriptedProber::default());
        prober.answer("stress.reencrypt-0.hapcm.test", vec![Ok(500)]);

        let err = scenario(&cluster, admin.clone(), prober).run().await.unwrap_err();
        assert_matches!(err, Error::RouteUnavailable { ref uri, .. } if uri.contains("reencrypt-0"));

        let ops = admin.ops.lock().clone();
        assert_eq!(ops.last(), Some(&Op::Delete("hapcm-stress-reencrypt-0".into())));
        assert!(admin.live.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_router_fails() {
        let cluster = SimulatedCluster::new();
        let admin = Arc::new(RecordingAdmin::default());
        let prober = Arc::new(ScriptedProber::default());

        let err = scenario(&cluster, admin.clone(), prober).run().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(admin.ops.lock().is_empty());
    }
}
