//! kview kubehub: the control-plane query capability.
//!
//! The aggregation engine only sees the [`ClusterQuery`] trait. [`KubeQuery`] backs it
//! with kube-rs against a kubeconfig context; [`StaticQuery`] serves canned records for
//! tests and offline use.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use k8s_openapi::api::{
    apps::v1::Deployment,
    core::v1::{Namespace, Node, Pod},
};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use kview_core::ContextInfo;
use metrics::histogram;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Context name used when the kubeconfig cannot tell us the current one.
pub const FALLBACK_CONTEXT: &str = "default";

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("kube: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubeconfig: {0}")]
    Config(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type QueryResult<T> = Result<T, QueryError>;

/// Which query a result (or failure) belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Nodes,
    NodeUsage,
    NodePools,
    Pods,
    PodUsage,
    Namespaces,
    Deployments,
    Describe,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Nodes => "nodes",
            QueryKind::NodeUsage => "node_usage",
            QueryKind::NodePools => "node_pools",
            QueryKind::Pods => "pods",
            QueryKind::PodUsage => "pod_usage",
            QueryKind::Namespaces => "namespaces",
            QueryKind::Deployments => "deployments",
            QueryKind::Describe => "describe",
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Unparsed usage figures as reported by the metrics API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawUsage {
    pub cpu: String,
    pub memory: String,
}

/// One metrics object: a node (single usage entry) or a pod (one entry per container).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageSample {
    pub namespace: Option<String>,
    pub name: String,
    pub usage: Vec<RawUsage>,
}

impl UsageSample {
    pub fn node(name: &str, cpu: &str, memory: &str) -> Self {
        Self { namespace: None, name: name.to_string(), usage: vec![RawUsage { cpu: cpu.to_string(), memory: memory.to_string() }] }
    }

    pub fn pod(namespace: &str, name: &str, containers: &[(&str, &str)]) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
            usage: containers.iter().map(|(c, m)| RawUsage { cpu: c.to_string(), memory: m.to_string() }).collect(),
        }
    }
}

/// Pod listing scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodScope {
    All,
    Node(String),
}

impl PodScope {
    pub fn field_selector(&self) -> Option<String> {
        match self {
            PodScope::All => None,
            PodScope::Node(n) => Some(format!("spec.nodeName={}", n)),
        }
    }
}

/// Object to render in text form for a detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescribeTarget {
    Node { name: String },
    Pod { namespace: String, name: String },
}

/// Opaque control-plane capability. Every call either returns records or fails.
#[async_trait::async_trait]
pub trait ClusterQuery: Send + Sync {
    async fn nodes(&self) -> QueryResult<Vec<Node>>;
    async fn node_usage(&self) -> QueryResult<Vec<UsageSample>>;
    /// Names of autoscaler-managed node pools.
    async fn node_pools(&self) -> QueryResult<Vec<String>>;
    async fn pods(&self, scope: &PodScope) -> QueryResult<Vec<Pod>>;
    async fn pod_usage(&self) -> QueryResult<Vec<UsageSample>>;
    async fn namespaces(&self) -> QueryResult<Vec<Namespace>>;
    async fn deployments(&self, namespace: &str) -> QueryResult<Vec<Deployment>>;
    async fn describe(&self, target: &DescribeTarget) -> QueryResult<String>;
}

// ----------------- kubeconfig helpers -----------------

/// Current kubeconfig context, or [`FALLBACK_CONTEXT`] when it cannot be determined.
pub fn current_context() -> String {
    match Kubeconfig::read() {
        Ok(kc) => kc.current_context.unwrap_or_else(|| FALLBACK_CONTEXT.to_string()),
        Err(e) => {
            error!(error = %e, "failed to read current context");
            FALLBACK_CONTEXT.to_string()
        }
    }
}

/// All contexts in the kubeconfig, flagged with the current one.
pub fn list_contexts() -> QueryResult<Vec<ContextInfo>> {
    let kc = Kubeconfig::read().map_err(|e| QueryError::Config(e.to_string()))?;
    let current = kc.current_context.clone();
    Ok(kc
        .contexts
        .iter()
        .map(|c| ContextInfo { name: c.name.clone(), current: current.as_deref() == Some(c.name.as_str()) })
        .collect())
}

// ----------------- kube-rs implementation -----------------

const METRICS_GROUP: &str = "metrics.k8s.io";
const METRICS_VERSION: &str = "v1beta1";
const NODEPOOL_GROUP: &str = "karpenter.sh";
const NODEPOOL_VERSION: &str = "v1";

fn resource(group: &str, version: &str, kind: &str, plural: &str) -> ApiResource {
    let gvk = GroupVersionKind { group: group.to_string(), version: version.to_string(), kind: kind.to_string() };
    ApiResource::from_gvk_with_plural(&gvk, plural)
}

fn raw_usage(v: &serde_json::Value) -> RawUsage {
    let field = |k: &str| v.get(k).and_then(|x| x.as_str()).unwrap_or("0").to_string();
    RawUsage { cpu: field("cpu"), memory: field("memory") }
}

fn node_sample(obj: &DynamicObject) -> Option<UsageSample> {
    let name = obj.metadata.name.clone()?;
    let usage = obj.data.get("usage").map(raw_usage).into_iter().collect();
    Some(UsageSample { namespace: None, name, usage })
}

fn pod_sample(obj: &DynamicObject) -> Option<UsageSample> {
    let name = obj.metadata.name.clone()?;
    let usage = obj
        .data
        .get("containers")
        .and_then(|c| c.as_array())
        .map(|cs| cs.iter().filter_map(|c| c.get("usage")).map(raw_usage).collect())
        .unwrap_or_default();
    Some(UsageSample { namespace: obj.metadata.namespace.clone(), name, usage })
}

/// kube-rs backed queries bound to one kubeconfig context.
pub struct KubeQuery {
    client: Client,
    context: String,
}

impl KubeQuery {
    /// Build a client for `context`, or for the current context when `None`.
    pub async fn for_context(context: Option<&str>) -> QueryResult<Self> {
        let config = match context {
            Some(name) => {
                let opts = KubeConfigOptions { context: Some(name.to_string()), ..Default::default() };
                kube::Config::from_kubeconfig(&opts).await.map_err(|e| QueryError::Config(e.to_string()))?
            }
            None => kube::Config::infer().await.map_err(|e| QueryError::Config(e.to_string()))?,
        };
        let client = Client::try_from(config)?;
        let context = context.map(|s| s.to_string()).unwrap_or_else(current_context);
        info!(context = %context, "kube client ready");
        Ok(Self { client, context })
    }

    pub fn context(&self) -> &str { &self.context }

    fn observe(kind: QueryKind, t0: Instant) {
        histogram!("kube_query_ms", t0.elapsed().as_secs_f64() * 1000.0, "query" => kind.as_str());
    }
}

#[async_trait::async_trait]
impl ClusterQuery for KubeQuery {
    async fn nodes(&self) -> QueryResult<Vec<Node>> {
        let t0 = Instant::now();
        let api: Api<Node> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        Self::observe(QueryKind::Nodes, t0);
        debug!(count = list.items.len(), "nodes listed");
        Ok(list.items)
    }

    async fn node_usage(&self) -> QueryResult<Vec<UsageSample>> {
        let t0 = Instant::now();
        let ar = resource(METRICS_GROUP, METRICS_VERSION, "NodeMetrics", "nodes");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api.list(&ListParams::default()).await?;
        Self::observe(QueryKind::NodeUsage, t0);
        Ok(list.items.iter().filter_map(node_sample).collect())
    }

    async fn node_pools(&self) -> QueryResult<Vec<String>> {
        let t0 = Instant::now();
        let ar = resource(NODEPOOL_GROUP, NODEPOOL_VERSION, "NodePool", "nodepools");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api.list(&ListParams::default()).await?;
        Self::observe(QueryKind::NodePools, t0);
        let pools: Vec<String> = list.items.into_iter().filter_map(|p| p.metadata.name).collect();
        if pools.is_empty() {
            warn!("no autoscaler node pools found");
        } else {
            info!(pools = ?pools, "autoscaler node pools");
        }
        Ok(pools)
    }

    async fn pods(&self, scope: &PodScope) -> QueryResult<Vec<Pod>> {
        let t0 = Instant::now();
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut lp = ListParams::default();
        if let Some(fs) = scope.field_selector() {
            lp = lp.fields(&fs);
        }
        let list = api.list(&lp).await?;
        Self::observe(QueryKind::Pods, t0);
        debug!(scope = ?scope, count = list.items.len(), "pods listed");
        Ok(list.items)
    }

    async fn pod_usage(&self) -> QueryResult<Vec<UsageSample>> {
        let t0 = Instant::now();
        let ar = resource(METRICS_GROUP, METRICS_VERSION, "PodMetrics", "pods");
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api.list(&ListParams::default()).await?;
        Self::observe(QueryKind::PodUsage, t0);
        Ok(list.items.iter().filter_map(pod_sample).collect())
    }

    async fn namespaces(&self) -> QueryResult<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn deployments(&self, namespace: &str) -> QueryResult<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn describe(&self, target: &DescribeTarget) -> QueryResult<String> {
        let text = match target {
            DescribeTarget::Node { name } => {
                let api: Api<Node> = Api::all(self.client.clone());
                serde_json::to_string_pretty(&api.get(name).await?)?
            }
            DescribeTarget::Pod { namespace, name } => {
                let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
                serde_json::to_string_pretty(&api.get(name).await?)?
            }
        };
        Ok(text)
    }
}

// ----------------- In-memory implementation -----------------

/// Canned records with per-query failure injection and a call log.
#[derive(Default)]
pub struct StaticQuery {
    pub nodes: Vec<Node>,
    pub node_usage: Vec<UsageSample>,
    pub node_pools: Vec<String>,
    pub pods: Vec<Pod>,
    pub pod_usage: Vec<UsageSample>,
    pub namespaces: Vec<Namespace>,
    pub deployments: Vec<Deployment>,
    /// Queries that fail with [`QueryError::Unavailable`].
    pub failing: Vec<QueryKind>,
    calls: Mutex<Vec<QueryKind>>,
}

impl StaticQuery {
    pub fn new() -> Self { Self::default() }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self { self.nodes = nodes; self }
    pub fn with_node_usage(mut self, usage: Vec<UsageSample>) -> Self { self.node_usage = usage; self }
    pub fn with_node_pools(mut self, pools: Vec<String>) -> Self { self.node_pools = pools; self }
    pub fn with_pods(mut self, pods: Vec<Pod>) -> Self { self.pods = pods; self }
    pub fn with_pod_usage(mut self, usage: Vec<UsageSample>) -> Self { self.pod_usage = usage; self }
    pub fn with_namespaces(mut self, namespaces: Vec<Namespace>) -> Self { self.namespaces = namespaces; self }
    pub fn with_deployments(mut self, deployments: Vec<Deployment>) -> Self { self.deployments = deployments; self }
    pub fn failing(mut self, kind: QueryKind) -> Self { self.failing.push(kind); self }

    /// Every query issued so far, in call order.
    pub fn calls(&self) -> Vec<QueryKind> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: QueryKind) -> usize { self.calls().iter().filter(|k| **k == kind).count() }

    fn record(&self, kind: QueryKind) -> QueryResult<()> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(kind);
        }
        if self.failing.contains(&kind) {
            return Err(QueryError::Unavailable(format!("{} query failed", kind)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterQuery for StaticQuery {
    async fn nodes(&self) -> QueryResult<Vec<Node>> {
        self.record(QueryKind::Nodes)?;
        Ok(self.nodes.clone())
    }

    async fn node_usage(&self) -> QueryResult<Vec<UsageSample>> {
        self.record(QueryKind::NodeUsage)?;
        Ok(self.node_usage.clone())
    }

    async fn node_pools(&self) -> QueryResult<Vec<String>> {
        self.record(QueryKind::NodePools)?;
        Ok(self.node_pools.clone())
    }

    async fn pods(&self, scope: &PodScope) -> QueryResult<Vec<Pod>> {
        self.record(QueryKind::Pods)?;
        Ok(match scope {
            PodScope::All => self.pods.clone(),
            PodScope::Node(n) => self
                .pods
                .iter()
                .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(n.as_str()))
                .cloned()
                .collect(),
        })
    }

    async fn pod_usage(&self) -> QueryResult<Vec<UsageSample>> {
        self.record(QueryKind::PodUsage)?;
        Ok(self.pod_usage.clone())
    }

    async fn namespaces(&self) -> QueryResult<Vec<Namespace>> {
        self.record(QueryKind::Namespaces)?;
        Ok(self.namespaces.clone())
    }

    async fn deployments(&self, namespace: &str) -> QueryResult<Vec<Deployment>> {
        self.record(QueryKind::Deployments)?;
        Ok(self.deployments.iter().filter(|d| d.metadata.namespace.as_deref() == Some(namespace)).cloned().collect())
    }

    async fn describe(&self, target: &DescribeTarget) -> QueryResult<String> {
        self.record(QueryKind::Describe)?;
        match target {
            DescribeTarget::Node { name } => {
                let node = self
                    .nodes
                    .iter()
                    .find(|n| n.metadata.name.as_deref() == Some(name.as_str()))
                    .ok_or_else(|| QueryError::NotFound(format!("node {}", name)))?;
                Ok(serde_json::to_string_pretty(node)?)
            }
            DescribeTarget::Pod { namespace, name } => {
                let pod = self
                    .pods
                    .iter()
                    .find(|p| p.metadata.namespace.as_deref() == Some(namespace.as_str()) && p.metadata.name.as_deref() == Some(name.as_str()))
                    .ok_or_else(|| QueryError::NotFound(format!("pod {}/{}", namespace, name)))?;
                Ok(serde_json::to_string_pretty(pod)?)
            }
        }
    }
}
