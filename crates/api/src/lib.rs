//! kview engine façade.
//!
//! [`Engine`] owns the cache store, the active kube context and its query
//! capability, and exposes the read operations front ends consume. Reads that can
//! only degrade return a [`Report`]; the few that can fail outright return
//! [`ApiResult`].

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use arc_swap::ArcSwap;
use chrono::{DateTime, Local, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Namespace;
use kview_core::{CacheKind, ContextInfo, DeploymentRecord, NamespaceRecord, NodeGroup, NodeRecord, PodRecord};
use kview_kubehub::{ClusterQuery, DescribeTarget, KubeQuery, PodScope, QueryError, QueryKind};
use kview_persist::{CacheSettings, CacheStore};
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub mod aggregate;
pub mod inventory;
pub mod pods;

/// A source that failed during a pass and was replaced by its empty default.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Degraded {
    pub source: QueryKind,
    pub reason: String,
}

impl std::fmt::Display for Degraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{} unavailable: {}", self.source, self.reason) }
}

/// Result of a read: the items, any degraded sources, and whether it came from cache.
#[derive(Debug, Clone, Serialize)]
pub struct Report<T> {
    pub items: T,
    pub warnings: Vec<Degraded>,
    pub cached: bool,
}

impl<T> Report<T> {
    pub fn new(items: T, warnings: Vec<Degraded>) -> Self { Self { items, warnings, cached: false } }
    pub fn from_cache(items: T) -> Self { Self { items, warnings: Vec::new(), cached: true } }
    pub fn is_degraded(&self, source: QueryKind) -> bool { self.warnings.iter().any(|w| w.source == source) }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("context: {0}")]
    Context(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

struct Active {
    context: String,
    query: Arc<dyn ClusterQuery>,
}

/// Cached, context-scoped view over one cluster.
pub struct Engine {
    active: ArcSwap<Active>,
    cache: Mutex<CacheStore>,
}

/// Log and count a failed source, and record it on the pass.
pub(crate) fn degrade(kind: QueryKind, reason: String, warnings: &mut Vec<Degraded>) {
    error!(source = %kind, error = %reason, "fetch failed; using empty default");
    counter!("degraded_fetch_total", 1u64, "source" => kind.as_str());
    warnings.push(Degraded { source: kind, reason });
}

fn namespace_record(ns: &Namespace) -> NamespaceRecord {
    NamespaceRecord {
        name: ns.metadata.name.clone().unwrap_or_default(),
        phase: ns.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string()),
    }
}

fn deployment_record(d: &Deployment) -> DeploymentRecord {
    let status = d.status.as_ref();
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let wanted = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    DeploymentRecord {
        name: d.metadata.name.clone().unwrap_or_default(),
        ready: format!("{}/{}", ready, wanted),
        available: status.and_then(|s| s.available_replicas).unwrap_or(0),
    }
}

fn mark_active(contexts: Vec<ContextInfo>, active: &str) -> Vec<ContextInfo> {
    contexts.into_iter().map(|c| ContextInfo { current: c.name == active, ..c }).collect()
}

/// Local wall-clock rendering of a cache timestamp.
fn local_stamp(ts: f64) -> Option<String> {
    let secs = ts.floor() as i64;
    let nanos = ((ts - ts.floor()) * 1e9) as u32;
    let utc: DateTime<Utc> = DateTime::from_timestamp(secs, nanos)?;
    Some(utc.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
}

impl Engine {
    pub fn new(context: impl Into<String>, query: Arc<dyn ClusterQuery>, settings: CacheSettings) -> Self {
        let context = context.into();
        let cache = CacheStore::load(settings, &context);
        info!(context = %context, cache = cache.is_enabled(), ttl_secs = cache.ttl().as_secs(), "engine ready");
        Self { active: ArcSwap::from_pointee(Active { context, query }), cache: Mutex::new(cache) }
    }

    /// Engine over the kubeconfig context `context` (or the current one).
    pub async fn connect(context: Option<&str>, settings: CacheSettings) -> ApiResult<Self> {
        let query = KubeQuery::for_context(context).await?;
        let context = query.context().to_string();
        Ok(Self::new(context, Arc::new(query), settings))
    }

    pub fn context(&self) -> String { self.active.load().context.clone() }

    fn cache(&self) -> MutexGuard<'_, CacheStore> { self.cache.lock().unwrap_or_else(|p| p.into_inner()) }

    /// All node groups with summed totals, sorted by name. Every group's roster is
    /// written through to the cache as a side effect.
    pub async fn node_groups(&self) -> Report<Vec<NodeGroup>> {
        let t0 = Instant::now();
        let active = self.active.load_full();
        let inv = inventory::gather(Arc::clone(&active.query)).await;
        let now = Utc::now();
        let groups = aggregate::summarize(&inv.items.nodes, &inv.items.usage, now);
        if !inv.is_degraded(QueryKind::Nodes) {
            self.write_rosters(&active.context, &inv.items, None, now);
        }
        for pool in &inv.items.pools {
            let name = aggregate::GroupKey::Autoscaled(pool.clone()).to_string();
            if !groups.iter().any(|g| g.name == name) {
                debug!(pool = %pool, "autoscaler pool has no nodes");
            }
        }
        info!(context = %active.context, groups = groups.len(), degraded = inv.warnings.len(), took_ms = %t0.elapsed().as_millis(), "api: node_groups ok");
        Report::new(groups, inv.warnings)
    }

    /// Write every group's roster from one pass with a single flush. Cached groups
    /// (and `requested`) with no members in this pass get an empty roster, so a
    /// relabeled node is never listed under its old group.
    fn write_rosters(
        &self,
        context: &str,
        inv: &inventory::Inventory,
        requested: Option<&str>,
        now: DateTime<Utc>,
    ) -> BTreeMap<String, Vec<NodeRecord>> {
        let rosters = aggregate::rosters(&inv.nodes, &inv.usage, now);
        let mut cache = self.cache();
        let mut emptied: BTreeSet<String> = cache.keys(context, CacheKind::Nodes).into_iter().collect();
        emptied.extend(requested.map(str::to_string));
        emptied.retain(|k| !rosters.contains_key(k));
        let entries = rosters
            .iter()
            .map(|(k, v)| (k.clone(), v.as_slice()))
            .chain(emptied.into_iter().map(|k| (k, &[][..])));
        cache.put_many(context, CacheKind::Nodes, entries);
        rosters
    }

    /// Nodes currently classified into `group`, served from cache while fresh.
    pub async fn nodes(&self, group: &str) -> Report<Vec<NodeRecord>> {
        let t0 = Instant::now();
        let active = self.active.load_full();
        let hit = self.cache().get::<NodeRecord>(&active.context, CacheKind::Nodes, group);
        if let Some(items) = hit {
            debug!(group = %group, count = items.len(), "api: nodes from cache");
            return Report::from_cache(items);
        }
        let inv = inventory::gather(Arc::clone(&active.query)).await;
        if inv.is_degraded(QueryKind::Nodes) {
            return Report::new(Vec::new(), inv.warnings);
        }
        let mut rosters = self.write_rosters(&active.context, &inv.items, Some(group), Utc::now());
        let items = rosters.remove(group).unwrap_or_default();
        info!(group = %group, count = items.len(), took_ms = %t0.elapsed().as_millis(), "api: nodes ok");
        Report::new(items, inv.warnings)
    }

    /// Pods scheduled on `node`, served from cache while fresh.
    pub async fn pods(&self, node: &str) -> Report<Vec<PodRecord>> {
        let t0 = Instant::now();
        let active = self.active.load_full();
        let hit = self.cache().get::<PodRecord>(&active.context, CacheKind::Pods, node);
        if let Some(items) = hit {
            debug!(node = %node, count = items.len(), "api: pods from cache");
            return Report::from_cache(items);
        }
        let mut warnings = Vec::new();
        let listed = match active.query.pods(&PodScope::Node(node.to_string())).await {
            Ok(p) => p,
            Err(e) => {
                degrade(QueryKind::Pods, e.to_string(), &mut warnings);
                return Report::new(Vec::new(), warnings);
            }
        };
        let usage = self.pod_usage(&active, &mut warnings).await;
        let items = pods::merge(&listed, &usage, false, Utc::now());
        self.cache().put(&active.context, CacheKind::Pods, node, &items);
        info!(node = %node, count = items.len(), took_ms = %t0.elapsed().as_millis(), "api: pods ok");
        Report::new(items, warnings)
    }

    /// Pods in any namespace whose name or namespace contains `pattern`, ignoring case.
    /// Never cached; each record keeps its raw pod object.
    pub async fn search_pods(&self, pattern: &str) -> Report<Vec<PodRecord>> {
        let t0 = Instant::now();
        let active = self.active.load_full();
        let mut warnings = Vec::new();
        let listed = match active.query.pods(&PodScope::All).await {
            Ok(p) => p,
            Err(e) => {
                degrade(QueryKind::Pods, e.to_string(), &mut warnings);
                return Report::new(Vec::new(), warnings);
            }
        };
        let needle = pattern.to_lowercase();
        let hits: Vec<_> = listed.into_iter().filter(|p| pods::matches(p, &needle)).collect();
        let usage = self.pod_usage(&active, &mut warnings).await;
        let items = pods::merge(&hits, &usage, true, Utc::now());
        info!(pattern = %pattern, hits = items.len(), took_ms = %t0.elapsed().as_millis(), "api: search_pods ok");
        Report::new(items, warnings)
    }

    async fn pod_usage(&self, active: &Active, warnings: &mut Vec<Degraded>) -> pods::PodUsage {
        match active.query.pod_usage().await {
            Ok(samples) => pods::pod_usage_index(&samples),
            Err(e) => {
                degrade(QueryKind::PodUsage, e.to_string(), warnings);
                pods::PodUsage::default()
            }
        }
    }

    pub async fn namespaces(&self) -> Report<Vec<NamespaceRecord>> {
        let active = self.active.load_full();
        let mut warnings = Vec::new();
        let items = match active.query.namespaces().await {
            Ok(list) => list.iter().map(namespace_record).collect(),
            Err(e) => {
                degrade(QueryKind::Namespaces, e.to_string(), &mut warnings);
                Vec::new()
            }
        };
        Report::new(items, warnings)
    }

    pub async fn deployments(&self, namespace: &str) -> Report<Vec<DeploymentRecord>> {
        let active = self.active.load_full();
        let mut warnings = Vec::new();
        let items = match active.query.deployments(namespace).await {
            Ok(list) => list.iter().map(deployment_record).collect(),
            Err(e) => {
                degrade(QueryKind::Deployments, e.to_string(), &mut warnings);
                Vec::new()
            }
        };
        Report::new(items, warnings)
    }

    /// Pretty-printed live object.
    pub async fn describe(&self, target: &DescribeTarget) -> ApiResult<String> {
        let active = self.active.load_full();
        active.query.describe(target).await.map_err(|e| {
            error!(target = ?target, error = %e, "describe failed");
            ApiError::from(e)
        })
    }

    /// Kubeconfig contexts, with `current` marking the engine's active one.
    pub fn contexts(&self) -> ApiResult<Vec<ContextInfo>> {
        Ok(mark_active(kview_kubehub::list_contexts()?, &self.context()))
    }

    /// Rebind to kubeconfig context `name`. The previous context stays active on failure.
    pub async fn switch_context(&self, name: &str) -> ApiResult<()> {
        let query = KubeQuery::for_context(Some(name)).await.map_err(|e| {
            warn!(context = %name, error = %e, "context switch failed");
            ApiError::Context(format!("{}: {}", name, e))
        })?;
        self.switch_context_with(name, Arc::new(query));
        Ok(())
    }

    /// Rebind to `name` using an already built query capability.
    pub fn switch_context_with(&self, name: &str, query: Arc<dyn ClusterQuery>) {
        self.cache().ensure_context(name);
        self.active.store(Arc::new(Active { context: name.to_string(), query }));
        info!(context = %name, "context switched");
    }

    /// Local time the entry was fetched (`YYYY-MM-DD HH:MM:SS`), or `Never`.
    pub fn last_updated(&self, kind: CacheKind, key: &str) -> String {
        let context = self.context();
        self.cache()
            .fetched_at(&context, kind, key)
            .and_then(local_stamp)
            .unwrap_or_else(|| "Never".to_string())
    }
}
