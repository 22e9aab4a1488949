//! One aggregation pass worth of raw inventory.
//!
//! Nodes, node usage and autoscaler pools are fetched by three tasks that run
//! concurrently; each hands its result back through its join handle and only this
//! module assembles the combined [`Inventory`]. A failed source becomes its empty
//! default plus a [`Degraded`] warning.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Node;
use kview_core::quantity::{parse_memory, parse_usage_cpu};
use kview_kubehub::{ClusterQuery, QueryKind, QueryResult, RawUsage, UsageSample};
use rustc_hash::FxHashMap;
use tokio::task::JoinError;
use tracing::{debug, info};

use crate::{degrade, Degraded, Report};

/// Live usage, normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Usage {
    pub cpu: f64,
    pub memory: u64,
}

impl Usage {
    /// Sum of all entries (containers for pods, a single entry for nodes).
    pub fn sum(entries: &[RawUsage]) -> Self {
        entries.iter().fold(Usage::default(), |acc, u| Usage {
            cpu: acc.cpu + parse_usage_cpu(&u.cpu),
            memory: acc.memory.saturating_add(parse_memory(&u.memory)),
        })
    }
}

pub type NodeUsage = FxHashMap<String, Usage>;

pub fn node_usage_index(samples: &[UsageSample]) -> NodeUsage {
    samples.iter().map(|s| (s.name.clone(), Usage::sum(&s.usage))).collect()
}

#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub nodes: Vec<Node>,
    pub usage: NodeUsage,
    pub pools: Vec<String>,
}

/// Resolve a sub-fetch outcome to its value, or to `T::default()` plus a warning.
pub(crate) fn settle<T: Default>(kind: QueryKind, joined: Result<QueryResult<T>, JoinError>, warnings: &mut Vec<Degraded>) -> T {
    let reason = match joined {
        Ok(Ok(v)) => return v,
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("task failed: {}", e),
    };
    degrade(kind, reason, warnings);
    T::default()
}

/// Fan out the three inventory queries and join all of them.
pub async fn gather(query: Arc<dyn ClusterQuery>) -> Report<Inventory> {
    let t0 = Instant::now();
    debug!("inventory: fan-out start");
    let nodes = tokio::spawn({
        let q = Arc::clone(&query);
        async move { q.nodes().await }
    });
    let usage = tokio::spawn({
        let q = Arc::clone(&query);
        async move { q.node_usage().await }
    });
    let pools = tokio::spawn(async move { query.node_pools().await });
    let (nodes, usage, pools) = tokio::join!(nodes, usage, pools);

    let mut warnings = Vec::new();
    let nodes = settle(QueryKind::Nodes, nodes, &mut warnings);
    let usage = node_usage_index(&settle(QueryKind::NodeUsage, usage, &mut warnings));
    let pools = settle(QueryKind::NodePools, pools, &mut warnings);
    info!(nodes = nodes.len(), usage = usage.len(), pools = pools.len(), degraded = warnings.len(), took_ms = %t0.elapsed().as_millis(), "inventory: gathered");
    Report::new(Inventory { nodes, usage, pools }, warnings)
}
