//! kview core types: display records handed to front ends, plus the quantity
//! and age helpers shared by the aggregation paths.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod age;
pub mod quantity;

pub use age::{age_at, age_since};
pub use quantity::{Quantity, QuantityError, Unit};

/// Node condition summary derived from the `Ready` condition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
    Unknown,
}

impl std::fmt::Display for Readiness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Readiness::Ready => "Ready",
            Readiness::NotReady => "NotReady",
            Readiness::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Rendered used/allocatable/capacity triple for one node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeResource {
    pub used: String,
    pub allocatable: String,
    pub capacity: String,
}

/// One row of a node-group roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeRecord {
    pub name: String,
    pub status: Readiness,
    pub age: String,
    pub instance_type: String,
    pub cpu: NodeResource,
    pub memory: NodeResource,
    pub group_name: String,
}

/// Rendered totals summed over the members of a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupResource {
    pub used: String,
    pub allocatable: String,
    /// Summed capacity.
    pub total: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeGroup {
    pub name: String,
    pub count: usize,
    /// Age of the oldest member.
    pub age: String,
    pub cpu: GroupResource,
    pub memory: GroupResource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PodRecord {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub phase: String,
    pub age: String,
    pub cpu: String,
    pub memory: String,
    /// Unmodified source object, kept on search results for later detail lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub name: String,
    pub phase: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    /// `<readyReplicas>/<replicas>`
    pub ready: String,
    pub available: i32,
}

/// A kubeconfig context as offered to a context picker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContextInfo {
    pub name: String,
    pub current: bool,
}

/// The two record kinds the cache holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    /// Keyed by node-group name.
    Nodes,
    /// Keyed by node name.
    Pods,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Nodes => "nodes",
            CacheKind::Pods => "pods",
        }
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&CacheKind::Nodes).unwrap(), "\"nodes\"");
        assert_eq!(serde_json::to_string(&CacheKind::Pods).unwrap(), "\"pods\"");
        let k: CacheKind = serde_json::from_str("\"pods\"").unwrap();
        assert_eq!(k, CacheKind::Pods);
    }

    #[test]
    fn pod_record_omits_missing_raw() {
        let p = PodRecord {
            namespace: "ns".into(),
            name: "p".into(),
            node: "n1".into(),
            phase: "Running".into(),
            age: "1m".into(),
            cpu: "0m".into(),
            memory: "0.0B".into(),
            raw: None,
        };
        let v = serde_json::to_value(&p).unwrap();
        assert!(v.get("raw").is_none());
    }
}
