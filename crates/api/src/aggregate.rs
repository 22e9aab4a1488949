//! Node classification and per-group aggregation.
//!
//! Group membership is always derived from a node's current labels through
//! [`classify`]; the group list and the per-group rosters share that function.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kview_core::{
    age_since,
    quantity::{format_cpu, format_memory, parse_cpu, parse_memory},
    GroupResource, NodeGroup, NodeRecord, NodeResource, Readiness,
};

use crate::inventory::{NodeUsage, Usage};

pub const MANAGED_POOL_LABEL: &str = "eks.amazonaws.com/nodegroup";
pub const AUTOSCALER_POOL_LABEL: &str = "karpenter.sh/nodepool";
pub const RESERVED_LABEL: &str = "reserved";
pub const RESERVED_VALUE: &str = "core-services";
pub const INSTANCE_TYPE_LABEL: &str = "node.kubernetes.io/instance-type";

type Labels = BTreeMap<String, String>;

/// Logical node group. Renders as the group name shown to operators.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GroupKey {
    Managed(String),
    Autoscaled(String),
    Reserved,
    Worker,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupKey::Managed(pool) => write!(f, "eks:{}", pool),
            GroupKey::Autoscaled(pool) => write!(f, "karpenter:{}", pool),
            GroupKey::Reserved => f.write_str(RESERVED_VALUE),
            GroupKey::Worker => f.write_str("worker"),
        }
    }
}

struct Rule {
    label: &'static str,
    group: fn(&str) -> Option<GroupKey>,
}

fn managed(v: &str) -> Option<GroupKey> { Some(GroupKey::Managed(v.to_string())) }
fn autoscaled(v: &str) -> Option<GroupKey> { Some(GroupKey::Autoscaled(v.to_string())) }
fn reserved(v: &str) -> Option<GroupKey> { (v == RESERVED_VALUE).then_some(GroupKey::Reserved) }

/// Evaluated in order; first match wins, otherwise [`GroupKey::Worker`].
static RULES: [Rule; 3] = [
    Rule { label: MANAGED_POOL_LABEL, group: managed },
    Rule { label: AUTOSCALER_POOL_LABEL, group: autoscaled },
    Rule { label: RESERVED_LABEL, group: reserved },
];

/// Label value, with empty values treated as absent.
fn label<'a>(labels: Option<&'a Labels>, key: &str) -> Option<&'a str> {
    labels?.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

pub fn classify(labels: Option<&Labels>) -> GroupKey {
    RULES
        .iter()
        .find_map(|r| label(labels, r.label).and_then(r.group))
        .unwrap_or(GroupKey::Worker)
}

pub fn classify_node(node: &Node) -> GroupKey { classify(node.metadata.labels.as_ref()) }

pub fn readiness(node: &Node) -> Readiness {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"));
    match ready {
        Some(c) if c.status == "True" => Readiness::Ready,
        Some(_) => Readiness::NotReady,
        None => Readiness::Unknown,
    }
}

/// Normalized per-node figures from status plus live usage.
#[derive(Debug, Clone, Default)]
struct Facts {
    cpu_capacity: f64,
    cpu_allocatable: f64,
    mem_capacity: u64,
    mem_allocatable: u64,
    used: Usage,
    created: Option<DateTime<Utc>>,
}

fn node_name(node: &Node) -> &str { node.metadata.name.as_deref().unwrap_or("") }

fn quantity<'a>(map: Option<&'a BTreeMap<String, Quantity>>, key: &str) -> Option<&'a str> {
    map?.get(key).map(|q| q.0.as_str())
}

fn facts(node: &Node, usage: &NodeUsage) -> Facts {
    let status = node.status.as_ref();
    let capacity = status.and_then(|s| s.capacity.as_ref());
    let allocatable = status.and_then(|s| s.allocatable.as_ref());
    Facts {
        cpu_capacity: quantity(capacity, "cpu").map(parse_cpu).unwrap_or(0.0),
        cpu_allocatable: quantity(allocatable, "cpu").map(parse_cpu).unwrap_or(0.0),
        mem_capacity: quantity(capacity, "memory").map(parse_memory).unwrap_or(0),
        mem_allocatable: quantity(allocatable, "memory").map(parse_memory).unwrap_or(0),
        used: usage.get(node_name(node)).copied().unwrap_or_default(),
        created: node.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

fn render_age(created: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    created.map(|c| age_since(c, now)).unwrap_or_else(|| "N/A".to_string())
}

fn record(node: &Node, f: &Facts, group: &GroupKey, now: DateTime<Utc>) -> NodeRecord {
    NodeRecord {
        name: node_name(node).to_string(),
        status: readiness(node),
        age: render_age(f.created, now),
        instance_type: label(node.metadata.labels.as_ref(), INSTANCE_TYPE_LABEL).unwrap_or("Unknown").to_string(),
        cpu: NodeResource {
            used: format_cpu(f.used.cpu),
            allocatable: format_cpu(f.cpu_allocatable),
            capacity: format_cpu(f.cpu_capacity),
        },
        memory: NodeResource {
            used: format_memory(f.used.memory as f64),
            allocatable: format_memory(f.mem_allocatable as f64),
            capacity: format_memory(f.mem_capacity as f64),
        },
        group_name: group.to_string(),
    }
}

#[derive(Debug, Default)]
struct Totals {
    count: usize,
    cpu_capacity: f64,
    cpu_allocatable: f64,
    cpu_used: f64,
    mem_capacity: u64,
    mem_allocatable: u64,
    mem_used: u64,
    oldest: Option<DateTime<Utc>>,
}

impl Totals {
    fn add(&mut self, f: &Facts) {
        self.count += 1;
        self.cpu_capacity += f.cpu_capacity;
        self.cpu_allocatable += f.cpu_allocatable;
        self.cpu_used += f.used.cpu;
        self.mem_capacity = self.mem_capacity.saturating_add(f.mem_capacity);
        self.mem_allocatable = self.mem_allocatable.saturating_add(f.mem_allocatable);
        self.mem_used = self.mem_used.saturating_add(f.used.memory);
        self.oldest = match (self.oldest, f.created) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Group list with summed totals, sorted by name (byte order).
pub fn summarize(nodes: &[Node], usage: &NodeUsage, now: DateTime<Utc>) -> Vec<NodeGroup> {
    let mut groups: BTreeMap<String, Totals> = BTreeMap::new();
    for node in nodes {
        groups.entry(classify_node(node).to_string()).or_default().add(&facts(node, usage));
    }
    groups
        .into_iter()
        .filter(|(_, t)| t.count > 0)
        .map(|(name, t)| NodeGroup {
            name,
            count: t.count,
            age: render_age(t.oldest, now),
            cpu: GroupResource {
                used: format_cpu(t.cpu_used),
                allocatable: format_cpu(t.cpu_allocatable),
                total: format_cpu(t.cpu_capacity),
            },
            memory: GroupResource {
                used: format_memory(t.mem_used as f64),
                allocatable: format_memory(t.mem_allocatable as f64),
                total: format_memory(t.mem_capacity as f64),
            },
        })
        .collect()
}

/// Every group's roster from one pass; members keep input order.
pub fn rosters(nodes: &[Node], usage: &NodeUsage, now: DateTime<Utc>) -> BTreeMap<String, Vec<NodeRecord>> {
    let mut out: BTreeMap<String, Vec<NodeRecord>> = BTreeMap::new();
    for n in nodes {
        let key = classify_node(n);
        let rec = record(n, &facts(n, usage), &key, now);
        out.entry(rec.group_name.clone()).or_default().push(rec);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn node(name: &str, lbls: &[(&str, &str)], cpu: &str, mem: &str, created: &str) -> Node {
        serde_json::from_value(json!({
            "metadata": { "name": name, "labels": labels(lbls), "creationTimestamp": created },
            "status": {
                "capacity": { "cpu": cpu, "memory": mem },
                "allocatable": { "cpu": cpu, "memory": mem },
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        }))
        .unwrap()
    }

    fn now() -> DateTime<Utc> { "2024-06-01T12:00:00Z".parse().unwrap() }

    #[test]
    fn precedence_is_managed_then_autoscaled_then_reserved() {
        let both = labels(&[(MANAGED_POOL_LABEL, "pool-a"), (RESERVED_LABEL, RESERVED_VALUE)]);
        assert_eq!(classify(Some(&both)), GroupKey::Managed("pool-a".into()));
        let auto = labels(&[(AUTOSCALER_POOL_LABEL, "spot"), (RESERVED_LABEL, RESERVED_VALUE)]);
        assert_eq!(classify(Some(&auto)).to_string(), "karpenter:spot");
        let res = labels(&[(RESERVED_LABEL, RESERVED_VALUE)]);
        assert_eq!(classify(Some(&res)).to_string(), "core-services");
    }

    #[test]
    fn unlabeled_or_unrelated_labels_are_workers() {
        assert_eq!(classify(None), GroupKey::Worker);
        assert_eq!(classify(Some(&labels(&[("team", "infra")]))), GroupKey::Worker);
        assert_eq!(classify(Some(&labels(&[(RESERVED_LABEL, "batch")]))), GroupKey::Worker);
        assert_eq!(classify(Some(&labels(&[(MANAGED_POOL_LABEL, "")]))), GroupKey::Worker);
    }

    #[test]
    fn readiness_from_conditions() {
        let mut n = node("n", &[], "1", "1Gi", "2024-06-01T00:00:00Z");
        assert_eq!(readiness(&n), Readiness::Ready);
        n.status.as_mut().unwrap().conditions.as_mut().unwrap()[0].status = "False".into();
        assert_eq!(readiness(&n), Readiness::NotReady);
        n.status.as_mut().unwrap().conditions = None;
        assert_eq!(readiness(&n), Readiness::Unknown);
    }

    #[test]
    fn groups_sum_members_and_sort_by_name() {
        let nodes = vec![
            node("w1", &[], "2", "4Gi", "2024-05-30T12:00:00Z"),
            node("a1", &[(MANAGED_POOL_LABEL, "pool-a")], "4", "8Gi", "2024-06-01T10:00:00Z"),
            node("w2", &[], "500m", "1Gi", "2024-06-01T11:59:00Z"),
        ];
        let mut usage = NodeUsage::default();
        usage.insert("w1".into(), Usage { cpu: 0.25, memory: 512 * 1024 * 1024 });
        let groups = summarize(&nodes, &usage, now());
        let names: Vec<_> = groups.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["eks:pool-a", "worker"]);

        let pool = &groups[0];
        assert_eq!((pool.count, pool.cpu.total.as_str(), pool.age.as_str()), (1, "4.0", "2h"));
        assert_eq!(pool.cpu.used, "0m");
        assert_eq!(pool.memory.used, "0.0B");

        let worker = &groups[1];
        assert_eq!(worker.count, 2);
        assert_eq!(worker.cpu.total, "2.5");
        assert_eq!(worker.cpu.used, "250m");
        assert_eq!(worker.memory.total, "5.0Gi");
        assert_eq!(worker.memory.used, "512.0Mi");
        // oldest member wins
        assert_eq!(worker.age, "2d");
    }

    #[test]
    fn sort_is_case_sensitive() {
        let nodes = vec![
            node("b", &[(MANAGED_POOL_LABEL, "beta")], "1", "1Gi", "2024-06-01T00:00:00Z"),
            node("a", &[(MANAGED_POOL_LABEL, "Alpha")], "1", "1Gi", "2024-06-01T00:00:00Z"),
            node("c", &[(RESERVED_LABEL, RESERVED_VALUE)], "1", "1Gi", "2024-06-01T00:00:00Z"),
        ];
        let names: Vec<_> = summarize(&nodes, &NodeUsage::default(), now()).into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["core-services", "eks:Alpha", "eks:beta"]);
    }

    #[test]
    fn summaries_are_deterministic() {
        let nodes = vec![
            node("w1", &[], "2", "4Gi", "2024-05-30T12:00:00Z"),
            node("k1", &[(AUTOSCALER_POOL_LABEL, "spot")], "8", "32Gi", "2024-06-01T11:00:00Z"),
        ];
        let usage = NodeUsage::default();
        let a = serde_json::to_string(&summarize(&nodes, &usage, now())).unwrap();
        let b = serde_json::to_string(&summarize(&nodes, &usage, now())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn roster_filter_uses_current_labels() {
        let mut nodes = vec![
            node("w1", &[], "2", "4Gi", "2024-06-01T11:00:00Z"),
            node("a1", &[(MANAGED_POOL_LABEL, "pool-a"), (INSTANCE_TYPE_LABEL, "m5.large")], "4", "8Gi", "2024-06-01T11:00:00Z"),
        ];
        let before = rosters(&nodes, &NodeUsage::default(), now());
        let pool = &before["eks:pool-a"];
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].name, "a1");
        assert_eq!(pool[0].instance_type, "m5.large");
        assert_eq!(pool[0].group_name, "eks:pool-a");
        assert_eq!(pool[0].cpu.capacity, "4.0");
        assert_eq!(pool[0].memory.allocatable, "8.0Gi");
        assert_eq!(pool[0].status, Readiness::Ready);

        // relabel: the same node now lands in the worker roster
        nodes[1].metadata.labels.as_mut().unwrap().remove(MANAGED_POOL_LABEL);
        let after = rosters(&nodes, &NodeUsage::default(), now());
        assert!(!after.contains_key("eks:pool-a"));
        let workers = &after["worker"];
        assert_eq!(workers.iter().map(|n| n.name.as_str()).collect::<Vec<_>>(), vec!["w1", "a1"]);
        assert_eq!(workers[0].instance_type, "Unknown");
    }

    #[test]
    fn rosters_agree_with_group_counts() {
        let nodes = vec![
            node("w1", &[], "2", "4Gi", "2024-06-01T11:00:00Z"),
            node("a1", &[(MANAGED_POOL_LABEL, "pool-a")], "4", "8Gi", "2024-06-01T11:00:00Z"),
            node("c1", &[(RESERVED_LABEL, RESERVED_VALUE)], "4", "8Gi", "2024-06-01T11:00:00Z"),
        ];
        let usage = NodeUsage::default();
        let all = rosters(&nodes, &usage, now());
        for g in summarize(&nodes, &usage, now()) {
            assert_eq!(all[&g.name].len(), g.count);
            assert!(all[&g.name].iter().all(|n| n.group_name == g.name));
        }
    }

    #[test]
    fn missing_status_and_timestamp_render_defaults() {
        let bare: Node = serde_json::from_value(json!({ "metadata": { "name": "bare" } })).unwrap();
        let groups = summarize(&[bare.clone()], &NodeUsage::default(), now());
        assert_eq!(groups[0].age, "N/A");
        assert_eq!(groups[0].cpu.total, "0m");
        let all = rosters(&[bare], &NodeUsage::default(), now());
        let recs = &all["worker"];
        assert_eq!(recs[0].status, Readiness::Unknown);
        assert_eq!(recs[0].memory.capacity, "0.0B");
    }
}
