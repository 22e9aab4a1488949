//! Pod listing merged with live usage.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kview_core::{
    age_since,
    quantity::{format_cpu, format_memory},
    PodRecord,
};
use kview_kubehub::UsageSample;
use rustc_hash::FxHashMap;
use tracing::warn;

use crate::inventory::Usage;

/// Usage keyed by `(namespace, name)`.
pub type PodUsage = FxHashMap<(String, String), Usage>;

pub fn pod_usage_index(samples: &[UsageSample]) -> PodUsage {
    samples
        .iter()
        .map(|s| ((s.namespace.clone().unwrap_or_default(), s.name.clone()), Usage::sum(&s.usage)))
        .collect()
}

fn namespace(pod: &Pod) -> &str { pod.metadata.namespace.as_deref().unwrap_or("") }
fn name(pod: &Pod) -> &str { pod.metadata.name.as_deref().unwrap_or("") }

/// Case-insensitive substring match on name or namespace; `needle` is already lowercased.
pub fn matches(pod: &Pod, needle: &str) -> bool {
    name(pod).to_lowercase().contains(needle) || namespace(pod).to_lowercase().contains(needle)
}

fn record(pod: &Pod, usage: &PodUsage, keep_raw: bool, now: DateTime<Utc>) -> PodRecord {
    let ns = namespace(pod);
    let n = name(pod);
    let used = usage.get(&(ns.to_string(), n.to_string())).copied().unwrap_or_default();
    let raw = if keep_raw {
        serde_json::to_value(pod)
            .map_err(|e| warn!(pod = %n, namespace = %ns, error = %e, "failed to keep raw pod"))
            .ok()
    } else {
        None
    };
    PodRecord {
        namespace: ns.to_string(),
        name: n.to_string(),
        node: pod.spec.as_ref().and_then(|s| s.node_name.clone()).unwrap_or_else(|| "Unassigned".to_string()),
        phase: pod.status.as_ref().and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string()),
        age: pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| age_since(t.0, now))
            .unwrap_or_else(|| "N/A".to_string()),
        cpu: format_cpu(used.cpu),
        memory: format_memory(used.memory as f64),
        raw,
    }
}

/// One record per pod, in listing order. Pods without a usage sample show zero usage.
pub fn merge(pods: &[Pod], usage: &PodUsage, keep_raw: bool, now: DateTime<Utc>) -> Vec<PodRecord> {
    pods.iter().map(|p| record(p, usage, keep_raw, now)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(ns: &str, name: &str, node: Option<&str>) -> Pod {
        let mut v = json!({
            "metadata": { "namespace": ns, "name": name, "creationTimestamp": "2024-06-01T11:30:00Z" },
            "status": { "phase": "Running" }
        });
        if let Some(n) = node {
            v["spec"] = json!({ "nodeName": n, "containers": [] });
        }
        serde_json::from_value(v).unwrap()
    }

    fn now() -> DateTime<Utc> { "2024-06-01T12:00:00Z".parse().unwrap() }

    #[test]
    fn merges_usage_by_namespace_and_name() {
        let pods = vec![pod("a", "web", Some("n1")), pod("b", "web", Some("n1"))];
        let usage = pod_usage_index(&[UsageSample::pod("b", "web", &[("100m", "64Mi"), ("50m", "64Mi")])]);
        let recs = merge(&pods, &usage, false, now());
        assert_eq!(recs[0].cpu, "0m");
        assert_eq!(recs[0].memory, "0.0B");
        assert_eq!(recs[1].cpu, "150m");
        assert_eq!(recs[1].memory, "128.0Mi");
        assert_eq!(recs[1].age, "30m");
        assert_eq!(recs[1].phase, "Running");
        assert!(recs[1].raw.is_none());
    }

    #[test]
    fn unscheduled_pod_defaults() {
        let mut p = pod("a", "pending", None);
        p.status = None;
        let recs = merge(&[p], &PodUsage::default(), true, now());
        assert_eq!(recs[0].node, "Unassigned");
        assert_eq!(recs[0].phase, "Unknown");
        assert_eq!(recs[0].raw.as_ref().and_then(|r| r["metadata"]["name"].as_str()), Some("pending"));
    }

    #[test]
    fn match_is_case_insensitive_on_name_or_namespace() {
        let p = pod("Payments", "api-7f9", Some("n1"));
        assert!(matches(&p, "api"));
        assert!(matches(&p, "payments"));
        assert!(!matches(&p, "billing"));
    }
}
