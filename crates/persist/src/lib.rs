//! kview persistence: the context-scoped TTL cache and its JSON file.
//! The whole store is rewritten on every put; memory stays authoritative when the
//! file cannot be read or written.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use kview_core::CacheKind;
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, error, info, warn};

pub const CACHE_FILE: &str = "cluster_cache.json";
pub const DEFAULT_TTL_SECS: u64 = 30;
pub const DEFAULT_CACHE_DIR: &str = "~/.kview";

/// Cache construction inputs. Environment supplies defaults; callers override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSettings {
    pub ttl: Duration,
    pub enabled: bool,
    pub dir: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self { ttl: Duration::from_secs(DEFAULT_TTL_SECS), enabled: true, dir: expand_home(DEFAULT_CACHE_DIR) }
    }
}

impl CacheSettings {
    /// Defaults overlaid with `KVIEW_CACHE_TTL`, `KVIEW_CACHE_ENABLED` and `KVIEW_CACHE_DIR`.
    pub fn from_env() -> Self {
        let d = Self::default();
        let ttl = std::env::var("KVIEW_CACHE_TTL").ok().and_then(|s| s.parse::<u64>().ok()).map(Duration::from_secs).unwrap_or(d.ttl);
        let enabled = std::env::var("KVIEW_CACHE_ENABLED").map(|v| !matches!(v.trim(), "0" | "false")).unwrap_or(d.enabled);
        let dir = std::env::var("KVIEW_CACHE_DIR").map(|s| expand_home(&s)).unwrap_or(d.dir);
        Self { ttl, enabled, dir }
    }

    pub fn with_ttl_secs(mut self, secs: u64) -> Self { self.ttl = Duration::from_secs(secs); self }
    pub fn with_enabled(mut self, enabled: bool) -> Self { self.enabled = enabled; self }
    pub fn with_dir(mut self, dir: impl AsRef<str>) -> Self { self.dir = expand_home(dir.as_ref()); self }

    pub fn file_path(&self) -> PathBuf { self.dir.join(CACHE_FILE) }
}

/// Expand a leading `~` using `HOME`.
pub fn expand_home(p: &str) -> PathBuf {
    if p == "~" || p.starts_with("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut out = PathBuf::from(home);
            if let Some(rest) = p.strip_prefix("~/") {
                out.push(rest);
            }
            return out;
        }
    }
    PathBuf::from(p)
}

pub fn now_secs() -> f64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

/// One cached payload. Replaced wholesale, never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub data: Vec<serde_json::Value>,
    /// Fetch time, seconds since the epoch.
    pub timestamp: f64,
}

type KeyMap = BTreeMap<String, CacheEntry>;

/// Per-context maps, one per [`CacheKind`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextCache {
    #[serde(default)]
    pub nodes: KeyMap,
    #[serde(default)]
    pub pods: KeyMap,
}

impl ContextCache {
    fn map(&self, kind: CacheKind) -> &KeyMap {
        match kind {
            CacheKind::Nodes => &self.nodes,
            CacheKind::Pods => &self.pods,
        }
    }

    fn map_mut(&mut self, kind: CacheKind) -> &mut KeyMap {
        match kind {
            CacheKind::Nodes => &mut self.nodes,
            CacheKind::Pods => &mut self.pods,
        }
    }
}

type Contexts = BTreeMap<String, ContextCache>;

/// Context → kind → key → entry, persisted to a single JSON file.
pub struct CacheStore {
    settings: CacheSettings,
    contexts: Contexts,
}

impl CacheStore {
    /// Load the cache file (when enabled) and make sure `active_context` has a sub-map.
    pub fn load(settings: CacheSettings, active_context: &str) -> Self {
        if !settings.enabled {
            info!("cache disabled");
            return Self { settings, contexts: Contexts::new() };
        }
        let path = settings.file_path();
        let contexts = match read_file(&path) {
            Ok(Some(c)) => {
                info!(path = %path.display(), contexts = c.len(), "cache loaded");
                c
            }
            Ok(None) => {
                debug!(path = %path.display(), "no cache file; starting empty");
                Contexts::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = ?e, "failed to load cache; starting empty");
                Contexts::new()
            }
        };
        let mut me = Self { settings, contexts };
        me.ensure_context(active_context);
        info!(ttl_secs = me.settings.ttl.as_secs(), context = %active_context, "cache ready");
        me
    }

    pub fn is_enabled(&self) -> bool { self.settings.enabled }
    pub fn ttl(&self) -> Duration { self.settings.ttl }

    /// Contexts currently held, sorted.
    pub fn contexts(&self) -> Vec<String> { self.contexts.keys().cloned().collect() }

    /// Keys held for one context and kind, valid or not, sorted.
    pub fn keys(&self, context: &str, kind: CacheKind) -> Vec<String> {
        self.contexts.get(context).map(|c| c.map(kind).keys().cloned().collect()).unwrap_or_default()
    }

    /// Insert an empty sub-map for `context` if missing; other contexts are untouched.
    pub fn ensure_context(&mut self, context: &str) {
        if !self.settings.enabled {
            return;
        }
        self.contexts.entry(context.to_string()).or_default();
    }

    fn entry(&self, context: &str, kind: CacheKind, key: &str) -> Option<&CacheEntry> {
        self.contexts.get(context)?.map(kind).get(key)
    }

    /// Fresh means fetched no later than `now` and less than one TTL ago.
    fn is_fresh(entry: &CacheEntry, ttl: Duration, now: f64) -> bool {
        let age = now - entry.timestamp;
        age >= 0.0 && age < ttl.as_secs_f64()
    }

    fn is_valid(&self, entry: &CacheEntry, now: f64) -> bool {
        self.settings.enabled && Self::is_fresh(entry, self.settings.ttl, now)
    }

    /// Drop every entry, in any context, that can no longer be served.
    fn prune(&mut self, now: f64) {
        let ttl = self.settings.ttl;
        let mut dropped = 0usize;
        for ctx in self.contexts.values_mut() {
            for kind in [CacheKind::Nodes, CacheKind::Pods] {
                let map = ctx.map_mut(kind);
                let before = map.len();
                map.retain(|_, e| Self::is_fresh(e, ttl, now));
                dropped += before - map.len();
            }
        }
        if dropped > 0 {
            debug!(dropped, "pruned stale cache entries");
        }
    }

    /// Valid payload for the key, or `None` on miss/expiry/disabled.
    pub fn get<T: DeserializeOwned>(&self, context: &str, kind: CacheKind, key: &str) -> Option<Vec<T>> {
        self.get_at(context, kind, key, now_secs())
    }

    fn get_at<T: DeserializeOwned>(&self, context: &str, kind: CacheKind, key: &str, now: f64) -> Option<Vec<T>> {
        let hit = self.entry(context, kind, key).filter(|e| self.is_valid(e, now));
        let Some(entry) = hit else {
            counter!("cache_miss_total", 1u64, "kind" => kind.as_str());
            return None;
        };
        let decoded: Result<Vec<T>, _> = entry.data.iter().cloned().map(serde_json::from_value).collect();
        match decoded {
            Ok(v) => {
                counter!("cache_hit_total", 1u64, "kind" => kind.as_str());
                debug!(context = %context, kind = %kind, key = %key, items = v.len(), "cache hit");
                Some(v)
            }
            Err(e) => {
                warn!(context = %context, kind = %kind, key = %key, error = %e, "cached payload no longer decodes; treating as miss");
                counter!("cache_miss_total", 1u64, "kind" => kind.as_str());
                None
            }
        }
    }

    /// Fetch time of the entry regardless of validity.
    pub fn fetched_at(&self, context: &str, kind: CacheKind, key: &str) -> Option<f64> {
        self.entry(context, kind, key).map(|e| e.timestamp)
    }

    /// Overwrite one entry with the current time and flush the whole store.
    pub fn put<T: Serialize>(&mut self, context: &str, kind: CacheKind, key: &str, records: &[T]) {
        self.put_many(context, kind, std::iter::once((key.to_string(), records)));
    }

    /// Overwrite several entries of one kind with a single flush.
    pub fn put_many<'a, T, I>(&mut self, context: &str, kind: CacheKind, entries: I)
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (String, &'a [T])>,
    {
        if !self.settings.enabled {
            return;
        }
        self.put_many_at(context, kind, entries, now_secs());
        self.persist();
    }

    fn put_many_at<'a, T, I>(&mut self, context: &str, kind: CacheKind, entries: I, now: f64)
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (String, &'a [T])>,
    {
        self.prune(now);
        let map = self.contexts.entry(context.to_string()).or_default().map_mut(kind);
        for (key, records) in entries {
            let data: Result<Vec<serde_json::Value>, _> = records.iter().map(serde_json::to_value).collect();
            match data {
                Ok(data) => {
                    map.insert(key, CacheEntry { data, timestamp: now });
                }
                Err(e) => error!(context = %context, kind = %kind, key = %key, error = %e, "failed to encode cache payload"),
            }
        }
    }

    /// Write the full store; failures are logged and otherwise ignored.
    fn persist(&self) {
        let started = Instant::now();
        let path = self.settings.file_path();
        match write_file(&self.settings.dir, &path, &self.contexts) {
            Ok(()) => {
                histogram!("cache_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
                debug!(path = %path.display(), "cache saved");
            }
            Err(e) => {
                counter!("cache_flush_errors_total", 1u64);
                error!(path = %path.display(), error = ?e, "failed to save cache");
            }
        }
    }
}

fn read_file(path: &Path) -> Result<Option<Contexts>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let contexts = serde_json::from_slice(&bytes).with_context(|| format!("decoding {}", path.display()))?;
    Ok(Some(contexts))
}

fn write_file(dir: &Path, path: &Path, contexts: &Contexts) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let bytes = serde_json::to_vec(contexts).context("encoding cache")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Row { name: String }

    fn row(n: &str) -> Row { Row { name: n.to_string() } }

    fn temp_dir() -> PathBuf {
        let nanos = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("kview-test-{}-{}", std::process::id(), nanos))
    }

    fn settings(dir: &Path) -> CacheSettings {
        CacheSettings { ttl: Duration::from_secs(30), enabled: true, dir: dir.to_path_buf() }
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put("prod", CacheKind::Nodes, "worker", &[row("n1"), row("n2")]);
        let got: Vec<Row> = s.get("prod", CacheKind::Nodes, "worker").unwrap();
        assert_eq!(got, vec![row("n1"), row("n2")]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put_many_at("prod", CacheKind::Pods, vec![("n1".to_string(), &[row("p")][..])], 1_000.0);
        assert!(s.get_at::<Row>("prod", CacheKind::Pods, "n1", 1_029.9).is_some());
        assert!(s.get_at::<Row>("prod", CacheKind::Pods, "n1", 1_030.0).is_none());
        assert_eq!(s.fetched_at("prod", CacheKind::Pods, "n1"), Some(1_000.0));
    }

    #[test]
    fn entries_stamped_in_the_future_miss() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put_many_at("prod", CacheKind::Nodes, vec![("worker".to_string(), &[row("n1")][..])], 5_000.0);
        assert!(s.get_at::<Row>("prod", CacheKind::Nodes, "worker", 4_999.0).is_none());
        assert!(s.get_at::<Row>("prod", CacheKind::Nodes, "worker", 5_000.0).is_some());
    }

    #[test]
    fn writes_prune_expired_entries_everywhere() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put_many_at("prod", CacheKind::Nodes, vec![("typo".to_string(), &[row("n1")][..])], 1_000.0);
        s.put_many_at("other", CacheKind::Pods, vec![("gone-node".to_string(), &[row("p")][..])], 1_000.0);
        s.put_many_at("prod", CacheKind::Pods, vec![("kept".to_string(), &[row("p")][..])], 1_020.0);
        // written by a host whose clock runs ahead
        let skewed = CacheEntry { data: vec![serde_json::json!({ "name": "p" })], timestamp: 9_000.0 };
        s.contexts.get_mut("prod").unwrap().pods.insert("skewed".to_string(), skewed);

        s.put_many_at("prod", CacheKind::Nodes, vec![("worker".to_string(), &[row("n2")][..])], 1_040.0);
        assert_eq!(s.keys("prod", CacheKind::Nodes), vec!["worker".to_string()]);
        assert_eq!(s.keys("prod", CacheKind::Pods), vec!["kept".to_string()]);
        assert!(s.keys("other", CacheKind::Pods).is_empty());
        assert_eq!(s.fetched_at("prod", CacheKind::Nodes, "typo"), None);
    }

    #[test]
    fn zero_ttl_always_misses() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir).with_ttl_secs(0), "prod");
        s.put("prod", CacheKind::Nodes, "worker", &[row("n1")]);
        assert!(s.get::<Row>("prod", CacheKind::Nodes, "worker").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn contexts_are_isolated() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "a");
        s.put("a", CacheKind::Nodes, "worker", &[row("from-a")]);
        assert!(s.get::<Row>("b", CacheKind::Nodes, "worker").is_none());
        assert!(s.get::<Row>("a", CacheKind::Pods, "worker").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn reload_keeps_other_contexts_and_adds_active() {
        let dir = temp_dir();
        {
            let mut s = CacheStore::load(settings(&dir), "a");
            s.put("a", CacheKind::Nodes, "worker", &[row("n1")]);
        }
        let s = CacheStore::load(settings(&dir), "b");
        assert_eq!(s.contexts(), vec!["a".to_string(), "b".to_string()]);
        let got: Vec<Row> = s.get("a", CacheKind::Nodes, "worker").unwrap();
        assert_eq!(got, vec![row("n1")]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_falls_back_to_empty() {
        let dir = temp_dir();
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(CACHE_FILE), b"{not json").unwrap();
        let s = CacheStore::load(settings(&dir), "prod");
        assert_eq!(s.contexts(), vec!["prod".to_string()]);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn file_layout_is_context_kind_key() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put("prod", CacheKind::Pods, "n1", &[row("p1")]);
        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(dir.join(CACHE_FILE)).unwrap()).unwrap();
        assert_eq!(raw["prod"]["pods"]["n1"]["data"][0]["name"], "p1");
        assert!(raw["prod"]["pods"]["n1"]["timestamp"].is_number());
        assert!(raw["prod"]["nodes"].as_object().unwrap().is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn unwritable_dir_keeps_memory_state() {
        let dir = temp_dir();
        std::fs::create_dir_all(dir.parent().unwrap()).unwrap();
        // A regular file where the cache directory should be makes every flush fail.
        std::fs::write(&dir, b"").unwrap();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put("prod", CacheKind::Nodes, "worker", &[row("n1")]);
        assert!(s.get::<Row>("prod", CacheKind::Nodes, "worker").is_some());
        let _ = std::fs::remove_file(dir);
    }

    #[test]
    fn disabled_cache_never_touches_disk() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir).with_enabled(false), "prod");
        s.put("prod", CacheKind::Nodes, "worker", &[row("n1")]);
        assert!(s.get::<Row>("prod", CacheKind::Nodes, "worker").is_none());
        assert!(s.contexts().is_empty());
        assert!(!dir.exists());
    }

    #[test]
    fn undecodable_payload_is_a_miss() {
        let dir = temp_dir();
        let mut s = CacheStore::load(settings(&dir), "prod");
        s.put("prod", CacheKind::Nodes, "worker", &[42u32]);
        assert!(s.get::<Row>("prod", CacheKind::Nodes, "worker").is_none());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn expand_home_only_touches_leading_tilde() {
        assert_eq!(expand_home("/tmp/x"), PathBuf::from("/tmp/x"));
        assert_eq!(expand_home("a/~/b"), PathBuf::from("a/~/b"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/.kview"), PathBuf::from(home).join(".kview"));
        }
    }
}
