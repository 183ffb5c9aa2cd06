//! Response caching keyed by request fingerprints.
//!
//! The fingerprint is a SHA-256 over a canonical JSON serialization of
//! `(provider, messages, relevant options)`, where volatile fields (user,
//! credentials, transport tuning) are excluded. Two backends are provided:
//! a bounded in-memory LRU with TTL and an opt-in on-disk store with the
//! layout `cache/<provider>/<endpoint>/<hash>/<ISO8601>.json`.
//!
//! At-most-once fetching per key is not guaranteed: two concurrent misses
//! may both hit the provider, and the last writer wins. Streams are never
//! cached.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::RequestOptions;
use crate::providers::ProviderId;
use crate::types::Message;

/// Default memory-cache TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

/// Default memory-cache capacity (entries).
pub const DEFAULT_CAPACITY: usize = 1000;

/// Per-call cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Whether caching is enabled for this call.
    pub enabled: bool,
    /// Entry TTL.
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl: DEFAULT_TTL,
        }
    }
}

/// A fully-qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Provider wire name.
    pub provider: String,
    /// Endpoint discriminator (e.g. `"chat"`).
    pub endpoint: String,
    /// Request fingerprint (hex SHA-256).
    pub hash: String,
}

impl CacheKey {
    fn flat(&self) -> String {
        format!("{}/{}/{}", self.provider, self.endpoint, self.hash)
    }
}

/// Compute the fingerprint for a chat request.
///
/// Canonical form: `serde_json` object serialization (keys sorted) over the
/// provider, the messages, and the semantically relevant options. Volatile
/// fields (`user`, credentials, timeouts, retry/cache/stream tuning) are
/// excluded so cosmetic differences don't fragment the cache.
pub fn fingerprint(provider: &ProviderId, messages: &[Message], options: &RequestOptions) -> String {
    let relevant = json!({
        "provider": provider.as_str(),
        "messages": messages,
        "model": options.model,
        "temperature": options.temperature,
        "max_tokens": options.max_tokens,
        "top_p": options.top_p,
        "top_k": options.top_k,
        "frequency_penalty": options.frequency_penalty,
        "presence_penalty": options.presence_penalty,
        "stop": options.stop,
        "seed": options.seed,
        "response_format": options.response_format,
        "tools": options.tools,
        "tool_choice": options.tool_choice,
    });

    let canonical = relevant.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A pluggable cache backend.
pub trait CacheStrategy: Send + Sync {
    /// Fetch a live entry, if present and unexpired.
    fn get(&self, key: &CacheKey) -> Option<Value>;

    /// Store an entry with the given TTL.
    fn put(&self, key: &CacheKey, value: Value, ttl: Duration);
}

struct MemoryEntry {
    value: Value,
    expires_at: Instant,
    last_used: Instant,
}

/// Bounded in-memory cache with TTL and LRU eviction.
pub struct MemoryCache {
    entries: Mutex<HashMap<String, MemoryEntry>>,
    capacity: usize,
}

impl MemoryCache {
    /// Create a cache bounded to `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    /// Number of live entries (expired entries may still be counted until
    /// touched or evicted).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock").len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CacheStrategy for MemoryCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        let mut entries = self.entries.lock().expect("cache lock");
        let flat = key.flat();
        match entries.get_mut(&flat) {
            Some(entry) if entry.expires_at > Instant::now() => {
                entry.last_used = Instant::now();
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&flat);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &CacheKey, value: Value, ttl: Duration) {
        let mut entries = self.entries.lock().expect("cache lock");

        if entries.len() >= self.capacity && !entries.contains_key(&key.flat()) {
            // Evict the least recently used entry.
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }

        let now = Instant::now();
        entries.insert(
            key.flat(),
            MemoryEntry {
                value,
                expires_at: now + ttl,
                last_used: now,
            },
        );
    }
}

#[derive(Serialize, Deserialize)]
struct DiskEntry {
    response: Value,
    metadata: DiskMetadata,
}

#[derive(Serialize, Deserialize)]
struct DiskMetadata {
    stored_at: String,
    ttl_ms: u64,
}

#[derive(Serialize, Deserialize, Default)]
struct DirIndex {
    latest: Option<String>,
}

/// On-disk cache with timestamped files and per-directory index pointers.
///
/// Layout: `<root>/<provider>/<endpoint>/<hash>/<ISO8601>.json`, plus an
/// `index.json` in each hash directory pointing at the newest file. The TTL
/// is written with each entry and checked at load time.
pub struct DiskCache {
    root: PathBuf,
}

impl DiskCache {
    /// Create a disk cache rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn dir_for(&self, key: &CacheKey) -> PathBuf {
        self.root
            .join(&key.provider)
            .join(&key.endpoint)
            .join(&key.hash)
    }
}

impl CacheStrategy for DiskCache {
    fn get(&self, key: &CacheKey) -> Option<Value> {
        let dir = self.dir_for(key);
        let index: DirIndex =
            serde_json::from_str(&std::fs::read_to_string(dir.join("index.json")).ok()?).ok()?;
        let latest = index.latest?;

        let raw = std::fs::read_to_string(dir.join(&latest)).ok()?;
        let entry: DiskEntry = serde_json::from_str(&raw).ok()?;

        let stored_at = chrono::DateTime::parse_from_rfc3339(&entry.metadata.stored_at).ok()?;
        let age = chrono::Utc::now().signed_duration_since(stored_at);
        if age.num_milliseconds() < 0 || age.num_milliseconds() as u64 > entry.metadata.ttl_ms {
            debug!(path = %dir.display(), "disk cache entry expired");
            return None;
        }

        Some(entry.response)
    }

    fn put(&self, key: &CacheKey, value: Value, ttl: Duration) {
        let dir = self.dir_for(key);
        if std::fs::create_dir_all(&dir).is_err() {
            return;
        }

        let now = chrono::Utc::now();
        let filename = format!("{}.json", now.format("%Y-%m-%dT%H-%M-%S%.3fZ"));
        let entry = DiskEntry {
            response: value,
            metadata: DiskMetadata {
                stored_at: now.to_rfc3339(),
                ttl_ms: ttl.as_millis() as u64,
            },
        };

        let Ok(serialized) = serde_json::to_string_pretty(&entry) else {
            return;
        };
        if std::fs::write(dir.join(&filename), serialized).is_err() {
            return;
        }

        let index = DirIndex {
            latest: Some(filename),
        };
        if let Ok(serialized) = serde_json::to_string(&index) {
            let _ = std::fs::write(dir.join("index.json"), serialized);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn key(hash: &str) -> CacheKey {
        CacheKey {
            provider: "mock".into(),
            endpoint: "chat".into(),
            hash: hash.into(),
        }
    }

    #[test]
    fn test_fingerprint_stable() {
        let messages = vec![Message::user("hi")];
        let opts = RequestOptions::default().with_model("m");
        let a = fingerprint(&ProviderId::Mock, &messages, &opts);
        let b = fingerprint(&ProviderId::Mock, &messages, &opts);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_volatile_fields() {
        let messages = vec![Message::user("hi")];
        let base = RequestOptions::default().with_model("m");
        let mut with_user = base.clone();
        with_user.user = Some("alice".into());
        with_user.api_key = Some("sk-secret".into());
        with_user.timeout_ms = Some(1);

        assert_eq!(
            fingerprint(&ProviderId::Mock, &messages, &base),
            fingerprint(&ProviderId::Mock, &messages, &with_user)
        );
    }

    #[test]
    fn test_fingerprint_varies_on_semantic_fields() {
        let messages = vec![Message::user("hi")];
        let a = fingerprint(
            &ProviderId::Mock,
            &messages,
            &RequestOptions::default().with_model("m1"),
        );
        let b = fingerprint(
            &ProviderId::Mock,
            &messages,
            &RequestOptions::default().with_model("m2"),
        );
        assert_ne!(a, b);

        let c = fingerprint(
            &ProviderId::Mock,
            &[Message::user("bye")],
            &RequestOptions::default().with_model("m1"),
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new(10);
        let k = key("abc");
        assert!(cache.get(&k).is_none());
        cache.put(&k, json!({"content": "pong"}), Duration::from_secs(60));
        assert_eq!(cache.get(&k), Some(json!({"content": "pong"})));
    }

    #[test]
    fn test_memory_cache_ttl_expiry() {
        let cache = MemoryCache::new(10);
        let k = key("abc");
        cache.put(&k, json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_memory_cache_lru_eviction() {
        let cache = MemoryCache::new(2);
        cache.put(&key("a"), json!(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        cache.put(&key("b"), json!(2), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));

        // Touch "a" so "b" becomes least recently used.
        assert!(cache.get(&key("a")).is_some());
        std::thread::sleep(Duration::from_millis(2));

        cache.put(&key("c"), json!(3), Duration::from_secs(60));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none(), "LRU entry evicted");
        assert!(cache.get(&key("c")).is_some());
    }

    #[test]
    fn test_disk_cache_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path());
        let k = key("deadbeef");

        assert!(cache.get(&k).is_none());
        cache.put(&k, json!({"content": "hello"}), Duration::from_secs(60));
        assert_eq!(cache.get(&k), Some(json!({"content": "hello"})));

        // Layout: <root>/mock/chat/deadbeef/{<timestamp>.json, index.json}
        let hash_dir = dir.path().join("mock").join("chat").join("deadbeef");
        assert!(hash_dir.join("index.json").exists());
    }

    #[test]
    fn test_disk_cache_ttl_expiry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path());
        let k = key("deadbeef");
        cache.put(&k, json!(1), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get(&k).is_none());
    }

    #[test]
    fn test_disk_cache_last_writer_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path());
        let k = key("deadbeef");
        cache.put(&k, json!(1), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(5));
        cache.put(&k, json!(2), Duration::from_secs(60));
        assert_eq!(cache.get(&k), Some(json!(2)));
    }
}
