use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

/// objects above this never enter the cache
pub const MAX_ENTRY_BYTES: usize = 10 * 1024 * 1024;

// the representation-relevant projection of request headers; Range is
// deliberately absent so sliced and full reads share an entry
const FINGERPRINT_HEADERS: [&str; 3] = ["accept", "accept-encoding", "accept-language"];

pub type DynCacheService = Arc<dyn CacheServiceTrait + Send + Sync>;

#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub body: Bytes,
    pub content_type: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: usize,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub rejected_oversize: u64,
}

pub trait CacheServiceTrait {
    /// fingerprint lookup, None on miss
    fn get(&self, key: &str) -> Option<CachedResponse>;

    /// insert a body; oversized bodies are silently refused
    fn put(&self, key: &str, body: Bytes, content_type: Option<String>);

    fn stats(&self) -> CacheStats;

    /// drop everything (admin surface)
    fn clear(&self);
}

struct CacheEntry {
    body: Bytes,
    content_type: Option<String>,
    inserted_at: Instant,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    // insertion order for least-recently-inserted eviction
    order: VecDeque<String>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    rejected_oversize: u64,
}

/// Bounded in-memory response cache. A single mutex serializes writes and
/// evictions; insertion plus eviction happens as one atomic section.
pub struct ResponseCacheService {
    inner: Mutex<CacheInner>,
    max_bytes: u64,
}

impl ResponseCacheService {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_bytes,
        }
    }

    /// Fingerprint for one exchange: sha256 over target URL plus the sorted
    /// representation headers. Range never participates.
    pub fn fingerprint(target_url: &str, headers: &HeaderMap) -> String {
        let mut projected: Vec<(String, String)> = FINGERPRINT_HEADERS
            .iter()
            .filter_map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();
        projected.sort();

        let mut hasher = Sha256::new();
        hasher.update(target_url.as_bytes());
        for (name, value) in projected {
            hasher.update(name.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }
}

impl CacheServiceTrait for ResponseCacheService {
    fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(key) {
            Some(entry) => {
                let response = CachedResponse {
                    body: entry.body.clone(),
                    content_type: entry.content_type.clone(),
                };
                inner.hits += 1;
                Some(response)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    fn put(&self, key: &str, body: Bytes, content_type: Option<String>) {
        let size = body.len();
        if size > MAX_ENTRY_BYTES {
            let mut inner = self.inner.lock().unwrap();
            inner.rejected_oversize += 1;
            debug!("cache refused oversize body ({} bytes)", size);
            return;
        }

        let mut inner = self.inner.lock().unwrap();

        // replacing an entry re-ranks it as freshly inserted
        if let Some(old) = inner.entries.remove(key) {
            inner.total_bytes -= old.body.len();
            inner.order.retain(|k| k.as_str() != key);
        }

        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                body,
                content_type,
                inserted_at: Instant::now(),
            },
        );
        inner.order.push_back(key.to_string());
        inner.total_bytes += size;

        // evict oldest insertions until back under the soft cap
        while inner.total_bytes as u64 > self.max_bytes {
            let Some(victim) = inner.order.pop_front() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.total_bytes -= evicted.body.len();
                inner.evictions += 1;
                debug!(
                    "evicted cache entry {} ({} bytes, {:?} old)",
                    victim,
                    evicted.body.len(),
                    evicted.inserted_at.elapsed()
                );
            }
        }
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats {
            entries: inner.entries.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.max_bytes,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            rejected_oversize: inner.rejected_oversize,
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
        inner.total_bytes = 0;
        debug!("cache cleared");
    }
}

/// Parse `Range: bytes=a-b` against a body of `total` bytes. Open-ended
/// ranges clamp to the end. Anything malformed or out of bounds yields None
/// and the caller serves the full body.
pub fn parse_range_header(value: &str, total: usize) -> Option<(usize, usize)> {
    let range_spec = value.trim().strip_prefix("bytes=")?;
    let (start_s, end_s) = range_spec.split_once('-')?;

    let start: usize = start_s.trim().parse().ok()?;
    let end: usize = if end_s.trim().is_empty() {
        total.checked_sub(1)?
    } else {
        end_s.trim().parse().ok()?
    };
    let end = end.min(total.checked_sub(1)?);

    if start > end || start >= total {
        return None;
    }
    Some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(max: u64) -> ResponseCacheService {
        ResponseCacheService::new(max)
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = cache(1 << 20);
        let body = Bytes::from_static(b"segment bytes");
        cache.put("k1", body.clone(), Some("video/mp2t".into()));

        let hit = cache.get("k1").unwrap();
        assert_eq!(hit.body, body);
        assert_eq!(hit.content_type.as_deref(), Some("video/mp2t"));
        assert!(cache.get("k2").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn oversize_put_is_a_noop() {
        let cache = cache(u64::MAX);
        let big = Bytes::from(vec![0u8; MAX_ENTRY_BYTES + 1]);
        cache.put("big", big, None);
        assert!(cache.get("big").is_none());
        assert_eq!(cache.stats().rejected_oversize, 1);
    }

    #[test]
    fn evicts_least_recently_inserted_under_pressure() {
        let cache = cache(100);
        cache.put("a", Bytes::from(vec![1u8; 60]), None);
        cache.put("b", Bytes::from(vec![2u8; 60]), None);
        // a was inserted first, so a goes
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.stats().total_bytes <= 100);
    }

    #[test]
    fn clear_drops_everything() {
        let cache = cache(1 << 20);
        cache.put("a", Bytes::from_static(b"x"), None);
        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert_eq!(stats.total_bytes, 0);
    }

    #[test]
    fn fingerprint_ignores_range_but_not_representation() {
        let mut h1 = HeaderMap::new();
        h1.insert("accept", "*/*".parse().unwrap());
        h1.insert("range", "bytes=0-100".parse().unwrap());

        let mut h2 = HeaderMap::new();
        h2.insert("accept", "*/*".parse().unwrap());

        assert_eq!(
            ResponseCacheService::fingerprint("https://h/a.ts", &h1),
            ResponseCacheService::fingerprint("https://h/a.ts", &h2)
        );

        let mut h3 = HeaderMap::new();
        h3.insert("accept", "text/html".parse().unwrap());
        assert_ne!(
            ResponseCacheService::fingerprint("https://h/a.ts", &h2),
            ResponseCacheService::fingerprint("https://h/a.ts", &h3)
        );
        assert_ne!(
            ResponseCacheService::fingerprint("https://h/a.ts", &h2),
            ResponseCacheService::fingerprint("https://h/b.ts", &h2)
        );
    }

    #[test]
    fn range_parsing_validates_bounds() {
        assert_eq!(parse_range_header("bytes=0-1023", 2048), Some((0, 1023)));
        assert_eq!(parse_range_header("bytes=100-", 200), Some((100, 199)));
        // end clamps to the body
        assert_eq!(parse_range_header("bytes=0-9999", 100), Some((0, 99)));
        // inverted and out-of-range specs serve the full body
        assert_eq!(parse_range_header("bytes=50-10", 100), None);
        assert_eq!(parse_range_header("bytes=200-300", 100), None);
        assert_eq!(parse_range_header("chunks=0-1", 100), None);
        assert_eq!(parse_range_header("bytes=0-0", 0), None);
    }
}
