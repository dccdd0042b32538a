// =============================================================================
// Article Dedup Cache — per-source, TTL-bounded hash set
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

/// How long a hash stays in the cache. A scoring-provider failure drops the
/// article without caching a result, so expiry is what allows rediscovery.
const DEDUP_TTL: Duration = Duration::from_secs(3600);

/// Hard cap on cache entries per source.
const DEDUP_MAX_ENTRIES: usize = 5_000;

/// Length of the headline prefix folded into the article digest.
const HEADLINE_PREFIX_CHARS: usize = 50;

/// Stable 32-hex digest over (source, URL, headline prefix). Collisions are
/// treated as duplicates: the same story re-served by the same source.
pub fn article_hash(source: &str, url: &str, headline: &str) -> String {
    let prefix: String = headline.chars().take(HEADLINE_PREFIX_CHARS).collect();
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(b"|");
    hasher.update(url.as_bytes());
    hasher.update(b"|");
    hasher.update(prefix.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}

/// Single-writer dedup cache owned by one collector. Entries expire after
/// [`DEDUP_TTL`]; when the cap is hit the oldest entry is evicted.
pub struct DedupCache {
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if `hash` was already present (and unexpired). Otherwise
    /// records it and returns false.
    pub fn seen_or_insert(&self, hash: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if let Some(at) = entries.get(hash) {
            if now.duration_since(*at) < DEDUP_TTL {
                return true;
            }
        }

        if entries.len() >= DEDUP_MAX_ENTRIES {
            entries.retain(|_, at| now.duration_since(*at) < DEDUP_TTL);
            // Still full after expiry sweep: evict the oldest entry.
            while entries.len() >= DEDUP_MAX_ENTRIES {
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, at)| **at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                } else {
                    break;
                }
            }
        }

        entries.insert(hash.to_string(), now);
        false
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_32_hex() {
        let a = article_hash("company", "https://x.com/a", "Apple beats estimates");
        let b = article_hash("company", "https://x.com/a", "Apple beats estimates");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_differs_across_sources() {
        let a = article_hash("company", "https://x.com/a", "Same headline");
        let b = article_hash("rss", "https://x.com/a", "Same headline");
        assert_ne!(a, b);
    }

    #[test]
    fn headline_prefix_bounds_the_digest_input() {
        let long_a = format!("{}{}", "h".repeat(50), "tail one");
        let long_b = format!("{}{}", "h".repeat(50), "tail two");
        // Identical in the first 50 chars: same story, same hash.
        assert_eq!(
            article_hash("company", "https://x.com/a", &long_a),
            article_hash("company", "https://x.com/a", &long_b)
        );
    }

    #[test]
    fn second_sighting_is_a_duplicate() {
        let cache = DedupCache::new();
        assert!(!cache.seen_or_insert("abc"));
        assert!(cache.seen_or_insert("abc"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn cap_evicts_rather_than_grows() {
        let cache = DedupCache::new();
        for i in 0..DEDUP_MAX_ENTRIES + 10 {
            cache.seen_or_insert(&format!("hash-{i}"));
        }
        assert!(cache.len() <= DEDUP_MAX_ENTRIES);
    }
}
