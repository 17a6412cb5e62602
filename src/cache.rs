//! Optional response cache keyed by the full question identity. An `A` and
//! an `AAAA` query for the same name are different entries. Expiry honours
//! the minimum answer TTL of the stored response.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use moka::sync::Cache;
use rustc_hash::FxHasher;

use crate::proto_utils::min_answer_ttl;

const DEFAULT_MAX_CAPACITY: u64 = 10_000;
const DEFAULT_MAX_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct CacheEntry {
    bytes: Bytes,
    // Identity fields kept to verify hash collisions
    qname: Arc<str>,
    qtype: u16,
    qclass: u16,
    expires_at: Instant,
}

/// Lookup keys are u64 hashes so the hot path allocates nothing.
pub struct ResponseCache {
    inner: Cache<u64, CacheEntry>,
    max_ttl: Duration,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_CAPACITY, DEFAULT_MAX_TTL)
    }

    pub fn with_limits(max_capacity: u64, max_ttl: Duration) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(max_ttl)
                .build(),
            max_ttl,
        }
    }

    /// Return the cached response template for this question, if still
    /// fresh. The caller rewrites the ID bytes before sending.
    pub fn lookup(&self, qname: &str, qtype: u16, qclass: u16) -> Option<Bytes> {
        let qname = qname.to_ascii_lowercase();
        let key = cache_key(&qname, qtype, qclass);
        let entry = self.inner.get(&key)?;

        if entry.qname.as_ref() != qname || entry.qtype != qtype || entry.qclass != qclass {
            // Hash collision with a different question
            return None;
        }
        if Instant::now() >= entry.expires_at {
            self.inner.invalidate(&key);
            return None;
        }
        Some(entry.bytes.clone())
    }

    /// Store a response verbatim. Responses without a positive answer TTL
    /// are not cached; a later publish for the same question replaces an
    /// earlier one.
    pub fn publish(&self, qname: &str, qtype: u16, qclass: u16, response: &[u8]) {
        let ttl = match min_answer_ttl(response) {
            Some(ttl) if ttl > 0 => Duration::from_secs(ttl as u64).min(self.max_ttl),
            _ => return,
        };

        let qname = qname.to_ascii_lowercase();
        let key = cache_key(&qname, qtype, qclass);
        self.inner.insert(
            key,
            CacheEntry {
                bytes: Bytes::copy_from_slice(response),
                qname: Arc::from(qname.as_str()),
                qtype,
                qclass,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    #[allow(dead_code)]
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

#[inline]
fn cache_key(qname: &str, qtype: u16, qclass: u16) -> u64 {
    let mut hasher = FxHasher::default();
    qname.hash(&mut hasher);
    qtype.hash(&mut hasher);
    qclass.hash(&mut hasher);
    hasher.finish()
}
