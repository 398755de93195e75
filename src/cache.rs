use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::Record;
use moka::Expiry;
use moka::sync::Cache;
use rustc_hash::FxHasher;

use crate::policy::CacheBounds;

/// One cached answer. Keys are u64 hashes; the name/type/class fields are
/// stored to verify collisions on read.
#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub records: Vec<Record>,
    pub rcode: ResponseCode,
    /// Winning upstream, or "custom"/"blocked" for synthesized answers.
    pub source: Arc<str>,
    pub qname: Arc<str>,
    pub qtype: u16,
    pub qclass: u16,
    stored_at: Instant,
    /// Clamped lifetime; entries with a zero lifetime are never stored.
    lifetime: Duration,
}

impl CachedAnswer {
    fn deadline(&self) -> Instant {
        self.stored_at + self.lifetime
    }

    pub fn remaining_at(&self, now: Instant) -> Duration {
        self.deadline().saturating_duration_since(now)
    }

    /// Answer records with TTLs rewritten down to the remaining lifetime.
    pub fn records_with_remaining(&self, now: Instant) -> Vec<Record> {
        let remaining = self.remaining_at(now).as_secs() as u32;
        self.records
            .iter()
            .map(|r| {
                let mut r = r.clone();
                r.set_ttl(remaining);
                r
            })
            .collect()
    }
}

struct AnswerExpiry;

impl Expiry<u64, CachedAnswer> for AnswerExpiry {
    fn expire_after_create(
        &self,
        _key: &u64,
        value: &CachedAnswer,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.lifetime)
    }
}

/// TTL-aware answer store. moka shards internally, so concurrent access to
/// distinct keys never serializes behind one lock; its background sweep backs
/// the lazy expiry check done on every read.
pub struct AnswerCache {
    entries: Cache<u64, CachedAnswer>,
    bounds: CacheBounds,
}

impl AnswerCache {
    pub fn new(capacity: u64, bounds: CacheBounds) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(capacity)
                .expire_after(AnswerExpiry)
                .build(),
            bounds,
        }
    }

    pub fn key(qname: &str, qtype: u16, qclass: u16) -> u64 {
        let mut h = FxHasher::default();
        qname.hash(&mut h);
        qtype.hash(&mut h);
        qclass.hash(&mut h);
        h.finish()
    }

    /// clamp(original, min, max); both bounds zero passes the TTL through.
    pub fn effective_ttl(&self, original: Duration) -> Duration {
        let mut ttl = original;
        if self.bounds.min > Duration::ZERO && ttl < self.bounds.min {
            ttl = self.bounds.min;
        }
        if self.bounds.max > Duration::ZERO && ttl > self.bounds.max {
            ttl = self.bounds.max;
        }
        ttl
    }

    /// Build an entry and store it when its clamped lifetime is non-zero.
    /// Returns the entry either way so the caller can feed coalesced waiters.
    pub fn put(
        &self,
        qname: &str,
        qtype: u16,
        qclass: u16,
        records: Vec<Record>,
        rcode: ResponseCode,
        source: &str,
        original_ttl: Duration,
    ) -> CachedAnswer {
        let entry = CachedAnswer {
            records,
            rcode,
            source: Arc::from(source),
            qname: Arc::from(qname),
            qtype,
            qclass,
            stored_at: Instant::now(),
            lifetime: self.effective_ttl(original_ttl),
        };
        if entry.lifetime > Duration::ZERO {
            self.entries.insert(Self::key(qname, qtype, qclass), entry.clone());
        }
        entry
    }

    pub fn get(&self, qname: &str, qtype: u16, qclass: u16) -> Option<CachedAnswer> {
        self.get_at(qname, qtype, qclass, Instant::now())
    }

    /// Lazy expiry: an entry past its deadline is a miss even if the sweep
    /// has not evicted it yet.
    fn get_at(&self, qname: &str, qtype: u16, qclass: u16, now: Instant) -> Option<CachedAnswer> {
        let key = Self::key(qname, qtype, qclass);
        let hit = self.entries.get(&key)?;
        if hit.qtype != qtype || hit.qclass != qclass || hit.qname.as_ref() != qname {
            return None;
        }
        if now >= hit.deadline() {
            self.entries.invalidate(&key);
            return None;
        }
        Some(hit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, RecordType};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn bounds(min: u64, max: u64) -> CacheBounds {
        CacheBounds {
            min: Duration::from_secs(min),
            max: Duration::from_secs(max),
        }
    }

    fn a_record(name: &str, ttl: u32) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(Ipv4Addr::new(1, 2, 3, 4))),
        )
    }

    const QTYPE_A: u16 = 1;
    const QCLASS_IN: u16 = 1;

    #[test]
    fn clamp_passes_through_when_unset() {
        let cache = AnswerCache::new(16, bounds(0, 0));
        assert_eq!(
            cache.effective_ttl(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn clamp_raises_to_min_and_caps_at_max() {
        let cache = AnswerCache::new(16, bounds(30, 0));
        assert_eq!(
            cache.effective_ttl(Duration::from_secs(5)),
            Duration::from_secs(30)
        );

        let cache = AnswerCache::new(16, bounds(0, 60));
        assert_eq!(
            cache.effective_ttl(Duration::from_secs(300)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn short_ttl_is_stretched_and_expires_after_the_min() {
        let cache = AnswerCache::new(16, bounds(30, 0));
        let entry = cache.put(
            "example.com",
            QTYPE_A,
            QCLASS_IN,
            vec![a_record("example.com.", 5)],
            ResponseCode::NoError,
            "tcp+udp:8.8.8.8:53",
            Duration::from_secs(5),
        );
        assert_eq!(entry.lifetime, Duration::from_secs(30));

        let now = Instant::now();
        let hit = cache
            .get_at("example.com", QTYPE_A, QCLASS_IN, now)
            .expect("fresh entry is a hit");
        assert_eq!(hit.rcode, ResponseCode::NoError);

        // Just before the clamped deadline: still a hit with a reduced TTL.
        let later = now + Duration::from_secs(29);
        let hit = cache
            .get_at("example.com", QTYPE_A, QCLASS_IN, later)
            .expect("still alive");
        assert!(hit.records_with_remaining(later)[0].ttl() <= 1);

        // Past the deadline: lazily treated as a miss.
        let expired = now + Duration::from_secs(31);
        assert!(cache.get_at("example.com", QTYPE_A, QCLASS_IN, expired).is_none());
    }

    #[test]
    fn zero_lifetime_is_not_stored() {
        let cache = AnswerCache::new(16, bounds(0, 0));
        cache.put(
            "example.com",
            QTYPE_A,
            QCLASS_IN,
            vec![a_record("example.com.", 0)],
            ResponseCode::NoError,
            "tcp+udp:8.8.8.8:53",
            Duration::ZERO,
        );
        assert!(cache.get("example.com", QTYPE_A, QCLASS_IN).is_none());
    }

    #[test]
    fn distinct_types_do_not_collide() {
        let cache = AnswerCache::new(16, bounds(0, 0));
        cache.put(
            "example.com",
            QTYPE_A,
            QCLASS_IN,
            vec![a_record("example.com.", 60)],
            ResponseCode::NoError,
            "up",
            Duration::from_secs(60),
        );
        let qtype_aaaa = u16::from(RecordType::AAAA);
        assert!(cache.get("example.com", qtype_aaaa, QCLASS_IN).is_none());
        assert!(cache.get("example.com", QTYPE_A, QCLASS_IN).is_some());
    }

    #[test]
    fn remaining_ttl_counts_down() {
        let cache = AnswerCache::new(16, bounds(0, 0));
        let entry = cache.put(
            "example.com",
            QTYPE_A,
            QCLASS_IN,
            vec![a_record("example.com.", 100)],
            ResponseCode::NoError,
            "up",
            Duration::from_secs(100),
        );
        let later = Instant::now() + Duration::from_secs(40);
        let records = entry.records_with_remaining(later);
        let ttl = records[0].ttl();
        assert!((59..=60).contains(&ttl), "ttl {ttl}");
    }
}
