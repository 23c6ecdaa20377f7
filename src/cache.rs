//! DNS cache implementation.
//!
//! Holds answers obtained from the upstream, keyed by `(name, type, class)`.
//! Every entry carries the absolute time it expires, derived from the
//! upstream TTL, and lookups hand records back with the TTL that is actually
//! left. Expired entries are never returned; they are dropped when a lookup
//! trips over them and by the background sweeper.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::errors::PersistError;
use crate::persist::{read_json, write_json};
use crate::record::{DnsClass, DnsRecord, RecordType, QTYPE_ANY};
use crate::utils::normalize_name;

/// Minimum interval between sweeps of expired entries.
pub const CACHE_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

/// Upstream TTLs are capped at seven days.
pub const MAX_CACHE_TTL: u32 = 7 * 24 * 3600;

/// How many cached CNAMEs a lookup follows before giving up.
const MAX_CNAME_HOPS: usize = 8;

/// Identity of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub name: String,
    pub rtype: RecordType,
    pub class: DnsClass,
}

impl CacheKey {
    pub fn new(name: &str, rtype: RecordType, class: DnsClass) -> Self {
        Self {
            name: normalize_name(name),
            rtype,
            class,
        }
    }

    fn of(record: &DnsRecord) -> Self {
        Self::new(&record.name, record.rtype, record.class)
    }
}

/// An RRset obtained from the upstream.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Records as returned by the upstream, TTL capped.
    pub records: Vec<DnsRecord>,
    pub inserted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_query_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whole seconds left before expiry, never less than 1.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> u32 {
        let left = (self.expires_at - now).num_seconds();
        left.clamp(1, u32::MAX as i64) as u32
    }

    fn original_ttl(&self) -> i64 {
        (self.expires_at - self.inserted_at).num_seconds()
    }

    /// Records with their TTL rewritten to the time left.
    fn records_at(&self, now: DateTime<Utc>) -> Vec<DnsRecord> {
        let ttl = self.remaining_ttl(now);
        self.records
            .iter()
            .map(|r| DnsRecord { ttl, ..r.clone() })
            .collect()
    }
}

/// One record of the cache snapshot file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub dns_record: DnsRecord,
    pub expiry: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_query: Option<DateTime<Utc>>,
}

/// On-disk shape of the cache snapshot.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CacheFile {
    #[serde(default)]
    pub cache: Vec<CacheRecord>,
}

/// Entries plus an index of them ordered by expiry.
#[derive(Debug, Default)]
struct CacheTable {
    entries: HashMap<CacheKey, CacheEntry>,
    by_expiry: BTreeSet<(DateTime<Utc>, CacheKey)>,
}

impl CacheTable {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.remove(&key);
        self.by_expiry.insert((entry.expires_at, key.clone()));
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.by_expiry.remove(&(entry.expires_at, key.clone()));
        Some(entry)
    }

    /// Move the expiry of an existing entry earlier.
    fn shorten(&mut self, key: &CacheKey, expires_at: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(key) else {
            return;
        };
        if expires_at < entry.expires_at {
            self.by_expiry.remove(&(entry.expires_at, key.clone()));
            entry.expires_at = expires_at;
            self.by_expiry.insert((expires_at, key.clone()));
        }
    }

    /// Remove the entry that expires first.
    fn pop_earliest(&mut self) -> Option<CacheKey> {
        let (_, key) = self.by_expiry.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    /// Remove every entry expired at `now`.
    fn purge(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        while let Some((expires_at, _)) = self.by_expiry.first() {
            if *expires_at > now {
                break;
            }
            self.pop_earliest();
            removed += 1;
        }
        removed
    }

    fn evict(&mut self, capacity: usize) {
        while self.len() > capacity {
            match self.pop_earliest() {
                Some(key) => debug!("Evicted cache entry {} {}", key.name, key.rtype),
                None => break,
            }
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.by_expiry.clear();
    }
}

/// Cache for upstream answers.
#[derive(Debug)]
pub struct DnsCache {
    table: Mutex<CacheTable>,
    capacity: usize,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl DnsCache {
    /// Create a cache that holds roughly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            table: Mutex::new(CacheTable::default()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().len() == 0
    }

    /// Get the live records for `key`.
    ///
    /// # Returns
    /// The records with TTLs counting down, or `None` if absent or expired.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<DnsRecord>> {
        self.get_at(key, Utc::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Vec<DnsRecord>> {
        let mut table = self.lock();
        Self::take_live(&mut table, key, now)
    }

    fn take_live(
        table: &mut CacheTable,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Option<Vec<DnsRecord>> {
        let expired = table.entries.get(key)?.is_expired(now);
        if expired {
            table.remove(key);
            debug!("Dropped expired cache entry {} {}", key.name, key.rtype);
            return None;
        }
        let entry = table.entries.get_mut(key)?;
        entry.last_query_at = Some(now);
        Some(entry.records_at(now))
    }

    /// Answer a question from the cache, following cached CNAMEs.
    ///
    /// A lookup hits only when the chain ends in a live RRset of the requested
    /// type; the CNAMEs along the way come first in the answer.
    pub fn resolve(&self, name: &str, qtype: u16, class: DnsClass) -> Option<Vec<DnsRecord>> {
        self.resolve_at(name, qtype, class, Utc::now())
    }

    pub fn resolve_at(
        &self,
        name: &str,
        qtype: u16,
        class: DnsClass,
        now: DateTime<Utc>,
    ) -> Option<Vec<DnsRecord>> {
        if qtype == QTYPE_ANY {
            return None;
        }
        let rtype = RecordType::from_code(qtype);
        let mut table = self.lock();
        let mut answers = Vec::new();
        let mut owner = normalize_name(name);

        for _ in 0..=MAX_CNAME_HOPS {
            let key = CacheKey::new(&owner, rtype, class);
            if let Some(records) = Self::take_live(&mut table, &key, now) {
                answers.extend(records);
                return Some(answers);
            }
            if rtype == RecordType::CNAME {
                return None;
            }
            let cname_key = CacheKey::new(&owner, RecordType::CNAME, class);
            let cnames = Self::take_live(&mut table, &cname_key, now)?;
            owner = normalize_name(&cnames.first()?.value);
            answers.extend(cnames);
        }
        None
    }

    /// Insert one record, replacing whatever was cached under its key.
    pub fn put(&self, record: DnsRecord) {
        self.put_all_at(vec![record], Utc::now());
    }

    /// Insert the answer records of one upstream reply.
    ///
    /// Records sharing a key are stored together as one RRset expiring with
    /// the smallest TTL among them. Zero-TTL records are not cached.
    pub fn put_all(&self, records: Vec<DnsRecord>) {
        self.put_all_at(records, Utc::now());
    }

    pub fn put_all_at(&self, records: Vec<DnsRecord>, now: DateTime<Utc>) {
        let mut grouped: Vec<(CacheKey, Vec<DnsRecord>)> = Vec::new();
        for mut record in records {
            record.ttl = record.ttl.min(MAX_CACHE_TTL);
            let key = CacheKey::of(&record);
            match grouped.iter_mut().find(|(k, _)| *k == key) {
                Some((_, set)) => set.push(record),
                None => grouped.push((key, vec![record])),
            }
        }

        let mut table = self.lock();
        for (key, records) in grouped {
            let ttl = records.iter().map(|r| r.ttl).min().unwrap_or(0);
            if ttl == 0 {
                continue;
            }
            if let Some(existing) = table.entries.get(&key) {
                if existing.inserted_at > now {
                    continue;
                }
            }
            let entry = CacheEntry {
                records,
                inserted_at: now,
                expires_at: now + chrono::Duration::seconds(ttl as i64),
                last_query_at: None,
            };
            debug!("Cached {} {} for {}s", key.name, key.rtype, ttl);
            table.insert(key, entry);
        }
        table.evict(self.capacity);
    }

    /// Remove all expired entries.
    ///
    /// # Returns
    /// The number of entries removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        self.lock().purge(now)
    }

    pub fn clear(&self) {
        self.lock().clear();
        info!("Cache cleared");
    }

    /// Live entries, with TTLs showing the time left.
    pub fn list(&self) -> Vec<CacheRecord> {
        let now = Utc::now();
        let table = self.lock();
        let mut out: Vec<CacheRecord> = table
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .flat_map(|entry| {
                entry.records_at(now).into_iter().map(|dns_record| CacheRecord {
                    dns_record,
                    expiry: entry.expires_at,
                    timestamp: entry.inserted_at,
                    last_query: entry.last_query_at,
                })
            })
            .collect();
        out.sort_by(|a, b| {
            (&a.dns_record.name, a.dns_record.rtype).cmp(&(&b.dns_record.name, b.dns_record.rtype))
        });
        out
    }

    /// Every entry, one snapshot record per cached RR, with absolute expiry.
    pub fn snapshot(&self) -> Vec<CacheRecord> {
        let table = self.lock();
        table
            .entries
            .values()
            .flat_map(|entry| {
                entry.records.iter().map(|record| CacheRecord {
                    dns_record: record.clone(),
                    expiry: entry.expires_at,
                    timestamp: entry.inserted_at,
                    last_query: entry.last_query_at,
                })
            })
            .collect()
    }

    /// Load snapshot records, discarding any that already expired.
    ///
    /// # Returns
    /// The number of records restored.
    pub fn restore(&self, records: Vec<CacheRecord>) -> usize {
        self.restore_at(records, Utc::now())
    }

    pub fn restore_at(&self, records: Vec<CacheRecord>, now: DateTime<Utc>) -> usize {
        let mut table = self.lock();
        let mut restored = 0;
        for record in records {
            if record.expiry <= now || record.timestamp >= record.expiry {
                continue;
            }
            let key = CacheKey::of(&record.dns_record);
            let mut dns_record = record.dns_record;
            dns_record.name = key.name.clone();
            let existing = table.entries.get(&key).map(|entry| entry.inserted_at);
            match existing {
                // same insertion: another member of the RRset
                Some(inserted_at) if inserted_at == record.timestamp => {
                    table.shorten(&key, record.expiry);
                    if let Some(entry) = table.entries.get_mut(&key) {
                        entry.records.push(dns_record);
                    }
                }
                Some(inserted_at) if inserted_at > record.timestamp => continue,
                _ => {
                    table.insert(
                        key,
                        CacheEntry {
                            records: vec![dns_record],
                            inserted_at: record.timestamp,
                            expires_at: record.expiry,
                            last_query_at: record.last_query,
                        },
                    );
                }
            }
            restored += 1;
        }
        table.evict(self.capacity);
        restored
    }

    /// Write the snapshot file.
    pub fn save(&self, path: &Path) -> Result<(), PersistError> {
        let file = CacheFile {
            cache: self.snapshot(),
        };
        write_json(path, &file)
    }

    /// Restore from the snapshot file; a missing file restores nothing.
    pub fn load(&self, path: &Path) -> Result<usize, PersistError> {
        let file: CacheFile = read_json(path)?.unwrap_or_default();
        Ok(self.restore(file.cache))
    }

    /// How long the sweeper should wait before its next pass.
    ///
    /// Every 30 seconds, or a tenth of the shortest entry lifetime if that is
    /// longer.
    pub fn sweep_interval(&self) -> Duration {
        let table = self.lock();
        let shortest = table.entries.values().map(CacheEntry::original_ttl).min();
        match shortest {
            Some(secs) if secs > 0 => {
                CACHE_CLEANUP_INTERVAL.max(Duration::from_secs(secs as u64 / 10))
            }
            _ => CACHE_CLEANUP_INTERVAL,
        }
    }
}

/// Periodically purge expired entries and, if a path is given, save a snapshot.
///
/// Runs until `shutdown` is cancelled.
pub async fn run_sweeper(
    cache: Arc<DnsCache>,
    snapshot_path: Option<PathBuf>,
    shutdown: CancellationToken,
) {
    info!("Starting cache sweeper");
    loop {
        let interval = cache.sweep_interval();
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Cache sweeper shutting down");
                break;
            }
            _ = tokio::time::sleep(interval) => {
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("Cache cleanup removed {} expired entries", removed);
                }
                if let Some(path) = &snapshot_path {
                    let (cache, path) = (cache.clone(), path.clone());
                    match tokio::task::spawn_blocking(move || cache.save(&path)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!("Failed to save cache snapshot: {}", e),
                        Err(e) => warn!("Cache snapshot task failed: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn a(name: &str, ip: &str, ttl: u32) -> DnsRecord {
        DnsRecord::new(name, RecordType::A, ip, ttl)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, RecordType::A, DnsClass::IN)
    }

    #[test]
    fn ttl_counts_down_then_expires() {
        let cache = DnsCache::new(16);
        cache.put_all_at(vec![a("example.net.", "1.2.3.4", 300)], t(0));

        let first = cache.get_at(&key("example.net."), t(0)).unwrap();
        assert_eq!(first[0].ttl, 300);
        let later = cache.get_at(&key("Example.NET."), t(10)).unwrap();
        assert_eq!(later[0].ttl, 290);
        let last = cache.get_at(&key("example.net."), t(299)).unwrap();
        assert_eq!(last[0].ttl, 1);

        assert!(cache.get_at(&key("example.net."), t(300)).is_none());
        // dropped on discovery
        assert!(cache.is_empty());
    }

    #[test]
    fn remaining_ttl_is_monotonic() {
        let cache = DnsCache::new(16);
        cache.put_all_at(vec![a("m.net.", "1.1.1.1", 50)], t(0));
        let mut previous = u32::MAX;
        for step in 0..50 {
            let ttl = cache.get_at(&key("m.net."), t(step)).unwrap()[0].ttl;
            assert!(ttl <= previous);
            previous = ttl;
        }
    }

    #[test]
    fn rrsets_and_overwrite() {
        let cache = DnsCache::new(16);
        cache.put_all_at(
            vec![a("multi.net.", "1.1.1.1", 300), a("multi.net.", "1.1.1.2", 200)],
            t(0),
        );
        let got = cache.get_at(&key("multi.net."), t(0)).unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|r| r.ttl == 200));

        cache.put_all_at(vec![a("multi.net.", "9.9.9.9", 60)], t(5));
        let got = cache.get_at(&key("multi.net."), t(5)).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].value, "9.9.9.9");

        // an older insertion does not replace a newer one
        cache.put_all_at(vec![a("multi.net.", "8.8.8.8", 60)], t(1));
        assert_eq!(cache.get_at(&key("multi.net."), t(6)).unwrap()[0].value, "9.9.9.9");
    }

    #[test]
    fn zero_ttl_not_cached_and_long_ttl_capped() {
        let cache = DnsCache::new(16);
        cache.put_all_at(vec![a("zero.net.", "1.1.1.1", 0)], t(0));
        assert!(cache.is_empty());

        cache.put_all_at(vec![a("long.net.", "1.1.1.1", u32::MAX)], t(0));
        let got = cache.get_at(&key("long.net."), t(0)).unwrap();
        assert_eq!(got[0].ttl, MAX_CACHE_TTL);
    }

    #[test]
    fn evicts_earliest_expiry() {
        let cache = DnsCache::new(2);
        cache.put_all_at(vec![a("long.net.", "1.1.1.1", 1000)], t(0));
        cache.put_all_at(vec![a("short.net.", "1.1.1.2", 10)], t(0));
        cache.put_all_at(vec![a("mid.net.", "1.1.1.3", 100)], t(0));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&key("short.net."), t(1)).is_none());
        assert!(cache.get_at(&key("long.net."), t(1)).is_some());
        assert!(cache.get_at(&key("mid.net."), t(1)).is_some());
    }

    #[test]
    fn follows_cached_cnames() {
        let cache = DnsCache::new(16);
        cache.put_all_at(
            vec![
                DnsRecord::new("www.example.net.", RecordType::CNAME, "web.example.net.", 300),
                a("web.example.net.", "1.2.3.4", 60),
            ],
            t(0),
        );

        let got = cache
            .resolve_at("WWW.example.net.", RecordType::A.code(), DnsClass::IN, t(1))
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].rtype, RecordType::CNAME);
        assert_eq!(got[1].value, "1.2.3.4");

        // CNAME target gone: no partial answer
        assert!(cache
            .resolve_at("www.example.net.", RecordType::A.code(), DnsClass::IN, t(61))
            .is_none());
        assert!(cache
            .resolve_at("www.example.net.", RecordType::CNAME.code(), DnsClass::IN, t(61))
            .is_some());
        assert!(cache
            .resolve_at("www.example.net.", QTYPE_ANY, DnsClass::IN, t(1))
            .is_none());
    }

    #[test]
    fn expiry_index_tracks_overwrites_and_removals() {
        let cache = DnsCache::new(2);
        cache.put_all_at(vec![a("one.net.", "1.1.1.1", 10)], t(0));
        // overwrite moves the expiry far out
        cache.put_all_at(vec![a("one.net.", "1.1.1.1", 1000)], t(1));
        cache.put_all_at(vec![a("two.net.", "1.1.1.2", 100)], t(1));
        cache.put_all_at(vec![a("three.net.", "1.1.1.3", 500)], t(1));

        assert_eq!(cache.len(), 2);
        assert!(cache.get_at(&key("two.net."), t(2)).is_none());
        assert!(cache.get_at(&key("one.net."), t(2)).is_some());

        // expired entry dropped by a lookup must not linger in the index
        assert!(cache.get_at(&key("three.net."), t(600)).is_none());
        assert_eq!(cache.purge_expired_at(t(600)), 0);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired_at(t(2000)), 1);
        assert!(cache.is_empty());

        cache.put_all_at(vec![a("four.net.", "1.1.1.4", 100)], t(0));
        cache.clear();
        assert_eq!(cache.purge_expired_at(t(1000)), 0);
    }

    #[test]
    fn purge_and_sweep_interval() {
        let cache = DnsCache::new(16);
        assert_eq!(cache.sweep_interval(), CACHE_CLEANUP_INTERVAL);
        cache.put_all_at(vec![a("short.net.", "1.1.1.1", 10)], t(0));
        cache.put_all_at(vec![a("long.net.", "1.1.1.2", 3600)], t(0));
        assert_eq!(cache.sweep_interval(), CACHE_CLEANUP_INTERVAL);
        assert_eq!(cache.purge_expired_at(t(20)), 1);
        assert_eq!(cache.sweep_interval(), Duration::from_secs(360));
    }

    #[test]
    fn snapshot_restore_discards_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnscache.json");
        let now = Utc::now();

        let cache = DnsCache::new(16);
        cache.put_all_at(
            vec![a("keep.net.", "1.1.1.1", 3600), a("keep.net.", "1.1.1.2", 3600)],
            now,
        );
        cache.put_all_at(vec![a("gone.net.", "1.1.1.3", 1)], now - chrono::Duration::seconds(10));
        cache.save(&path).unwrap();

        let restored = DnsCache::new(16);
        assert_eq!(restored.load(&path).unwrap(), 2);
        let got = restored.get(&key("keep.net.")).unwrap();
        assert_eq!(got.len(), 2);
        assert!(restored.get(&key("gone.net.")).is_none());

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let first = &json["cache"][0];
        assert!(first["dns_record"]["name"].is_string());
        assert!(first["expiry"].is_string());
        assert!(first["timestamp"].is_string());
    }

    #[test]
    fn list_and_clear() {
        let cache = DnsCache::new(16);
        cache.put(a("b.net.", "1.1.1.1", 300));
        cache.put(a("a.net.", "1.1.1.2", 300));
        let listed = cache.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].dns_record.name, "a.net.");
        cache.clear();
        assert!(cache.list().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_and_writes_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dnscache.json");
        let now = Utc::now();

        let cache = Arc::new(DnsCache::new(16));
        cache.put_all_at(vec![a("live.net.", "1.1.1.1", 100)], now);
        cache.put_all_at(
            vec![a("stale.net.", "1.1.1.2", 1)],
            now - chrono::Duration::seconds(20),
        );

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(run_sweeper(
            cache.clone(),
            Some(path.clone()),
            shutdown.clone(),
        ));
        tokio::time::sleep(CACHE_CLEANUP_INTERVAL + Duration::from_secs(1)).await;
        shutdown.cancel();
        sweeper.await.unwrap();

        assert_eq!(cache.len(), 1);
        let file: CacheFile = read_json(&path).unwrap().unwrap();
        assert_eq!(file.cache.len(), 1);
        assert_eq!(file.cache[0].dns_record.name, "live.net.");
    }
}
