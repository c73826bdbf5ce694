//! Mapping database: local EID prefixes and the remote map-cache.
//!
//! Both tables are bit tries (`prefix_trie::PrefixMap`) per address family,
//! so a longest-prefix match costs O(prefix length) regardless of how many
//! mappings are cached.

use ipnet::{Ipv4Net, Ipv6Net};
use prefix_trie::PrefixMap;
use std::net::IpAddr;
use std::time::Instant;
use tracing::debug;

use crate::eid::{EidPrefix, LocalEidEntry, Locator};
use crate::scheduler::TimerHandle;

/// Resolution state of a map-cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// A map-request is in flight; no locators yet.
    Incomplete,
    /// Resolved to a non-empty locator set.
    Complete,
    /// Resolution failed or the mapping system said "no mapping".
    Negative,
}

/// A single in-flight map-request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    pub nonce: u64,
    /// 1-based count of map-requests sent so far.
    pub attempt: u32,
    pub max_attempts: u32,
    pub next_deadline: Instant,
    /// Retry timer; the scheduler only knows the prefix, never this entry.
    pub timer: TimerHandle,
}

/// A mapping learned (or being learned) through the control protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapCacheEntry {
    pub prefix: EidPrefix,
    pub locators: Vec<Locator>,
    pub state: CacheState,
    pub ttl_deadline: Instant,
    pub pending: Option<PendingRequest>,
}

impl MapCacheEntry {
    /// Entry awaiting a map-reply. `ttl_deadline` is only a safety bound.
    pub fn incomplete(prefix: EidPrefix, pending: PendingRequest, ttl_deadline: Instant) -> Self {
        Self {
            prefix,
            locators: Vec::new(),
            state: CacheState::Incomplete,
            ttl_deadline,
            pending: Some(pending),
        }
    }

    /// Resolved entry. An empty locator set yields a negative entry instead.
    pub fn complete(prefix: EidPrefix, locators: Vec<Locator>, ttl_deadline: Instant) -> Self {
        if locators.is_empty() {
            return Self::negative(prefix, ttl_deadline);
        }
        Self {
            prefix,
            locators,
            state: CacheState::Complete,
            ttl_deadline,
            pending: None,
        }
    }

    pub fn negative(prefix: EidPrefix, ttl_deadline: Instant) -> Self {
        Self {
            prefix,
            locators: Vec::new(),
            state: CacheState::Negative,
            ttl_deadline,
            pending: None,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.ttl_deadline <= now
    }
}

/// Result of a longest-prefix-match lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupResult<'a> {
    LocalHit(&'a LocalEidEntry),
    CacheHit(&'a MapCacheEntry),
    Miss,
}

/// IPv4 + IPv6 LPM table keyed by EID prefix.
#[derive(Clone)]
struct PrefixTable<T> {
    v4: PrefixMap<Ipv4Net, T>,
    v6: PrefixMap<Ipv6Net, T>,
}

impl<T> PrefixTable<T> {
    fn new() -> Self {
        Self {
            v4: PrefixMap::new(),
            v6: PrefixMap::new(),
        }
    }

    fn lookup(&self, addr: IpAddr) -> Option<&T> {
        match addr {
            IpAddr::V4(a) => self
                .v4
                .get_lpm(&Ipv4Net::from(a))
                .map(|(_, value)| value),
            IpAddr::V6(a) => self
                .v6
                .get_lpm(&Ipv6Net::from(a))
                .map(|(_, value)| value),
        }
    }

    fn get(&self, prefix: &EidPrefix) -> Option<&T> {
        match prefix {
            EidPrefix::V4(p) => self.v4.get(p),
            EidPrefix::V6(p) => self.v6.get(p),
        }
    }

    fn get_mut(&mut self, prefix: &EidPrefix) -> Option<&mut T> {
        match prefix {
            EidPrefix::V4(p) => self.v4.get_mut(p),
            EidPrefix::V6(p) => self.v6.get_mut(p),
        }
    }

    fn insert(&mut self, prefix: EidPrefix, value: T) -> Option<T> {
        match prefix {
            EidPrefix::V4(p) => self.v4.insert(p, value),
            EidPrefix::V6(p) => self.v6.insert(p, value),
        }
    }

    fn remove(&mut self, prefix: &EidPrefix) -> Option<T> {
        match prefix {
            EidPrefix::V4(p) => self.v4.remove(p),
            EidPrefix::V6(p) => self.v6.remove(p),
        }
    }

    fn values(&self) -> impl Iterator<Item = &T> {
        self.v4
            .iter()
            .map(|(_, v)| v)
            .chain(self.v6.iter().map(|(_, v)| v))
    }

    fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }
}

/// Owner of every local and cached mapping.
pub struct MappingStore {
    local: PrefixTable<LocalEidEntry>,
    cache: PrefixTable<MapCacheEntry>,
}

impl MappingStore {
    /// Build the store with the local database, which is fixed from now on.
    pub fn new(local: impl IntoIterator<Item = LocalEidEntry>) -> Self {
        let mut table = PrefixTable::new();
        for entry in local {
            table.insert(entry.prefix, entry);
        }
        Self {
            local: table,
            cache: PrefixTable::new(),
        }
    }

    /// Longest-prefix match, local database first, then the map-cache.
    pub fn lookup(&self, addr: IpAddr) -> LookupResult<'_> {
        if let Some(entry) = self.local.lookup(addr) {
            return LookupResult::LocalHit(entry);
        }
        match self.cache.lookup(addr) {
            Some(entry) => LookupResult::CacheHit(entry),
            None => LookupResult::Miss,
        }
    }

    /// Longest-prefix match restricted to the local database.
    pub fn lookup_local(&self, addr: IpAddr) -> Option<&LocalEidEntry> {
        self.local.lookup(addr)
    }

    /// Insert a cache entry, returning the one it replaced.
    pub fn insert_cache(&mut self, entry: MapCacheEntry) -> Option<MapCacheEntry> {
        self.cache.insert(entry.prefix, entry)
    }

    pub fn cache_entry(&self, prefix: &EidPrefix) -> Option<&MapCacheEntry> {
        self.cache.get(prefix)
    }

    pub fn cache_entry_mut(&mut self, prefix: &EidPrefix) -> Option<&mut MapCacheEntry> {
        self.cache.get_mut(prefix)
    }

    pub fn remove_cache(&mut self, prefix: &EidPrefix) -> Option<MapCacheEntry> {
        self.cache.remove(prefix)
    }

    /// Remove every cache entry whose TTL deadline has passed.
    ///
    /// Removed entries are returned so the caller can release anything they
    /// still reference (e.g. a retry timer).
    pub fn expire(&mut self, now: Instant) -> Vec<MapCacheEntry> {
        let expired: Vec<EidPrefix> = self
            .cache
            .values()
            .filter(|e| e.is_expired(now))
            .map(|e| e.prefix)
            .collect();

        let removed: Vec<MapCacheEntry> = expired
            .iter()
            .filter_map(|prefix| self.cache.remove(prefix))
            .collect();

        if !removed.is_empty() {
            debug!(count = removed.len(), "Expired map-cache entries");
        }
        removed
    }

    pub fn local_entries(&self) -> impl Iterator<Item = &LocalEidEntry> {
        self.local.values()
    }

    pub fn cache_entries(&self) -> impl Iterator<Item = &MapCacheEntry> {
        self.cache.values()
    }

    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
