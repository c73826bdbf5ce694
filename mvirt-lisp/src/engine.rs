//! Control-plane state machine.
//!
//! Per target prefix: `NoEntry -> Incomplete -> {Complete | Negative}`, and
//! back to `NoEntry` when the map-cache entry expires. Map-register refresh
//! runs independently of data-plane misses.
//!
//! The engine never blocks: every operation sends at most a handful of
//! datagrams through the `DatagramBackend` it is handed and returns.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::{debug, info, trace, warn};

use crate::backend::DatagramBackend;
use crate::config::{Config, TimerConfig};
use crate::eid::EidPrefix;
use crate::scheduler::{RetryScheduler, TimerHandle, deadline_after};
use crate::store::{CacheState, LookupResult, MapCacheEntry, MappingStore, PendingRequest};
use crate::wire::{ControlMessage, MAX_RECORDS, MapRegister, MapReply, MapRequest, MappingRecord};

/// What a scheduler timer is for. Holds keys only, never cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerContext {
    MapRequestRetry(EidPrefix),
    MapRegisterRefresh,
    CacheExpiry,
}

/// Engine-relevant part of the daemon configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Announced as ITR-RLOC in map-requests.
    pub source_rloc: IpAddr,
    pub map_resolvers: Vec<IpAddr>,
    pub map_servers: Vec<IpAddr>,
    pub proxy_reply: bool,
    pub control_port: u16,
    pub timers: TimerConfig,
}

impl From<&Config> for EngineSettings {
    fn from(config: &Config) -> Self {
        Self {
            source_rloc: config.source_rloc,
            map_resolvers: config.map_resolvers.clone(),
            map_servers: config.map_servers.clone(),
            proxy_reply: config.proxy_reply,
            control_port: config.control_port,
            timers: config.timers.clone(),
        }
    }
}

pub struct ProtocolEngine {
    settings: EngineSettings,
    store: MappingStore,
    scheduler: RetryScheduler<TimerContext>,
    /// Outstanding map-request nonces and the prefix each one resolves.
    nonces: HashMap<u64, EidPrefix>,
    rng: StdRng,
}

impl ProtocolEngine {
    pub fn new(settings: EngineSettings, store: MappingStore) -> Self {
        Self::with_rng(settings, store, StdRng::from_entropy())
    }

    /// Build an engine with a caller-provided nonce source.
    pub fn with_rng(settings: EngineSettings, store: MappingStore, rng: StdRng) -> Self {
        Self {
            settings,
            store,
            scheduler: RetryScheduler::new(),
            nonces: HashMap::new(),
            rng,
        }
    }

    /// Register with every map-server and arm the periodic jobs.
    pub fn start(&mut self, now: Instant, tx: &mut impl DatagramBackend) -> crate::Result<()> {
        for entry in self.store.local_entries() {
            debug!(eid = %entry.prefix, locators = ?entry.locators, "Local EID");
        }

        self.send_map_register(tx);

        let timers = &self.settings.timers;
        self.scheduler.schedule(
            deadline_after(now, timers.register_interval),
            Some(timers.register_interval),
            TimerContext::MapRegisterRefresh,
            now,
        )?;
        self.scheduler.schedule(
            deadline_after(now, timers.expire_interval),
            Some(timers.expire_interval),
            TimerContext::CacheExpiry,
            now,
        )?;

        info!(
            local_eids = self.store.local_len(),
            map_servers = self.settings.map_servers.len(),
            map_resolvers = self.settings.map_resolvers.len(),
            "Protocol engine started"
        );
        Ok(())
    }

    pub fn lookup(&self, addr: IpAddr) -> LookupResult<'_> {
        self.store.lookup(addr)
    }

    /// Start resolving `addr` unless something already covers it.
    ///
    /// Returns true if a new map-request was sent.
    pub fn on_miss(&mut self, addr: IpAddr, now: Instant, tx: &mut impl DatagramBackend) -> bool {
        if self.store.lookup(addr) != LookupResult::Miss {
            trace!(%addr, "Resolution already covered");
            return false;
        }

        let prefix = EidPrefix::host(addr);
        let timeout = self.settings.timers.request_timeout;
        let retry_at = deadline_after(now, timeout);
        let timer = match self.scheduler.schedule(
            retry_at,
            None,
            TimerContext::MapRequestRetry(prefix),
            now,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(eid = %prefix, error = %e, "Failed to schedule map-request retry");
                return false;
            }
        };

        let nonce = self.fresh_nonce();
        let max_attempts = self.settings.timers.max_attempts;
        let pending = PendingRequest {
            nonce,
            attempt: 1,
            max_attempts,
            next_deadline: retry_at,
            timer,
        };
        let safety = timeout
            .checked_mul(max_attempts.saturating_add(1))
            .unwrap_or(Duration::MAX);
        self.store.insert_cache(MapCacheEntry::incomplete(
            prefix,
            pending,
            deadline_after(now, safety),
        ));
        self.nonces.insert(nonce, prefix);

        debug!(eid = %prefix, nonce, "Map-cache miss, resolving");
        self.send_map_request(prefix, nonce, tx);
        true
    }

    /// Run every scheduler job due at `now`.
    pub fn on_timer_tick(&mut self, now: Instant, tx: &mut impl DatagramBackend) {
        for context in self.scheduler.drain_due(now) {
            match context {
                TimerContext::MapRequestRetry(prefix) => self.retry_map_request(prefix, now, tx),
                TimerContext::MapRegisterRefresh => {
                    self.send_map_register(tx);
                }
                TimerContext::CacheExpiry => self.expire(now),
            }
        }
    }

    /// Handle one datagram received on the control socket.
    pub fn handle_control(
        &mut self,
        buf: &[u8],
        from: SocketAddr,
        now: Instant,
        tx: &mut impl DatagramBackend,
    ) {
        let message = match ControlMessage::decode(buf) {
            Ok(m) => m,
            Err(e) => {
                debug!(%from, error = %e, "Dropping malformed control message");
                return;
            }
        };

        match message {
            ControlMessage::MapReply(reply) => self.handle_map_reply(reply, from, now),
            ControlMessage::MapRequest(request) => self.handle_map_request(request, from, tx),
            ControlMessage::MapNotify(notify) => {
                info!(
                    %from,
                    nonce = notify.nonce,
                    records = notify.records.len(),
                    "Map-notify received"
                );
            }
            ControlMessage::MapRegister(_) => {
                debug!(%from, "Ignoring map-register, not a map-server");
            }
        }
    }

    /// Send the local database to every map-server.
    ///
    /// Databases larger than one message can carry are split into several
    /// map-registers. Returns how many messages were handed to the backend.
    pub fn send_map_register(&mut self, tx: &mut impl DatagramBackend) -> usize {
        let ttl_minutes = self.settings.timers.register_ttl_minutes;
        let records: Vec<MappingRecord> = self
            .store
            .local_entries()
            .map(|entry| MappingRecord {
                ttl_minutes,
                prefix: entry.prefix,
                action: 0,
                authoritative: true,
                locators: entry.locators.clone(),
            })
            .collect();

        let mut sent = 0;
        for batch in records.chunks(MAX_RECORDS) {
            let message = match ControlMessage::MapRegister(MapRegister {
                nonce: self.rng.next_u64(),
                proxy_reply: self.settings.proxy_reply,
                want_notify: false,
                key_id: 0,
                records: batch.to_vec(),
            })
            .encode()
            {
                Ok(message) => message,
                Err(e) => {
                    warn!(error = %e, "Failed to encode map-register");
                    continue;
                }
            };

            for server in &self.settings.map_servers {
                let to = SocketAddr::new(*server, self.settings.control_port);
                match tx.send_to(&message, to) {
                    Ok(()) => {
                        sent += 1;
                        debug!(%server, records = batch.len(), "Map-register sent");
                    }
                    Err(e) => warn!(%server, error = %e, "Failed to send map-register"),
                }
            }
        }
        sent
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MappingStore {
        &mut self.store
    }

    /// Number of map-requests awaiting a reply.
    pub fn pending_requests(&self) -> usize {
        self.nonces.len()
    }

    /// Earliest scheduler deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.scheduler.next_deadline()
    }

    fn fresh_nonce(&mut self) -> u64 {
        loop {
            let nonce = self.rng.next_u64();
            if nonce != 0 && !self.nonces.contains_key(&nonce) {
                return nonce;
            }
        }
    }

    /// Send to the first resolver that accepts the datagram.
    fn send_map_request(&self, prefix: EidPrefix, nonce: u64, tx: &mut impl DatagramBackend) {
        let message = match ControlMessage::MapRequest(MapRequest {
            nonce,
            source_eid: None,
            itr_rlocs: vec![self.settings.source_rloc],
            eids: vec![prefix],
        })
        .encode()
        {
            Ok(message) => message,
            Err(e) => {
                warn!(eid = %prefix, error = %e, "Failed to encode map-request");
                return;
            }
        };

        for resolver in &self.settings.map_resolvers {
            let to = SocketAddr::new(*resolver, self.settings.control_port);
            match tx.send_to(&message, to) {
                Ok(()) => {
                    trace!(eid = %prefix, %resolver, "Map-request sent");
                    return;
                }
                Err(e) => warn!(eid = %prefix, %resolver, error = %e, "Failed to send map-request"),
            }
        }
        warn!(eid = %prefix, "No map-resolver reachable");
    }

    fn retry_map_request(&mut self, prefix: EidPrefix, now: Instant, tx: &mut impl DatagramBackend) {
        let timeout = self.settings.timers.request_timeout;

        let Some(entry) = self.store.cache_entry_mut(&prefix) else {
            trace!(eid = %prefix, "Retry for vanished entry");
            return;
        };
        let Some(pending) = entry.pending.as_mut() else {
            trace!(eid = %prefix, "Retry for resolved entry");
            return;
        };

        if pending.attempt < pending.max_attempts {
            let retry_at = deadline_after(now, timeout);
            let timer = match self.scheduler.schedule(
                retry_at,
                None,
                TimerContext::MapRequestRetry(prefix),
                now,
            ) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(eid = %prefix, error = %e, "Failed to reschedule map-request");
                    return;
                }
            };
            pending.attempt += 1;
            pending.timer = timer;
            pending.next_deadline = retry_at;
            let (nonce, attempt) = (pending.nonce, pending.attempt);

            debug!(eid = %prefix, attempt, "Retrying map-request");
            self.send_map_request(prefix, nonce, tx);
            return;
        }

        let nonce = pending.nonce;
        let attempts = pending.attempt;
        self.nonces.remove(&nonce);
        let negative_ttl = self.settings.timers.negative_ttl;
        self.store.insert_cache(MapCacheEntry::negative(
            prefix,
            deadline_after(now, negative_ttl),
        ));
        info!(eid = %prefix, attempts, "Map-request unanswered, caching negative entry");
    }

    fn handle_map_reply(&mut self, reply: MapReply, from: SocketAddr, now: Instant) {
        let Some(&prefix) = self.nonces.get(&reply.nonce) else {
            debug!(
                %from,
                nonce = reply.nonce,
                "Discarding map-reply with unknown nonce"
            );
            return;
        };

        let matches = self.store.cache_entry(&prefix).is_some_and(|e| {
            e.state == CacheState::Incomplete
                && e.pending.as_ref().is_some_and(|p| p.nonce == reply.nonce)
        });
        if !matches {
            debug!(eid = %prefix, %from, "Map-reply for stale request");
            self.nonces.remove(&reply.nonce);
            return;
        }

        let target = prefix.addr();
        let record = reply
            .records
            .into_iter()
            .find(|rec| rec.prefix.contains(target));

        let resolved = match record {
            Some(rec) => {
                let ttl = Duration::from_secs(u64::from(rec.ttl_minutes) * 60);
                MapCacheEntry::complete(rec.prefix, rec.locators, deadline_after(now, ttl))
            }
            None => {
                // No record covering the requested EID: treat as "no mapping".
                let negative_ttl = self.settings.timers.negative_ttl;
                MapCacheEntry::negative(prefix, deadline_after(now, negative_ttl))
            }
        };

        self.nonces.remove(&reply.nonce);
        if let Some(old) = self.store.remove_cache(&prefix) {
            self.release(&old);
        }

        info!(
            eid = %resolved.prefix,
            state = ?resolved.state,
            locators = resolved.locators.len(),
            "Map-reply accepted"
        );
        if let Some(replaced) = self.store.insert_cache(resolved) {
            self.release(&replaced);
        }
    }

    /// Answer a map-request for one of our own EIDs.
    fn handle_map_request(
        &mut self,
        request: MapRequest,
        from: SocketAddr,
        tx: &mut impl DatagramBackend,
    ) {
        let ttl_minutes = self.settings.timers.register_ttl_minutes;
        let records: Vec<MappingRecord> = request
            .eids
            .iter()
            .filter_map(|eid| {
                self.store
                    .lookup_local(eid.addr())
                    .filter(|local| local.prefix.prefix_len() <= eid.prefix_len())
            })
            .map(|local| MappingRecord {
                ttl_minutes,
                prefix: local.prefix,
                action: 0,
                authoritative: true,
                locators: local.locators.clone(),
            })
            .collect();

        if records.is_empty() {
            debug!(%from, eids = ?request.eids, "Ignoring map-request for foreign EID");
            return;
        }

        let itr = request.itr_rlocs.first().copied().unwrap_or(from.ip());
        let to = SocketAddr::new(itr, self.settings.control_port);
        let message = match ControlMessage::MapReply(MapReply {
            nonce: request.nonce,
            records,
        })
        .encode()
        {
            Ok(message) => message,
            Err(e) => {
                warn!(%to, error = %e, "Failed to encode map-reply");
                return;
            }
        };

        match tx.send_to(&message, to) {
            Ok(()) => debug!(%to, "Map-reply sent"),
            Err(e) => warn!(%to, error = %e, "Failed to send map-reply"),
        }
    }

    fn expire(&mut self, now: Instant) {
        for entry in self.store.expire(now) {
            trace!(eid = %entry.prefix, state = ?entry.state, "Map-cache entry expired");
            self.release(&entry);
        }
    }

    /// Drop the retry timer and nonce of an entry leaving the cache.
    fn release(&mut self, entry: &MapCacheEntry) {
        if let Some(pending) = &entry.pending {
            self.cancel_timer(pending.timer);
            self.nonces.remove(&pending.nonce);
        }
    }

    fn cancel_timer(&mut self, handle: TimerHandle) {
        if !self.scheduler.cancel(handle) {
            trace!(%handle, "Timer already gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eid::{LocalEidEntry, Locator};
    use std::io;

    #[derive(Default)]
    struct Capture {
        sent: Vec<(Vec<u8>, SocketAddr)>,
    }

    impl DatagramBackend for Capture {
        fn try_recv_from(&mut self, _buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
            Ok(None)
        }

        fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
            self.sent.push((buf.to_vec(), to));
            Ok(())
        }

        fn poll_fd(&self) -> Option<std::os::fd::RawFd> {
            None
        }
    }

    fn engine() -> ProtocolEngine {
        let settings = EngineSettings {
            source_rloc: "192.0.2.1".parse().unwrap(),
            map_resolvers: vec!["192.0.2.100".parse().unwrap()],
            map_servers: vec!["192.0.2.200".parse().unwrap()],
            proxy_reply: false,
            control_port: 4342,
            timers: TimerConfig::default(),
        };
        let local = LocalEidEntry::new(
            "10.0.0.0/24".parse().unwrap(),
            vec![Locator::new("192.0.2.1".parse().unwrap(), 1, 100)],
        );
        ProtocolEngine::with_rng(settings, MappingStore::new([local]), StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_local_eid_is_not_resolved() {
        let mut engine = engine();
        let mut tx = Capture::default();
        assert!(!engine.on_miss("10.0.0.9".parse().unwrap(), Instant::now(), &mut tx));
        assert!(tx.sent.is_empty());
    }

    #[test]
    fn test_fresh_nonces_are_unique_and_nonzero() {
        let mut engine = engine();
        let a = engine.fresh_nonce();
        engine.nonces.insert(a, "10.1.0.1/32".parse().unwrap());
        let b = engine.fresh_nonce();
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn test_map_request_goes_to_resolver() {
        let mut engine = engine();
        let mut tx = Capture::default();
        let t0 = Instant::now();

        assert!(engine.on_miss("203.0.113.7".parse().unwrap(), t0, &mut tx));
        assert_eq!(tx.sent.len(), 1);
        let (bytes, to) = &tx.sent[0];
        assert_eq!(*to, "192.0.2.100:4342".parse().unwrap());

        let ControlMessage::MapRequest(req) = ControlMessage::decode(bytes).unwrap() else {
            panic!("expected map-request");
        };
        assert_eq!(req.eids, vec!["203.0.113.7/32".parse().unwrap()]);
        assert_eq!(req.itr_rlocs, vec!["192.0.2.1".parse::<IpAddr>().unwrap()]);
        assert_eq!(engine.nonces.get(&req.nonce), Some(&req.eids[0]));
    }
}
