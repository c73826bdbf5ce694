//! Test harness: in-memory backends and fixtures shared by the integration
//! tests.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::os::fd::RawFd;
use std::time::Duration;

use mvirt_lisp::backend::{DatagramBackend, PacketBackend, RecvResult};
use mvirt_lisp::config::TimerConfig;
use mvirt_lisp::eid::{EidPrefix, LocalEidEntry, Locator};
use mvirt_lisp::engine::{EngineSettings, ProtocolEngine};
use mvirt_lisp::store::MappingStore;
use mvirt_lisp::wire::{ControlMessage, MapRegister, MapReply, MapRequest, MappingRecord};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub const LOCAL_EID: &str = "10.0.0.0/24";
pub const LOCAL_RLOC: &str = "192.0.2.1";
pub const RESOLVER: &str = "192.0.2.100";
pub const SERVER_A: &str = "192.0.2.200";
pub const SERVER_B: &str = "192.0.2.201";

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

pub fn prefix(s: &str) -> EidPrefix {
    s.parse().unwrap()
}

/// UDP endpoint that records what is sent and can refuse chosen peers.
#[derive(Default)]
pub struct MockDatagram {
    pub sent: Vec<(Vec<u8>, SocketAddr)>,
    pub failed: Vec<SocketAddr>,
    pub failing: HashSet<IpAddr>,
    pub inbox: VecDeque<(Vec<u8>, SocketAddr)>,
}

impl MockDatagram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to one of `peers` fails with `HostUnreachable`.
    pub fn failing_to(peers: &[&str]) -> Self {
        Self {
            failing: peers.iter().map(|p| ip(p)).collect(),
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Vec<(ControlMessage, SocketAddr)> {
        self.sent
            .iter()
            .map(|(bytes, to)| (ControlMessage::decode(bytes).unwrap(), *to))
            .collect()
    }

    pub fn map_requests(&self) -> Vec<(MapRequest, SocketAddr)> {
        self.messages()
            .into_iter()
            .filter_map(|(m, to)| match m {
                ControlMessage::MapRequest(r) => Some((r, to)),
                _ => None,
            })
            .collect()
    }

    pub fn map_registers(&self) -> Vec<(MapRegister, SocketAddr)> {
        self.messages()
            .into_iter()
            .filter_map(|(m, to)| match m {
                ControlMessage::MapRegister(r) => Some((r, to)),
                _ => None,
            })
            .collect()
    }

    pub fn map_replies(&self) -> Vec<(MapReply, SocketAddr)> {
        self.messages()
            .into_iter()
            .filter_map(|(m, to)| match m {
                ControlMessage::MapReply(r) => Some((r, to)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.sent.clear();
        self.failed.clear();
    }
}

impl DatagramBackend for MockDatagram {
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match self.inbox.pop_front() {
            Some((data, from)) => {
                buf[..data.len()].copy_from_slice(&data);
                Ok(Some((data.len(), from)))
            }
            None => Ok(None),
        }
    }

    fn send_to(&mut self, buf: &[u8], to: SocketAddr) -> io::Result<()> {
        if self.failing.contains(&to.ip()) {
            self.failed.push(to);
            return Err(io::Error::new(
                io::ErrorKind::HostUnreachable,
                "unreachable",
            ));
        }
        self.sent.push((buf.to_vec(), to));
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

/// TUN device stand-in.
#[derive(Default)]
pub struct MockTun {
    pub rx: VecDeque<Vec<u8>>,
    pub written: Vec<Vec<u8>>,
}

impl PacketBackend for MockTun {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvResult> {
        match self.rx.pop_front() {
            Some(p) => {
                buf[..p.len()].copy_from_slice(&p);
                Ok(RecvResult::Packet(p.len()))
            }
            None => Ok(RecvResult::WouldBlock),
        }
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.written.push(packet.to_vec());
        Ok(())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        None
    }
}

pub fn timers() -> TimerConfig {
    TimerConfig {
        tick: Duration::from_millis(100),
        request_timeout: Duration::from_secs(2),
        max_attempts: 3,
        negative_ttl: Duration::from_secs(60),
        register_interval: Duration::from_secs(60),
        expire_interval: Duration::from_secs(1),
        register_ttl_minutes: 1440,
    }
}

pub fn settings(resolvers: &[&str], servers: &[&str]) -> EngineSettings {
    EngineSettings {
        source_rloc: ip(LOCAL_RLOC),
        map_resolvers: resolvers.iter().map(|r| ip(r)).collect(),
        map_servers: servers.iter().map(|s| ip(s)).collect(),
        proxy_reply: false,
        control_port: 4342,
        timers: timers(),
    }
}

pub fn local_db() -> MappingStore {
    MappingStore::new([LocalEidEntry::new(
        prefix(LOCAL_EID),
        vec![Locator::new(ip(LOCAL_RLOC), 1, 100)],
    )])
}

pub fn engine_with(settings: EngineSettings) -> ProtocolEngine {
    ProtocolEngine::with_rng(settings, local_db(), StdRng::seed_from_u64(42))
}

/// Engine with one resolver and one map-server.
pub fn engine() -> ProtocolEngine {
    engine_with(settings(&[RESOLVER], &[SERVER_A]))
}

/// Nonce of the outstanding request for `addr`.
pub fn pending_nonce(engine: &ProtocolEngine, addr: &str) -> u64 {
    engine
        .store()
        .cache_entry(&EidPrefix::host(ip(addr)))
        .and_then(|e| e.pending.as_ref())
        .map(|p| p.nonce)
        .expect("no pending request")
}

pub fn map_reply(nonce: u64, eid: &str, locators: &[(&str, u8, u8)], ttl_minutes: u32) -> Vec<u8> {
    ControlMessage::MapReply(MapReply {
        nonce,
        records: vec![MappingRecord {
            ttl_minutes,
            prefix: prefix(eid),
            action: 0,
            authoritative: true,
            locators: locators
                .iter()
                .map(|(a, p, w)| Locator::new(ip(a), *p, *w))
                .collect(),
        }],
    })
    .encode()
    .unwrap()
}

/// Minimal IPv4/UDP-less packet with the given destination.
pub fn ipv4_packet(dst: &str) -> Vec<u8> {
    let IpAddr::V4(dst) = ip(dst) else {
        panic!("not an IPv4 address");
    };
    let mut p = vec![0u8; 28];
    p[0] = 0x45;
    p[2..4].copy_from_slice(&28u16.to_be_bytes());
    p[8] = 64;
    p[9] = 17;
    p[12..16].copy_from_slice(&[10, 0, 0, 1]);
    p[16..20].copy_from_slice(&dst.octets());
    p[20..28].copy_from_slice(b"payload!");
    p
}
