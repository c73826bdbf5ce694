//! Data-plane packet dispatch.
//!
//! TUN -> map-cache lookup -> LISP encapsulation -> data socket, and
//! data socket -> decapsulation -> TUN. Packets that cannot be sent right
//! away are dropped; nothing is queued while a mapping resolves.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use smoltcp::wire::{Ipv4Packet, Ipv6Packet};
use tracing::{debug, trace, warn};

use crate::backend::{DatagramBackend, PacketBackend};
use crate::eid::Locator;
use crate::engine::ProtocolEngine;
use crate::store::{CacheState, LookupResult};
use crate::wire::{self, DATA_HEADER_LEN};

/// Largest inner packet handled.
pub const MAX_PACKET: usize = 9216;

/// Why a packet was not forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Not a parseable IPv4/IPv6 packet or LISP data datagram.
    Malformed,
    /// No mapping; resolution was triggered.
    Miss,
    /// Resolution in progress.
    Unresolved,
    /// Mapping system has no locators for the destination.
    Negative,
    /// Every locator has priority 255.
    NoUsableLocator,
    TooLarge,
    SendFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Encapsulated and sent to this RLOC.
    Encapsulated(SocketAddr),
    /// Decapsulated and written to the TUN device.
    Decapsulated,
    Dropped(DropReason),
}

/// Destination address of a raw IP packet.
pub fn destination(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 => {
            let ipv4 = Ipv4Packet::new_checked(packet).ok()?;
            Some(IpAddr::V4(ipv4.dst_addr()))
        }
        6 => {
            let ipv6 = Ipv6Packet::new_checked(packet).ok()?;
            Some(IpAddr::V6(ipv6.dst_addr()))
        }
        _ => None,
    }
}

/// Pick a locator: lowest priority value wins, ties broken by weight.
///
/// Priority 255 is never chosen. If every candidate has weight 0 the choice
/// among them is uniform.
pub fn select_locator<'a, R: Rng>(
    locators: &'a [Locator],
    rng: &mut R,
) -> Option<&'a Locator> {
    let best = locators
        .iter()
        .filter(|l| l.is_usable())
        .map(|l| l.priority)
        .min()?;
    let candidates: Vec<&Locator> = locators
        .iter()
        .filter(|l| l.is_usable() && l.priority == best)
        .collect();

    let total: u32 = candidates.iter().map(|l| u32::from(l.weight)).sum();
    if total == 0 {
        return Some(candidates[rng.gen_range(0..candidates.len())]);
    }

    let mut pick = rng.gen_range(0..total);
    for locator in &candidates {
        let weight = u32::from(locator.weight);
        if pick < weight {
            return Some(locator);
        }
        pick -= weight;
    }
    candidates.last().copied()
}

pub struct PacketDispatcher {
    data_port: u16,
    rng: StdRng,
}

impl PacketDispatcher {
    pub fn new(data_port: u16) -> Self {
        Self::with_rng(data_port, StdRng::from_entropy())
    }

    pub fn with_rng(data_port: u16, rng: StdRng) -> Self {
        Self { data_port, rng }
    }

    /// Forward one packet read from the TUN device.
    ///
    /// On a miss the engine sends a map-request through `control_tx`.
    pub fn handle_tun_packet(
        &mut self,
        packet: &[u8],
        engine: &mut ProtocolEngine,
        data_tx: &mut impl DatagramBackend,
        control_tx: &mut impl DatagramBackend,
        now: Instant,
    ) -> DispatchOutcome {
        let Some(dst) = destination(packet) else {
            trace!(len = packet.len(), "Dropping non-IP packet from TUN");
            return DispatchOutcome::Dropped(DropReason::Malformed);
        };

        let rloc = match engine.lookup(dst) {
            LookupResult::LocalHit(entry) => {
                select_locator(&entry.locators, &mut self.rng).map(|l| l.address)
            }
            LookupResult::CacheHit(entry) => match entry.state {
                CacheState::Complete => {
                    select_locator(&entry.locators, &mut self.rng).map(|l| l.address)
                }
                CacheState::Incomplete => {
                    trace!(%dst, "Dropping packet, mapping unresolved");
                    return DispatchOutcome::Dropped(DropReason::Unresolved);
                }
                CacheState::Negative => {
                    trace!(%dst, "Dropping packet, negative mapping");
                    return DispatchOutcome::Dropped(DropReason::Negative);
                }
            },
            LookupResult::Miss => {
                engine.on_miss(dst, now, control_tx);
                return DispatchOutcome::Dropped(DropReason::Miss);
            }
        };
        let Some(rloc) = rloc else {
            debug!(%dst, "No usable locator");
            return DispatchOutcome::Dropped(DropReason::NoUsableLocator);
        };

        if packet.len() > MAX_PACKET {
            debug!(%dst, len = packet.len(), "Packet too large to encapsulate");
            return DispatchOutcome::Dropped(DropReason::TooLarge);
        }

        let mut out = [0u8; MAX_PACKET + DATA_HEADER_LEN];
        let nonce = self.rng.next_u32() & 0x00ff_ffff;
        let len = match wire::encapsulate(packet, nonce, &mut out) {
            Ok(len) => len,
            Err(e) => {
                debug!(%dst, error = %e, "Encapsulation failed");
                return DispatchOutcome::Dropped(DropReason::TooLarge);
            }
        };

        let to = SocketAddr::new(rloc, self.data_port);
        match data_tx.send_to(&out[..len], to) {
            Ok(()) => {
                trace!(%dst, %to, "Encapsulated");
                DispatchOutcome::Encapsulated(to)
            }
            Err(e) => {
                warn!(%dst, %to, error = %e, "Failed to send encapsulated packet");
                DispatchOutcome::Dropped(DropReason::SendFailed)
            }
        }
    }

    /// Deliver one LISP data datagram to the TUN device.
    pub fn handle_data_packet(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        tun: &mut impl PacketBackend,
    ) -> DispatchOutcome {
        let inner = match wire::decapsulate(datagram) {
            Ok(inner) => inner,
            Err(e) => {
                debug!(%from, error = %e, "Dropping malformed data packet");
                return DispatchOutcome::Dropped(DropReason::Malformed);
            }
        };

        match tun.send(inner) {
            Ok(()) => {
                trace!(%from, len = inner.len(), "Decapsulated");
                DispatchOutcome::Decapsulated
            }
            Err(e) => {
                warn!(%from, error = %e, "Failed to write to TUN device");
                DispatchOutcome::Dropped(DropReason::SendFailed)
            }
        }
    }
}
