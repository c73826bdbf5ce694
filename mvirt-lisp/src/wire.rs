//! LISP control message and data header codec.
//!
//! Covers the subset the daemon speaks: Map-Request, Map-Reply,
//! Map-Register and Map-Notify with IPv4/IPv6 EID records, plus the 8-byte
//! data-plane header. Map-Register is sent with key-id 0 and no
//! authentication data.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::eid::{EidPrefix, Locator};

/// UDP port for LISP control messages.
pub const CONTROL_PORT: u16 = 4342;

/// UDP port for LISP-encapsulated data.
pub const DATA_PORT: u16 = 4341;

/// Size of the LISP data header prepended to encapsulated packets.
pub const DATA_HEADER_LEN: usize = 8;

/// Records (or EIDs) per control message; the count field is one byte.
pub const MAX_RECORDS: usize = u8::MAX as usize;

/// Locators per mapping record.
pub const MAX_LOCATORS: usize = u8::MAX as usize;

/// ITR-RLOCs per map-request; IRC is a 5-bit count minus one.
pub const MAX_ITR_RLOCS: usize = 32;

const TYPE_MAP_REQUEST: u8 = 1;
const TYPE_MAP_REPLY: u8 = 2;
const TYPE_MAP_REGISTER: u8 = 3;
const TYPE_MAP_NOTIFY: u8 = 4;

const AFI_NONE: u16 = 0;
const AFI_IPV4: u16 = 1;
const AFI_IPV6: u16 = 2;

/// Data header flag: nonce present.
const FLAG_N: u8 = 0x80;

/// Locator flag: reachable.
const LOC_FLAG_R: u16 = 0x0001;
/// Locator flag: locator is local to the sender.
const LOC_FLAG_L: u16 = 0x0004;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("Message truncated at offset {0}")]
    Truncated(usize),

    #[error("Unknown message type {0}")]
    UnknownType(u8),

    #[error("Unsupported AFI {0}")]
    UnsupportedAfi(u16),

    #[error("Invalid mask length {0}")]
    InvalidMaskLen(u8),

    #[error("Output buffer too small: need {need}, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Too many records: {0} (max 255)")]
    TooManyRecords(usize),

    #[error("Too many locators in one record: {0} (max 255)")]
    TooManyLocators(usize),

    #[error("ITR-RLOC count {0} not encodable (1 to 32)")]
    InvalidItrRlocCount(usize),
}

pub type Result<T> = std::result::Result<T, WireError>;

/// One EID-to-RLOC mapping as carried in Map-Reply / Map-Register / Map-Notify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRecord {
    /// Record TTL in minutes.
    pub ttl_minutes: u32,
    pub prefix: EidPrefix,
    pub action: u8,
    pub authoritative: bool,
    pub locators: Vec<Locator>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    pub nonce: u64,
    pub source_eid: Option<IpAddr>,
    pub itr_rlocs: Vec<IpAddr>,
    pub eids: Vec<EidPrefix>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapReply {
    pub nonce: u64,
    pub records: Vec<MappingRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRegister {
    pub nonce: u64,
    pub proxy_reply: bool,
    pub want_notify: bool,
    pub key_id: u16,
    pub records: Vec<MappingRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapNotify {
    pub nonce: u64,
    pub key_id: u16,
    pub records: Vec<MappingRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    MapRequest(MapRequest),
    MapReply(MapReply),
    MapRegister(MapRegister),
    MapNotify(MapNotify),
}

impl ControlMessage {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let first = r.peek_u8()?;
        match first >> 4 {
            TYPE_MAP_REQUEST => decode_map_request(&mut r).map(ControlMessage::MapRequest),
            TYPE_MAP_REPLY => decode_map_reply(&mut r).map(ControlMessage::MapReply),
            TYPE_MAP_REGISTER => decode_map_register(&mut r).map(ControlMessage::MapRegister),
            TYPE_MAP_NOTIFY => decode_map_notify(&mut r).map(ControlMessage::MapNotify),
            other => Err(WireError::UnknownType(other)),
        }
    }

    /// Serialize the message.
    ///
    /// Fails instead of truncating when a count does not fit its field.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = Vec::with_capacity(128);
        match self {
            ControlMessage::MapRequest(m) => encode_map_request(&mut w, m)?,
            ControlMessage::MapReply(m) => {
                let count = record_count(&m.records)?;
                w.push(TYPE_MAP_REPLY << 4);
                w.extend_from_slice(&[0, 0]);
                w.push(count);
                w.extend_from_slice(&m.nonce.to_be_bytes());
                encode_records(&mut w, &m.records)?;
            }
            ControlMessage::MapRegister(m) => {
                let count = record_count(&m.records)?;
                w.push(TYPE_MAP_REGISTER << 4 | u8::from(m.proxy_reply) << 3);
                w.push(0);
                w.push(u8::from(m.want_notify));
                w.push(count);
                w.extend_from_slice(&m.nonce.to_be_bytes());
                w.extend_from_slice(&m.key_id.to_be_bytes());
                w.extend_from_slice(&0u16.to_be_bytes());
                encode_records(&mut w, &m.records)?;
            }
            ControlMessage::MapNotify(m) => {
                let count = record_count(&m.records)?;
                w.push(TYPE_MAP_NOTIFY << 4);
                w.extend_from_slice(&[0, 0]);
                w.push(count);
                w.extend_from_slice(&m.nonce.to_be_bytes());
                w.extend_from_slice(&m.key_id.to_be_bytes());
                w.extend_from_slice(&0u16.to_be_bytes());
                encode_records(&mut w, &m.records)?;
            }
        }
        Ok(w)
    }
}

fn record_count<T>(records: &[T]) -> Result<u8> {
    u8::try_from(records.len()).map_err(|_| WireError::TooManyRecords(records.len()))
}

fn encode_map_request(w: &mut Vec<u8>, m: &MapRequest) -> Result<()> {
    let rlocs = m.itr_rlocs.len();
    if !(1..=MAX_ITR_RLOCS).contains(&rlocs) {
        return Err(WireError::InvalidItrRlocCount(rlocs));
    }
    let eid_count = record_count(&m.eids)?;

    // IRC is the number of ITR-RLOCs minus one.
    w.push(TYPE_MAP_REQUEST << 4);
    w.push(0);
    w.push((rlocs - 1) as u8);
    w.push(eid_count);
    w.extend_from_slice(&m.nonce.to_be_bytes());
    match m.source_eid {
        Some(addr) => put_addr(w, addr),
        None => w.extend_from_slice(&AFI_NONE.to_be_bytes()),
    }
    for rloc in &m.itr_rlocs {
        put_addr(w, *rloc);
    }
    for eid in &m.eids {
        w.push(0);
        w.push(eid.prefix_len());
        put_addr(w, eid.addr());
    }
    Ok(())
}

fn encode_records(w: &mut Vec<u8>, records: &[MappingRecord]) -> Result<()> {
    records.iter().try_for_each(|rec| encode_record(w, rec))
}

fn encode_record(w: &mut Vec<u8>, rec: &MappingRecord) -> Result<()> {
    let locator_count = u8::try_from(rec.locators.len())
        .map_err(|_| WireError::TooManyLocators(rec.locators.len()))?;
    w.extend_from_slice(&rec.ttl_minutes.to_be_bytes());
    w.push(locator_count);
    w.push(rec.prefix.prefix_len());
    let act = (rec.action & 0x07) << 5 | u8::from(rec.authoritative) << 4;
    w.extend_from_slice(&[act, 0]);
    w.extend_from_slice(&0u16.to_be_bytes()); // map-version
    put_addr(w, rec.prefix.addr());
    for loc in &rec.locators {
        w.extend_from_slice(&[loc.priority, loc.weight, loc.priority, loc.weight]);
        w.extend_from_slice(&(LOC_FLAG_L | LOC_FLAG_R).to_be_bytes());
        put_addr(w, loc.address);
    }
    Ok(())
}

fn put_addr(w: &mut Vec<u8>, addr: IpAddr) {
    match addr {
        IpAddr::V4(a) => {
            w.extend_from_slice(&AFI_IPV4.to_be_bytes());
            w.extend_from_slice(&a.octets());
        }
        IpAddr::V6(a) => {
            w.extend_from_slice(&AFI_IPV6.to_be_bytes());
            w.extend_from_slice(&a.octets());
        }
    }
}

fn decode_map_request(r: &mut Reader<'_>) -> Result<MapRequest> {
    r.u8()?;
    r.u8()?;
    let irc = (r.u8()? & 0x1f) as usize;
    let record_count = r.u8()? as usize;
    let nonce = r.u64()?;
    let source_eid = r.opt_addr()?;

    let mut itr_rlocs = Vec::with_capacity(irc + 1);
    for _ in 0..=irc {
        itr_rlocs.push(r.addr()?);
    }

    let mut eids = Vec::with_capacity(record_count);
    for _ in 0..record_count {
        r.u8()?;
        let mask_len = r.u8()?;
        let addr = r.addr()?;
        eids.push(EidPrefix::new(addr, mask_len).map_err(|_| WireError::InvalidMaskLen(mask_len))?);
    }

    Ok(MapRequest {
        nonce,
        source_eid,
        itr_rlocs,
        eids,
    })
}

fn decode_map_reply(r: &mut Reader<'_>) -> Result<MapReply> {
    r.skip(3)?;
    let record_count = r.u8()? as usize;
    let nonce = r.u64()?;
    let records = decode_records(r, record_count)?;
    Ok(MapReply { nonce, records })
}

fn decode_map_register(r: &mut Reader<'_>) -> Result<MapRegister> {
    let first = r.u8()?;
    r.u8()?;
    let flags = r.u8()?;
    let record_count = r.u8()? as usize;
    let nonce = r.u64()?;
    let key_id = r.u16()?;
    let auth_len = r.u16()? as usize;
    r.skip(auth_len)?;
    let records = decode_records(r, record_count)?;
    Ok(MapRegister {
        nonce,
        proxy_reply: first & 0x08 != 0,
        want_notify: flags & 0x01 != 0,
        key_id,
        records,
    })
}

fn decode_map_notify(r: &mut Reader<'_>) -> Result<MapNotify> {
    r.skip(3)?;
    let record_count = r.u8()? as usize;
    let nonce = r.u64()?;
    let key_id = r.u16()?;
    let auth_len = r.u16()? as usize;
    r.skip(auth_len)?;
    let records = decode_records(r, record_count)?;
    Ok(MapNotify {
        nonce,
        key_id,
        records,
    })
}

fn decode_records(r: &mut Reader<'_>, count: usize) -> Result<Vec<MappingRecord>> {
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        let ttl_minutes = r.u32()?;
        let locator_count = r.u8()? as usize;
        let mask_len = r.u8()?;
        let act = r.u8()?;
        r.u8()?;
        r.u16()?; // map-version
        let addr = r.addr()?;
        let prefix =
            EidPrefix::new(addr, mask_len).map_err(|_| WireError::InvalidMaskLen(mask_len))?;

        let mut locators = Vec::with_capacity(locator_count);
        for _ in 0..locator_count {
            let priority = r.u8()?;
            let weight = r.u8()?;
            r.skip(2)?; // multicast priority / weight
            let flags = r.u16()?;
            let address = r.addr()?;
            // Unreachable locators are kept but marked unusable.
            let priority = if flags & LOC_FLAG_R == 0 {
                crate::eid::UNUSABLE_PRIORITY
            } else {
                priority
            };
            locators.push(Locator::new(address, priority, weight));
        }

        records.push(MappingRecord {
            ttl_minutes,
            prefix,
            action: act >> 5,
            authoritative: act & 0x10 != 0,
            locators,
        });
    }
    Ok(records)
}

/// Write the LISP data header followed by `inner` into `out`.
///
/// Returns the number of bytes written.
pub fn encapsulate(inner: &[u8], nonce: u32, out: &mut [u8]) -> Result<usize> {
    let need = DATA_HEADER_LEN + inner.len();
    if out.len() < need {
        return Err(WireError::BufferTooSmall {
            need,
            have: out.len(),
        });
    }
    let nonce = nonce.to_be_bytes();
    out[0] = FLAG_N;
    out[1..4].copy_from_slice(&nonce[1..4]);
    out[4..8].fill(0); // locator status bits
    out[DATA_HEADER_LEN..need].copy_from_slice(inner);
    Ok(need)
}

/// Strip the LISP data header, returning the inner packet.
pub fn decapsulate(buf: &[u8]) -> Result<&[u8]> {
    if buf.len() <= DATA_HEADER_LEN {
        return Err(WireError::Truncated(buf.len()));
    }
    Ok(&buf[DATA_HEADER_LEN..])
}

/// Bounds-checked big-endian reader.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(WireError::Truncated(self.pos))?;
        let slice = self.buf.get(self.pos..end).ok_or(WireError::Truncated(self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    fn peek_u8(&self) -> Result<u8> {
        self.buf.get(self.pos).copied().ok_or(WireError::Truncated(self.pos))
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(b))
    }

    fn opt_addr(&mut self) -> Result<Option<IpAddr>> {
        match self.u16()? {
            AFI_NONE => Ok(None),
            afi => self.addr_body(afi).map(Some),
        }
    }

    fn addr(&mut self) -> Result<IpAddr> {
        let afi = self.u16()?;
        self.addr_body(afi)
    }

    fn addr_body(&mut self, afi: u16) -> Result<IpAddr> {
        match afi {
            AFI_IPV4 => {
                let b = self.take(4)?;
                Ok(IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3])))
            }
            AFI_IPV6 => {
                let mut b = [0u8; 16];
                b.copy_from_slice(self.take(16)?);
                Ok(IpAddr::V6(Ipv6Addr::from(b)))
            }
            other => Err(WireError::UnsupportedAfi(other)),
        }
    }
}
