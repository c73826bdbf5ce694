//! EID prefixes and locators.

use ipnet::{IpNet, Ipv4Net, Ipv6Net, PrefixLenError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Locators with this priority must not be used for encapsulation.
pub const UNUSABLE_PRIORITY: u8 = 255;

/// Address family of an EID or RLOC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }
}

/// An EID prefix (IPv4 or IPv6).
///
/// Host bits are cleared on construction, so two prefixes covering the same
/// addresses always compare equal. Used as the key of both the local
/// database and the map-cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EidPrefix {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl EidPrefix {
    /// Create a prefix from an address and a prefix length.
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, PrefixLenError> {
        Ok(match addr {
            IpAddr::V4(a) => EidPrefix::V4(Ipv4Net::new(a, prefix_len)?.trunc()),
            IpAddr::V6(a) => EidPrefix::V6(Ipv6Net::new(a, prefix_len)?.trunc()),
        })
    }

    /// Host prefix (/32 or /128) for a single address.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => EidPrefix::V4(Ipv4Net::from(a)),
            IpAddr::V6(a) => EidPrefix::V6(Ipv6Net::from(a)),
        }
    }

    pub fn family(&self) -> Family {
        match self {
            EidPrefix::V4(_) => Family::V4,
            EidPrefix::V6(_) => Family::V6,
        }
    }

    /// Network address of the prefix.
    pub fn addr(&self) -> IpAddr {
        match self {
            EidPrefix::V4(p) => IpAddr::V4(p.network()),
            EidPrefix::V6(p) => IpAddr::V6(p.network()),
        }
    }

    pub fn prefix_len(&self) -> u8 {
        match self {
            EidPrefix::V4(p) => p.prefix_len(),
            EidPrefix::V6(p) => p.prefix_len(),
        }
    }

    /// Whether `addr` falls inside this prefix. Mixed families never match.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (EidPrefix::V4(p), IpAddr::V4(a)) => p.contains(&a),
            (EidPrefix::V6(p), IpAddr::V6(a)) => p.contains(&a),
            _ => false,
        }
    }
}

impl From<IpNet> for EidPrefix {
    fn from(net: IpNet) -> Self {
        match net {
            IpNet::V4(p) => EidPrefix::V4(p.trunc()),
            IpNet::V6(p) => EidPrefix::V6(p.trunc()),
        }
    }
}

impl From<Ipv4Net> for EidPrefix {
    fn from(net: Ipv4Net) -> Self {
        EidPrefix::V4(net.trunc())
    }
}

impl From<Ipv6Net> for EidPrefix {
    fn from(net: Ipv6Net) -> Self {
        EidPrefix::V6(net.trunc())
    }
}

impl FromStr for EidPrefix {
    type Err = ipnet::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<IpNet>().map(EidPrefix::from)
    }
}

impl fmt::Display for EidPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EidPrefix::V4(p) => write!(f, "{p}"),
            EidPrefix::V6(p) => write!(f, "{p}"),
        }
    }
}

/// A routing locator with its traffic-engineering parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locator {
    pub address: IpAddr,
    /// Lower is preferred; 255 means "do not use".
    pub priority: u8,
    /// Relative share among locators of equal priority.
    pub weight: u8,
}

impl Locator {
    pub fn new(address: IpAddr, priority: u8, weight: u8) -> Self {
        Self {
            address,
            priority,
            weight,
        }
    }

    pub fn is_usable(&self) -> bool {
        self.priority != UNUSABLE_PRIORITY
    }
}

/// A locally owned EID prefix, created from configuration at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEidEntry {
    pub prefix: EidPrefix,
    pub locators: Vec<Locator>,
}

impl LocalEidEntry {
    pub fn new(prefix: EidPrefix, locators: Vec<Locator>) -> Self {
        Self { prefix, locators }
    }
}

/// Unspecified address of the given family.
pub fn unspecified(family: Family) -> IpAddr {
    match family {
        Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
