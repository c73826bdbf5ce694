//! TUN device for EID traffic
//!
//! Layer 3 TUN (raw IP packets, no Ethernet header, no packet info). Packets
//! the host routes into the device are destined to remote EIDs; decapsulated
//! packets are written back for local delivery.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use tracing::info;

use crate::backend::{PacketBackend, RecvResult};

/// TUN device flags from linux/if_tun.h
const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq layout shared by TUNSETIFF and SIOC[GS]IFFLAGS
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let bytes = name.as_bytes();
        if bytes.is_empty() || bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Invalid TUN device name: {name:?}"),
            ));
        }
        let mut ifr = Self {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (dst, &b) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = b as libc::c_char;
        }
        Ok(ifr)
    }
}

pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    /// Create (or attach to) the named TUN device in non-blocking mode.
    pub fn create(name: &str) -> io::Result<Self> {
        let ifr = IfReq::new(name, IFF_TUN | IFF_NO_PI)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open("/dev/net/tun")?;

        // SAFETY: ifr is a valid, initialized ifreq for the duration of the call.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        let fd = unsafe { BorrowedFd::borrow_raw(file.as_raw_fd()) };
        let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
        let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
        fcntl(fd, FcntlArg::F_SETFL(new_flags)).map_err(io::Error::from)?;

        info!(device = name, "TUN device created");
        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set IFF_UP on the interface.
    pub fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        info!(device = %self.name, "TUN device up");
        Ok(())
    }
}

impl PacketBackend for TunDevice {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvResult> {
        match self.file.read(buf) {
            Ok(0) => Ok(RecvResult::Done),
            Ok(n) => Ok(RecvResult::Packet(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.file.write_all(packet)
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

/// Closes the ioctl socket on drop
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}
