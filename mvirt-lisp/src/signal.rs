//! Signal and timer bridge.
//!
//! Asynchronous signals are turned into readable bytes on a non-blocking
//! self-pipe, so the event loop only ever sees an ordinary fd becoming
//! readable. The handler does nothing but write the signal number; all
//! interpretation happens in `drain()` on the loop thread.
//!
//! The periodic timer is a POSIX interval timer delivering `SIGRTMIN`, which
//! travels through the same pipe as a `TimerTick`.

use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::pipe2;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Write end of the self-pipe; -1 while no bridge exists.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// Signals that end the daemon.
const TERMINATE_SIGNALS: [Signal; 3] = [Signal::SIGTERM, Signal::SIGINT, Signal::SIGQUIT];

/// What a delivered signal means to the event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeEvent {
    /// The interval timer expired at least once since the last drain.
    TimerTick,
    /// Orderly shutdown was requested.
    Terminate(i32),
    /// SIGHUP. Logged; configuration reload is not supported.
    Reload,
    /// A signal the daemon never asked for.
    Unknown(i32),
}

/// Map a raw signal number to a bridge event.
pub fn classify(signo: i32) -> BridgeEvent {
    if signo == libc::SIGRTMIN() {
        return BridgeEvent::TimerTick;
    }
    match Signal::try_from(signo) {
        Ok(sig) if TERMINATE_SIGNALS.contains(&sig) => BridgeEvent::Terminate(signo),
        Ok(Signal::SIGHUP) => BridgeEvent::Reload,
        _ => BridgeEvent::Unknown(signo),
    }
}

extern "C" fn forward_signal(signo: libc::c_int) {
    let fd = WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    let bytes = signo.to_ne_bytes();
    // SAFETY: write(2) is async-signal-safe; errno is restored for the
    // interrupted code.
    unsafe {
        let errno = libc::__errno_location();
        let saved = *errno;
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        *errno = saved;
    }
}

/// Self-pipe fed by signal handlers, plus the optional interval timer.
///
/// Only one bridge can exist per process.
pub struct SignalTimerBridge {
    reader: File,
    _writer: OwnedFd,
    timer: Option<IntervalTimer>,
}

impl SignalTimerBridge {
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

        WRITE_FD
            .compare_exchange(-1, write.as_raw_fd(), Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::BridgeInUse)?;

        Ok(Self {
            reader: File::from(read),
            _writer: write,
            timer: None,
        })
    }

    /// Route the termination signals, SIGHUP and SIGRTMIN into the pipe.
    pub fn install_handlers(&self) -> Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in TERMINATE_SIGNALS.iter().chain([Signal::SIGHUP].iter()) {
            // SAFETY: the handler only touches an atomic and calls write(2).
            unsafe { sigaction(*sig, &action) }?;
        }

        // nix has no variant for real-time signals.
        // SAFETY: the sigaction struct is fully initialized before use.
        unsafe {
            let mut sa: libc::sigaction = mem::zeroed();
            sa.sa_sigaction = forward_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            sa.sa_flags = libc::SA_RESTART;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGRTMIN(), &sa, ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }

        debug!("Signal handlers installed");
        Ok(())
    }

    /// Arm the interval timer. Replaces a running one.
    pub fn start_ticker(&mut self, period: Duration) -> Result<()> {
        self.timer = None;
        self.timer = Some(IntervalTimer::start(libc::SIGRTMIN(), period)?);
        debug!(?period, "Interval timer armed");
        Ok(())
    }

    /// Readable end of the pipe, for registration with the reactor.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Read every pending signal number.
    ///
    /// Several timer expirations collapse into a single `TimerTick`.
    pub fn drain(&mut self) -> Result<Vec<BridgeEvent>> {
        let mut events = Vec::new();
        let mut buf = [0u8; 256];

        loop {
            let n = match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };

            for chunk in buf[..n].chunks_exact(mem::size_of::<i32>()) {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(chunk);
                let event = classify(i32::from_ne_bytes(raw));
                if event == BridgeEvent::TimerTick && events.contains(&BridgeEvent::TimerTick) {
                    continue;
                }
                events.push(event);
            }
        }

        Ok(events)
    }
}

impl Drop for SignalTimerBridge {
    fn drop(&mut self) {
        // Disarm before the pipe closes so a late signal cannot hit a reused fd.
        self.timer = None;
        WRITE_FD.store(-1, Ordering::SeqCst);
    }
}

/// POSIX interval timer on CLOCK_MONOTONIC, deleted on drop.
struct IntervalTimer {
    id: libc::timer_t,
}

impl IntervalTimer {
    fn start(signo: libc::c_int, period: Duration) -> io::Result<Self> {
        if period.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Timer period must be non-zero",
            ));
        }

        // SAFETY: sigevent is plain data; zero is a valid starting state.
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = signo;

        let mut id: libc::timer_t = ptr::null_mut();
        // SAFETY: both pointers are valid for the duration of the call.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut sev, &mut id) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let timer = Self { id };

        let spec = libc::itimerspec {
            it_interval: to_timespec(period),
            it_value: to_timespec(period),
        };
        // SAFETY: `id` was returned by timer_create above.
        if unsafe { libc::timer_settime(timer.id, 0, &spec, ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(timer)
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        // SAFETY: `id` is a live timer owned by this struct.
        if unsafe { libc::timer_delete(self.id) } < 0 {
            warn!(error = %io::Error::last_os_error(), "Failed to delete interval timer");
        }
    }
}

fn to_timespec(d: Duration) -> libc::timespec {
    // SAFETY: timespec is plain data.
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    ts.tv_sec = d.as_secs() as libc::time_t;
    ts.tv_nsec = d.subsec_nanos() as libc::c_long;
    ts
}
