//! Single-threaded event loop
//!
//! Waits on the TUN device, the data socket, the control socket and the
//! signal bridge, and routes readiness to the dispatcher and the protocol
//! engine. Ready descriptors are always serviced in the same order:
//! TUN, data socket, control socket, bridge.

use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, error, info, trace, warn};

use crate::backend::{DatagramBackend, PacketBackend, RecvResult};
use crate::dispatch::{MAX_PACKET, PacketDispatcher};
use crate::engine::ProtocolEngine;
use crate::error::{Error, Result};
use crate::signal::{BridgeEvent, SignalTimerBridge};
use crate::wire::DATA_HEADER_LEN;

/// Maximum packets to process per descriptor and iteration
const BATCH_LIMIT: usize = 64;

/// Identifies a registered descriptor in a readiness set.
pub type Token = usize;

pub const TOKEN_TUN: Token = 0;
pub const TOKEN_DATA: Token = 1;
pub const TOKEN_CONTROL: Token = 2;
pub const TOKEN_BRIDGE: Token = 3;

/// Readiness multiplexer.
pub trait Reactor {
    /// Watch `fd` for readability and report it as `token`.
    fn register(&mut self, fd: RawFd, token: Token);

    /// Block until at least one descriptor is readable or `timeout` passes.
    ///
    /// Ready tokens are appended to `ready` in registration order. An
    /// interrupted wait is reported as `Errno::EINTR`.
    fn wait(&mut self, timeout: Option<Duration>, ready: &mut Vec<Token>)
    -> std::result::Result<(), Errno>;
}

/// `poll(2)` reactor.
#[derive(Default)]
pub struct PollReactor {
    fds: Vec<(RawFd, Token)>,
}

impl PollReactor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Reactor for PollReactor {
    fn register(&mut self, fd: RawFd, token: Token) {
        self.fds.push((fd, token));
    }

    fn wait(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<Token>,
    ) -> std::result::Result<(), Errno> {
        let mut poll_fds: Vec<PollFd<'_>> = self
            .fds
            .iter()
            .map(|(fd, _)| {
                // SAFETY: registered fds are owned by the event loop's
                // backends, which outlive the reactor.
                PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN)
            })
            .collect();

        let timeout = match timeout {
            Some(t) => PollTimeout::from(u16::try_from(t.as_millis()).unwrap_or(u16::MAX)),
            None => PollTimeout::NONE,
        };
        poll(&mut poll_fds, timeout)?;

        let wake = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
        for (pfd, (_, token)) in poll_fds.iter().zip(&self.fds) {
            if pfd.revents().is_some_and(|r| r.intersects(wake)) {
                ready.push(*token);
            }
        }
        Ok(())
    }
}

/// Why `run()` returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// A termination signal was received.
    Terminated(i32),
}

pub struct EventLoop<R, T, D> {
    reactor: R,
    tun: T,
    data: D,
    control: D,
    bridge: SignalTimerBridge,
    engine: ProtocolEngine,
    dispatcher: PacketDispatcher,
}

impl<R, T, D> EventLoop<R, T, D>
where
    R: Reactor,
    T: PacketBackend,
    D: DatagramBackend,
{
    pub fn new(
        mut reactor: R,
        tun: T,
        data: D,
        control: D,
        bridge: SignalTimerBridge,
        engine: ProtocolEngine,
        dispatcher: PacketDispatcher,
    ) -> Self {
        let fds = [
            (tun.poll_fd(), TOKEN_TUN),
            (data.poll_fd(), TOKEN_DATA),
            (control.poll_fd(), TOKEN_CONTROL),
            (Some(bridge.fd()), TOKEN_BRIDGE),
        ];
        for (fd, token) in fds {
            if let Some(fd) = fd {
                reactor.register(fd, token);
            }
        }

        Self {
            reactor,
            tun,
            data,
            control,
            bridge,
            engine,
            dispatcher,
        }
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Run until a termination signal or a fatal multiplexer failure.
    pub fn run(&mut self) -> Result<LoopExit> {
        self.engine.start(Instant::now(), &mut self.control)?;
        info!("Event loop running");

        let mut ready = Vec::with_capacity(4);
        loop {
            ready.clear();
            match self.reactor.wait(None, &mut ready) {
                Ok(()) => {}
                Err(Errno::EINTR) => {
                    trace!("Wait interrupted");
                    continue;
                }
                Err(e) => {
                    error!(error = %e, "Multiplexer failed");
                    return Err(Error::Reactor(e));
                }
            }

            let now = Instant::now();
            if ready.contains(&TOKEN_TUN) {
                self.drain_tun(now)?;
            }
            if ready.contains(&TOKEN_DATA) {
                self.drain_data();
            }
            if ready.contains(&TOKEN_CONTROL) {
                self.drain_control(now);
            }
            if ready.contains(&TOKEN_BRIDGE)
                && let Some(exit) = self.drain_bridge(now)?
            {
                info!(?exit, "Event loop stopped");
                return Ok(exit);
            }
        }
    }

    /// Fails with `TunClosed` once the device reports end of file.
    fn drain_tun(&mut self, now: Instant) -> Result<()> {
        // One spare byte so oversized packets are seen as such, not truncated.
        let mut buf = [0u8; MAX_PACKET + 1];
        for _ in 0..BATCH_LIMIT {
            match self.tun.try_recv(&mut buf) {
                Ok(RecvResult::Packet(n)) => {
                    self.dispatcher.handle_tun_packet(
                        &buf[..n],
                        &mut self.engine,
                        &mut self.data,
                        &mut self.control,
                        now,
                    );
                }
                Ok(RecvResult::WouldBlock) => break,
                Ok(RecvResult::Done) => {
                    error!("TUN device returned end of file");
                    return Err(Error::TunClosed);
                }
                Err(e) => {
                    warn!(error = %e, "TUN read failed");
                    break;
                }
            }
        }
        Ok(())
    }

    fn drain_data(&mut self) {
        let mut buf = [0u8; MAX_PACKET + DATA_HEADER_LEN];
        for _ in 0..BATCH_LIMIT {
            match self.data.try_recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    self.dispatcher
                        .handle_data_packet(&buf[..n], from, &mut self.tun);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Data socket receive failed");
                    break;
                }
            }
        }
    }

    fn drain_control(&mut self, now: Instant) {
        let mut buf = [0u8; MAX_PACKET];
        for _ in 0..BATCH_LIMIT {
            match self.control.try_recv_from(&mut buf) {
                Ok(Some((n, from))) => {
                    self.engine
                        .handle_control(&buf[..n], from, now, &mut self.control);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Control socket receive failed");
                    break;
                }
            }
        }
    }

    fn drain_bridge(&mut self, now: Instant) -> Result<Option<LoopExit>> {
        for event in self.bridge.drain()? {
            match event {
                BridgeEvent::TimerTick => self.engine.on_timer_tick(now, &mut self.control),
                BridgeEvent::Terminate(signo) => {
                    info!(signal = signo, "Termination signal received");
                    return Ok(Some(LoopExit::Terminated(signo)));
                }
                BridgeEvent::Reload => {
                    info!("SIGHUP received, configuration reload is not supported");
                }
                BridgeEvent::Unknown(signo) => {
                    error!(signal = signo, "Unexpected signal");
                    return Err(Error::UnexpectedSignal(signo));
                }
            }
        }
        debug!(pending = self.engine.pending_requests(), "Bridge drained");
        Ok(None)
    }
}
