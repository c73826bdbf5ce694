//! End-to-end run of the event loop over loopback sockets.
//!
//! The signal bridge is process-wide, so this file holds a single test.

mod harness;

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use harness::*;
use mvirt_lisp::backend::{PacketBackend, RecvResult, UdpEndpoint};
use mvirt_lisp::dispatch::PacketDispatcher;
use mvirt_lisp::engine::ProtocolEngine;
use mvirt_lisp::event_loop::{EventLoop, LoopExit, PollReactor};
use mvirt_lisp::signal::SignalTimerBridge;
use mvirt_lisp::wire::{self, ControlMessage, DATA_HEADER_LEN};

/// TUN stand-in: one end of a datagram socketpair.
struct SocketTun(UnixDatagram);

impl PacketBackend for SocketTun {
    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<RecvResult> {
        match self.0.recv(buf) {
            Ok(n) => Ok(RecvResult::Packet(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(RecvResult::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn send(&mut self, packet: &[u8]) -> io::Result<()> {
        self.0.send(packet).map(|_| ())
    }

    fn poll_fd(&self) -> Option<RawFd> {
        Some(self.0.as_raw_fd())
    }
}

/// Receive control messages until one matches.
fn recv_control<T>(
    socket: &UdpSocket,
    mut pick: impl FnMut(ControlMessage) -> Option<T>,
) -> (T, SocketAddr) {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 2048];
    while Instant::now() < deadline {
        let Ok((n, from)) = socket.recv_from(&mut buf) else {
            continue;
        };
        if let Ok(message) = ControlMessage::decode(&buf[..n])
            && let Some(value) = pick(message)
        {
            return (value, from);
        }
    }
    panic!("expected control message not received");
}

#[test]
fn test_event_loop_resolves_and_forwards() {
    let _ = tracing_subscriber::fmt::try_init();

    // Plays map-resolver and map-server.
    let mapping_system = UdpSocket::bind("127.0.0.1:0").unwrap();
    mapping_system
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let control_port = mapping_system.local_addr().unwrap().port();

    // Plays the remote ETR receiving encapsulated traffic.
    let remote_etr = UdpSocket::bind("127.0.0.1:0").unwrap();
    remote_etr
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let data_port = remote_etr.local_addr().unwrap().port();

    let (tun_peer, tun_end) = UnixDatagram::pair().unwrap();
    tun_end.set_nonblocking(true).unwrap();
    tun_peer
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let (addr_tx, addr_rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let mut bridge = SignalTimerBridge::new().unwrap();
        bridge.install_handlers().unwrap();
        bridge.start_ticker(Duration::from_millis(20)).unwrap();

        let control = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let data = UdpEndpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        addr_tx
            .send((control.local_addr().unwrap(), data.local_addr().unwrap()))
            .unwrap();

        let mut settings = settings(&["127.0.0.1"], &["127.0.0.1"]);
        settings.control_port = control_port;
        settings.timers.request_timeout = Duration::from_secs(30);
        let engine = ProtocolEngine::new(settings, local_db());

        let mut event_loop = EventLoop::new(
            PollReactor::new(),
            SocketTun(tun_end),
            data,
            control,
            bridge,
            engine,
            PacketDispatcher::new(data_port),
        );
        let exit = event_loop.run();
        (exit.map_err(|e| e.to_string()), event_loop.engine().pending_requests())
    });
    let (control_addr, data_addr) = addr_rx.recv().unwrap();

    // Registration happens at startup.
    let (register, _) = recv_control(&mapping_system, |m| match m {
        ControlMessage::MapRegister(r) => Some(r),
        _ => None,
    });
    assert_eq!(register.records[0].prefix, prefix(LOCAL_EID));

    // Outbound packet to an unknown EID triggers a map-request.
    let packet = ipv4_packet("127.0.0.9");
    tun_peer.send(&packet).unwrap();
    let (request, from) = recv_control(&mapping_system, |m| match m {
        ControlMessage::MapRequest(r) => Some(r),
        _ => None,
    });
    assert_eq!(from, control_addr);
    assert_eq!(request.eids, vec![prefix("127.0.0.9/32")]);

    // Resolve it to a loopback RLOC.
    let reply = map_reply(request.nonce, "127.0.0.0/24", &[("127.0.0.1", 1, 100)], 5);
    mapping_system.send_to(&reply, control_addr).unwrap();

    // Once the reply is processed, packets are encapsulated to the RLOC.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut buf = [0u8; 2048];
    let encapsulated = loop {
        assert!(Instant::now() < deadline, "no encapsulated packet received");
        tun_peer.send(&packet).unwrap();
        if let Ok((n, _)) = remote_etr.recv_from(&mut buf) {
            break buf[..n].to_vec();
        }
    };
    assert_eq!(encapsulated.len(), DATA_HEADER_LEN + packet.len());
    assert_eq!(wire::decapsulate(&encapsulated).unwrap(), packet.as_slice());

    // Inbound LISP data is decapsulated onto the TUN device.
    let inner = ipv4_packet("10.0.0.20");
    let mut datagram = vec![0u8; DATA_HEADER_LEN + inner.len()];
    let len = wire::encapsulate(&inner, 1, &mut datagram).unwrap();
    remote_etr.send_to(&datagram[..len], data_addr).unwrap();

    let mut received = [0u8; 2048];
    let n = tun_peer.recv(&mut received).unwrap();
    assert_eq!(&received[..n], inner.as_slice());

    // SIGTERM ends the loop cleanly.
    assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGTERM) }, 0);
    let (exit, pending) = handle.join().unwrap();
    assert_eq!(exit, Ok(LoopExit::Terminated(libc::SIGTERM)));
    assert_eq!(pending, 0);
}
