use std::io;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};

use crate::address::NetAddress;
use crate::error::NetError;
use crate::manager::Shared;
use crate::packet::MAX_DATAGRAM_SIZE;

/// How long one receive call may block before the thread re-checks the stop
/// flag and retries any deferred sends.
const RECV_TIMEOUT: Duration = Duration::from_millis(10);

/// The background I/O thread and its socket. Receiving blocks with a short
/// timeout instead of spinning; a zero-length datagram sent to our own port
/// doubles as the wakeup signal when new outbound traffic is queued.
pub(crate) struct NetSocket {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl NetSocket {
    /// Binds the wildcard address on `port` (0 picks an ephemeral port) and
    /// spawns the I/O thread.
    pub(crate) fn open(port: u16, shared: Arc<Shared>) -> Result<Self, NetError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        socket.set_broadcast(true)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread = {
            let socket = socket.try_clone()?;
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("net-socket".into())
                .spawn(move || run_loop(socket, shared, stop))?
        };

        Ok(Self {
            socket,
            local_addr,
            stop,
            thread: Some(thread),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Interrupts a blocked receive so queued outbound packets get flushed
    /// without waiting out the timeout.
    pub(crate) fn wake(&self) {
        let target = (Ipv4Addr::LOCALHOST, self.local_addr.port());
        if let Err(e) = self.socket.send_to(&[], target) {
            debug!("socket wake failed: {e}");
        }
    }

    /// Signals the thread to stop and joins it.
    pub(crate) fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        self.wake();
        if thread.join().is_err() {
            warn!("socket thread panicked");
        }
    }
}

impl Drop for NetSocket {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Source address our broadcasts leave from, with our port substituted.
/// Connecting a probe socket selects the outbound interface without putting
/// anything on the wire; under a wildcard bind this is the only way to learn
/// which address our own broadcast echo will carry.
pub(crate) fn broadcast_source(port: u16) -> Option<NetAddress> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    probe.set_broadcast(true).ok()?;
    probe.connect((Ipv4Addr::BROADCAST, 9)).ok()?;
    let local = NetAddress::from_socket(probe.local_addr().ok()?)?;
    Some(NetAddress::new(local.host, port))
}

fn run_loop(socket: UdpSocket, shared: Arc<Shared>, stop: Arc<AtomicBool>) {
    // One byte past the datagram limit so an oversized datagram is not
    // silently truncated to a valid length; the length check rejects it.
    let mut buf = [0u8; MAX_DATAGRAM_SIZE + 1];
    let mut send_blocked = false;
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => {
                if let Some(from) = NetAddress::from_socket(from) {
                    shared.handle_datagram(&buf[..len], from);
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            // A previous send to an unreachable port surfaces here on some
            // platforms; the peer is simply gone.
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {}
            Err(e) => {
                warn!("socket receive failed: {e}");
            }
        }

        let was_blocked = send_blocked;
        send_blocked = shared.flush_sends(&socket);
        if send_blocked && !was_blocked {
            debug!("socket send buffer full, deferring flush");
        }
    }
}
