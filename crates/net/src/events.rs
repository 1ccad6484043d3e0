use crate::address::NetAddress;
use crate::sequence::DenyReason;

/// Connection lifecycle notifications, queued by the transport and drained
/// by the owning thread once per tick via [`poll_event`].
///
/// [`poll_event`]: crate::NetworkMgr::poll_event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetEvent {
    /// A remote peer's connection request was accepted here.
    ConnectionOpened { address: NetAddress },
    /// A local [`connect`] completed; the peer accepted.
    ///
    /// [`connect`]: crate::NetworkMgr::connect
    ConnectionAccepted { address: NetAddress },
    /// The peer disconnected, or a local disconnect finished its retries.
    ConnectionClosed { address: NetAddress },
    /// The peer denied a local connection request.
    ConnectionFailed {
        address: NetAddress,
        reason: DenyReason,
    },
    /// A handshake or reliable exchange exhausted its retry budget.
    ConnectionTimedOut { address: NetAddress },
}

impl NetEvent {
    pub fn address(&self) -> NetAddress {
        match *self {
            NetEvent::ConnectionOpened { address }
            | NetEvent::ConnectionAccepted { address }
            | NetEvent::ConnectionClosed { address }
            | NetEvent::ConnectionFailed { address, .. }
            | NetEvent::ConnectionTimedOut { address } => address,
        }
    }
}
