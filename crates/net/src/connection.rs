use std::collections::BTreeMap;

use crate::address::NetAddress;
use crate::packet::{MAX_INCOMING_PACKET_COUNT, MAX_OUTGOING_RELIABLE_COUNT, MAX_UNRELIABLE_COUNT};
use crate::sequence::{
    SEQUENCE_MASK, sequence_distance, sequence_is_behind, sequence_less_than,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Outbound handshake in progress; ConnectRequest retries are running.
    Request,
    /// Teardown initiated; Disconnect retries are running.
    Disconnect,
    /// Normal traffic.
    Open,
    /// Reserved terminal state; normal flows delete the connection instead.
    Closed,
}

/// Verdict on an inbound reliable sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliableAccept {
    /// Within the reorder window; buffer it (and acknowledge).
    InWindow,
    /// Behind the expected counter: already consumed. Acknowledge again so
    /// the peer stops resending, but drop the payload.
    Duplicate,
    /// Too far ahead to buffer; drop without acknowledging.
    OutOfWindow,
}

/// Per-peer session state. The four sequence counters live in the 29-bit
/// circular space and are seeded from a single random value exchanged during
/// the handshake, so counters never collide across sessions.
pub struct Connection {
    pub address: NetAddress,
    pub status: ConnectionStatus,
    /// Smoothed-enough round-trip estimate in ms; -1 until first measured.
    pub rtt: i32,
    /// Seed carried in ConnectAccept; kept for idempotent re-accepts.
    pub initial_sequence: u32,

    /// Next reliable sequence expected from the peer.
    pub incoming_reliable_sequence: u32,
    /// Lowest unreliable sequence still acceptable from the peer.
    pub incoming_unreliable_sequence: u32,
    /// Next reliable sequence to assign locally.
    pub outgoing_reliable_sequence: u32,
    /// Next unreliable/unordered sequence to assign locally.
    pub outgoing_unreliable_sequence: u32,

    /// Timestamp of the last handshake/teardown control send, ms.
    pub control_send_time: u64,
    pub control_resend_count: u32,

    /// Buffered inbound reliable packets (the reorder buffer).
    pub incoming_reliable_count: usize,
    /// Buffered inbound unreliable + unordered packets.
    pub incoming_unreliable_count: usize,
    /// Queued plus unacknowledged outbound reliable packets.
    pub outgoing_reliable_count: usize,
    /// Queued outbound unreliable + unordered packets.
    pub outgoing_unreliable_count: usize,
}

impl Connection {
    pub fn new(address: NetAddress, status: ConnectionStatus, seed: u32, now: u64) -> Self {
        let seed = seed & SEQUENCE_MASK;
        Self {
            address,
            status,
            rtt: -1,
            initial_sequence: seed,
            incoming_reliable_sequence: seed,
            incoming_unreliable_sequence: seed,
            outgoing_reliable_sequence: seed,
            outgoing_unreliable_sequence: seed,
            control_send_time: now,
            control_resend_count: 0,
            incoming_reliable_count: 0,
            incoming_unreliable_count: 0,
            outgoing_reliable_count: 0,
            outgoing_unreliable_count: 0,
        }
    }

    /// Reseeds all four counters from the value carried in ConnectAccept.
    /// Only valid before any data traffic, i.e. on the Request -> Open edge.
    pub fn reseed(&mut self, seed: u32) {
        let seed = seed & SEQUENCE_MASK;
        self.initial_sequence = seed;
        self.incoming_reliable_sequence = seed;
        self.incoming_unreliable_sequence = seed;
        self.outgoing_reliable_sequence = seed;
        self.outgoing_unreliable_sequence = seed;
    }

    pub fn classify_reliable(&self, sequence: u32) -> ReliableAccept {
        let distance = sequence_distance(self.incoming_reliable_sequence, sequence);
        if (distance as usize) < MAX_INCOMING_PACKET_COUNT {
            ReliableAccept::InWindow
        } else if sequence_is_behind(distance) {
            ReliableAccept::Duplicate
        } else {
            ReliableAccept::OutOfWindow
        }
    }

    pub fn accepts_unreliable(&self, sequence: u32) -> bool {
        !sequence_less_than(sequence, self.incoming_unreliable_sequence)
    }

    pub fn can_queue_outgoing_reliable(&self) -> bool {
        self.outgoing_reliable_count < MAX_OUTGOING_RELIABLE_COUNT
    }

    pub fn can_queue_outgoing_unreliable(&self) -> bool {
        self.outgoing_unreliable_count < MAX_UNRELIABLE_COUNT
    }

    pub fn can_buffer_incoming_reliable(&self) -> bool {
        self.incoming_reliable_count < MAX_INCOMING_PACKET_COUNT
    }

    pub fn can_buffer_incoming_unreliable(&self) -> bool {
        self.incoming_unreliable_count < MAX_UNRELIABLE_COUNT
    }

    /// Sends are legal while the handshake is still in flight; queued data
    /// goes out once the connection opens.
    pub fn accepts_sends(&self) -> bool {
        matches!(self.status, ConnectionStatus::Open | ConnectionStatus::Request)
    }
}

/// Address-keyed table of live connections. Ordered by `NetAddress` so
/// iteration during the per-tick scan is deterministic.
pub struct ConnectionTable {
    connections: BTreeMap<NetAddress, Connection>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: BTreeMap::new(),
            max_connections,
        }
    }

    pub fn get(&self, address: NetAddress) -> Option<&Connection> {
        self.connections.get(&address)
    }

    pub fn get_mut(&mut self, address: NetAddress) -> Option<&mut Connection> {
        self.connections.get_mut(&address)
    }

    pub fn contains(&self, address: NetAddress) -> bool {
        self.connections.contains_key(&address)
    }

    pub fn insert(&mut self, connection: Connection) {
        debug_assert!(!self.is_full());
        self.connections.insert(connection.address, connection);
    }

    pub fn remove(&mut self, address: NetAddress) -> Option<Connection> {
        self.connections.remove(&address)
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn addresses(&self) -> Vec<NetAddress> {
        self.connections.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn clear(&mut self) {
        self.connections.clear();
    }
}
