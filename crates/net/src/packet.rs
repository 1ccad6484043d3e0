use crate::address::NetAddress;
use crate::sequence::{Channel, PacketNumber};

/// Largest datagram this protocol ever puts on the wire.
pub const MAX_DATAGRAM_SIZE: usize = 512;
/// Big-endian packet number prefixed to every datagram.
pub const HEADER_SIZE: usize = 4;
/// Caller payload limit.
pub const MAX_PAYLOAD_SIZE: usize = MAX_DATAGRAM_SIZE - HEADER_SIZE;

/// Reorder window for inbound reliable packets, per connection. Arrivals at
/// or beyond this distance from the expected sequence are dropped.
pub const MAX_INCOMING_PACKET_COUNT: usize = 32;

/// Per-connection bound on sent-but-unconfirmed plus queued reliable packets.
pub const MAX_OUTGOING_RELIABLE_COUNT: usize = 32;
/// Per-connection bound on queued unreliable/unordered packets, each way.
pub const MAX_UNRELIABLE_COUNT: usize = 16;
/// Global bound on queued connectionless packets, each direction.
pub const MAX_CONNECTIONLESS_COUNT: usize = 32;

/// Pool headroom for acknowledgements and handshake control packets, which
/// are not charged to any per-connection budget.
pub const CONTROL_POOL_HEADROOM: usize = 64;

/// Index of a live slot in a [`PacketPool`]. Only valid against the pool it
/// was drawn from; the pool checks liveness on every access in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHandle(u16);

/// One pooled buffer plus its routing metadata. A packet is owned by exactly
/// one list (free pool, active queue, or pending-acknowledge) at any instant
/// and moves between them by handle, never by copy.
pub struct Packet {
    pub address: NetAddress,
    pub number: PacketNumber,
    pub size: usize,
    pub data: [u8; MAX_PAYLOAD_SIZE],
    /// Timestamp of the last transmission, ms. Outgoing reliable only.
    pub sent_time: u64,
    /// Current resend interval, ms; grows 1.25x per retry.
    pub resend_time: u64,
    pub resend_count: u32,
    in_use: bool,
}

impl Packet {
    fn vacant() -> Self {
        Self {
            address: NetAddress::UNSPECIFIED,
            number: PacketNumber::from_raw(0),
            size: 0,
            data: [0; MAX_PAYLOAD_SIZE],
            sent_time: 0,
            resend_time: 0,
            resend_count: 0,
            in_use: false,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size]
    }

    pub fn channel(&self) -> Option<Channel> {
        self.number.channel()
    }
}

/// Fixed-capacity arena of packet slots. Exhaustion is a first-class
/// outcome: `acquire` returns `None` and the caller decides whether that is
/// `BufferFull` (outbound) or a silent drop (inbound).
pub struct PacketPool {
    slots: Vec<Packet>,
    free: Vec<u16>,
}

impl PacketPool {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity <= u16::MAX as usize);
        let slots = (0..capacity).map(|_| Packet::vacant()).collect();
        // Drawing from the tail keeps recently released slots warm.
        let free = (0..capacity as u16).rev().collect();
        Self { slots, free }
    }

    pub fn acquire(&mut self) -> Option<PacketHandle> {
        let index = self.free.pop()?;
        let slot = &mut self.slots[index as usize];
        slot.address = NetAddress::UNSPECIFIED;
        slot.number = PacketNumber::from_raw(0);
        slot.size = 0;
        slot.sent_time = 0;
        slot.resend_time = 0;
        slot.resend_count = 0;
        slot.in_use = true;
        Some(PacketHandle(index))
    }

    /// Returns a slot to the free list. Releasing a vacant handle is a logic
    /// error; it is ignored in release builds so a stray handle cannot
    /// corrupt the free list with a double entry.
    pub fn release(&mut self, handle: PacketHandle) {
        let slot = &mut self.slots[handle.0 as usize];
        debug_assert!(slot.in_use, "double release of packet handle");
        if slot.in_use {
            slot.in_use = false;
            self.free.push(handle.0);
        }
    }

    pub fn get(&self, handle: PacketHandle) -> &Packet {
        let slot = &self.slots[handle.0 as usize];
        debug_assert!(slot.in_use, "access to released packet handle");
        slot
    }

    pub fn get_mut(&mut self, handle: PacketHandle) -> &mut Packet {
        let slot = &mut self.slots[handle.0 as usize];
        debug_assert!(slot.in_use, "access to released packet handle");
        slot
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}
