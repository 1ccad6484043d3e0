//! Packet numbering: a 32-bit value whose top 3 bits select the delivery
//! channel and whose low 29 bits are a circular sequence counter.

/// Mask covering the 29-bit circular sequence space.
pub const SEQUENCE_MASK: u32 = 0x1FFF_FFFF;

/// Sign bit of a 29-bit difference; set means the difference is negative.
const SEQUENCE_SIGN_BIT: u32 = 0x1000_0000;

const CHANNEL_SHIFT: u32 = 29;

/// Delivery channel encoded in the top 3 bits of a packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Channel {
    Control = 0,
    Acknowledge = 1,
    Reliable = 2,
    Unreliable = 3,
    Unordered = 4,
    Connectionless = 5,
}

impl Channel {
    pub const fn tag(self) -> u32 {
        (self as u32) << CHANNEL_SHIFT
    }

    pub fn from_raw(raw: u32) -> Option<Channel> {
        match raw >> CHANNEL_SHIFT {
            0 => Some(Channel::Control),
            1 => Some(Channel::Acknowledge),
            2 => Some(Channel::Reliable),
            3 => Some(Channel::Unreliable),
            4 => Some(Channel::Unordered),
            5 => Some(Channel::Connectionless),
            _ => None,
        }
    }

    pub fn mask(self) -> ChannelMask {
        match self {
            Channel::Reliable => ChannelMask::RELIABLE,
            Channel::Unreliable => ChannelMask::UNRELIABLE,
            Channel::Unordered => ChannelMask::UNORDERED,
            Channel::Connectionless => ChannelMask::CONNECTIONLESS,
            Channel::Control | Channel::Acknowledge => ChannelMask::empty(),
        }
    }
}

bitflags::bitflags! {
    /// Channel selector for queued-packet queries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ChannelMask: u32 {
        const RELIABLE = 1 << 0;
        const UNRELIABLE = 1 << 1;
        const UNORDERED = 1 << 2;
        const CONNECTIONLESS = 1 << 3;
    }
}

/// Opcode carried in the low bits of a Control packet number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlCode {
    Disconnect = 0,
    ConnectRequest = 1,
    ConnectAccept = 2,
    ConnectDeny = 3,
}

impl ControlCode {
    pub fn from_sequence(seq: u32) -> Option<ControlCode> {
        match seq {
            0 => Some(ControlCode::Disconnect),
            1 => Some(ControlCode::ConnectRequest),
            2 => Some(ControlCode::ConnectAccept),
            3 => Some(ControlCode::ConnectDeny),
            _ => None,
        }
    }
}

/// Reason carried in the payload of a ConnectDeny packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DenyReason {
    WrongProtocol = 1,
    NotServer = 2,
    ServerFull = 3,
}

impl DenyReason {
    pub fn from_raw(raw: u32) -> Option<DenyReason> {
        match raw {
            1 => Some(DenyReason::WrongProtocol),
            2 => Some(DenyReason::NotServer),
            3 => Some(DenyReason::ServerFull),
            _ => None,
        }
    }
}

/// True when `s1` precedes `s2` in the 29-bit circular space. Counters may
/// wrap indefinitely; the comparison looks at the sign of the difference.
#[inline]
pub fn sequence_less_than(s1: u32, s2: u32) -> bool {
    s1.wrapping_sub(s2) & SEQUENCE_MASK & SEQUENCE_SIGN_BIT != 0
}

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    sequence_less_than(s2, s1)
}

/// Forward distance from `from` to `to`, modulo 2^29. Values at or above
/// 2^28 mean `to` is actually behind `from`.
#[inline]
pub fn sequence_distance(from: u32, to: u32) -> u32 {
    to.wrapping_sub(from) & SEQUENCE_MASK
}

#[inline]
pub fn sequence_is_behind(distance: u32) -> bool {
    distance & SEQUENCE_SIGN_BIT != 0
}

/// Advances a 29-bit counter by one, wrapping inside the sequence space.
#[inline]
pub fn next_sequence(seq: u32) -> u32 {
    seq.wrapping_add(1) & SEQUENCE_MASK
}

/// A full 32-bit on-the-wire packet number: channel tag plus sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketNumber(u32);

impl PacketNumber {
    pub fn new(channel: Channel, sequence: u32) -> Self {
        Self(channel.tag() | (sequence & SEQUENCE_MASK))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn channel(self) -> Option<Channel> {
        Channel::from_raw(self.0)
    }

    pub const fn sequence(self) -> u32 {
        self.0 & SEQUENCE_MASK
    }
}
