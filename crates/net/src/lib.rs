//! Connection-oriented transport over UDP.
//!
//! A [`NetworkMgr`] owns one UDP socket and a background I/O thread. Peers
//! exchange a request/accept handshake, after which four send channels are
//! available per connection: reliable in-order, unreliable latest-wins,
//! unordered, and connectionless datagrams that need no connection at all.
//! Every datagram carries a 4-byte packet number whose top 3 bits select the
//! channel and whose low 29 bits sequence it; payloads are obfuscated with a
//! cheap sequence-keyed cipher.
//!
//! The manager is driven from the owner's tick loop: call
//! [`network_task`](NetworkMgr::network_task) once per tick, then drain
//! [`poll_event`](NetworkMgr::poll_event) and
//! [`receive_packet`](NetworkMgr::receive_packet).

mod address;
mod cipher;
mod config;
mod connection;
mod error;
mod events;
mod manager;
mod packet;
mod resolver;
mod sequence;
mod socket;
mod stats;

pub use address::NetAddress;
pub use config::NetConfig;
pub use error::NetError;
pub use events::NetEvent;
pub use manager::{IncomingMessage, NetworkMgr};
pub use packet::{MAX_DATAGRAM_SIZE, MAX_OUTGOING_RELIABLE_COUNT, MAX_PAYLOAD_SIZE};
pub use resolver::AddressResolver;
pub use sequence::{
    Channel, ChannelMask, DenyReason, PacketNumber, SEQUENCE_MASK, sequence_greater_than,
    sequence_less_than,
};
pub use stats::NetworkStats;
