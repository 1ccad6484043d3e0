use std::collections::VecDeque;
use std::io;
use std::net::UdpSocket;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, info, warn};

use crate::address::NetAddress;
use crate::cipher;
use crate::config::NetConfig;
use crate::connection::{Connection, ConnectionStatus, ConnectionTable, ReliableAccept};
use crate::error::NetError;
use crate::events::NetEvent;
use crate::packet::{
    CONTROL_POOL_HEADROOM, HEADER_SIZE, MAX_CONNECTIONLESS_COUNT, MAX_DATAGRAM_SIZE,
    MAX_INCOMING_PACKET_COUNT, MAX_OUTGOING_RELIABLE_COUNT, MAX_PAYLOAD_SIZE,
    MAX_UNRELIABLE_COUNT, PacketHandle, PacketPool,
};
use crate::resolver::AddressResolver;
use crate::sequence::{
    Channel, ChannelMask, ControlCode, DenyReason, PacketNumber, SEQUENCE_MASK, next_sequence,
};
use crate::socket::{self, NetSocket};
use crate::stats::{NetworkStats, rand_u32};

/// One application message dequeued by [`NetworkMgr::receive_packet`]. The
/// pooled buffer it came from is already back in its pool.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub from: NetAddress,
    pub channel: Channel,
    pub data: Vec<u8>,
}

/// Inbound lock domain: the incoming arena plus the list of packets waiting
/// for the consumer.
pub(crate) struct Incoming {
    pub(crate) pool: PacketPool,
    pub(crate) active: VecDeque<PacketHandle>,
    pub(crate) connectionless_count: usize,
}

/// Outbound lock domain: the outgoing arena, the queue the socket thread
/// drains, and the pending-acknowledge list of unconfirmed reliable packets.
pub(crate) struct Outgoing {
    pub(crate) pool: PacketPool,
    pub(crate) active: VecDeque<PacketHandle>,
    pub(crate) pending_ack: Vec<PacketHandle>,
    pub(crate) connectionless_count: usize,
    pub(crate) connectionless_sequence: u32,
}

/// State shared between the caller's threads and the socket thread. Three
/// mutexes partition it; the lock order is connections, then incoming, then
/// outgoing, expressed through the `lock_*` helpers so no call site orders
/// guards by hand. The event queue and stats are leaves, never held across
/// another lock acquisition.
pub(crate) struct Shared {
    pub(crate) config: NetConfig,
    epoch: Instant,
    pub(crate) connections: Mutex<ConnectionTable>,
    pub(crate) incoming: Mutex<Incoming>,
    pub(crate) outgoing: Mutex<Outgoing>,
    pub(crate) events: Mutex<VecDeque<NetEvent>>,
    pub(crate) stats: Mutex<NetworkStats>,
    pub(crate) local_address: Mutex<Option<NetAddress>>,
    /// Addresses our own datagrams can appear to come from: the bound
    /// address, loopback at our port, and the broadcast source interface.
    /// Used to suppress broadcast self-echo without rejecting remote peers
    /// that send from the same well-known port.
    pub(crate) self_addresses: Mutex<Vec<NetAddress>>,
}

/// Mutex acquisition that survives a poisoned lock; the protected state is
/// pool bookkeeping that stays coherent per operation.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn new(config: NetConfig) -> Self {
        let outgoing_capacity = config.max_connections
            * (MAX_OUTGOING_RELIABLE_COUNT + MAX_UNRELIABLE_COUNT)
            + MAX_CONNECTIONLESS_COUNT
            + CONTROL_POOL_HEADROOM;
        let incoming_capacity = config.max_connections
            * (MAX_INCOMING_PACKET_COUNT + MAX_UNRELIABLE_COUNT)
            + MAX_CONNECTIONLESS_COUNT;
        let max_connections = config.max_connections;
        Self {
            config,
            epoch: Instant::now(),
            connections: Mutex::new(ConnectionTable::new(max_connections)),
            incoming: Mutex::new(Incoming {
                pool: PacketPool::new(incoming_capacity),
                active: VecDeque::new(),
                connectionless_count: 0,
            }),
            outgoing: Mutex::new(Outgoing {
                pool: PacketPool::new(outgoing_capacity),
                active: VecDeque::new(),
                pending_ack: Vec::new(),
                connectionless_count: 0,
                connectionless_sequence: rand_u32() & SEQUENCE_MASK,
            }),
            events: Mutex::new(VecDeque::new()),
            stats: Mutex::new(NetworkStats::default()),
            local_address: Mutex::new(None),
            self_addresses: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn push_event(&self, event: NetEvent) {
        lock(&self.events).push_back(event);
    }

    fn lock_connections(&self) -> MutexGuard<'_, ConnectionTable> {
        lock(&self.connections)
    }

    fn lock_send(&self) -> (MutexGuard<'_, ConnectionTable>, MutexGuard<'_, Outgoing>) {
        (lock(&self.connections), lock(&self.outgoing))
    }

    fn lock_receive(&self) -> (MutexGuard<'_, ConnectionTable>, MutexGuard<'_, Incoming>) {
        (lock(&self.connections), lock(&self.incoming))
    }

    fn lock_all(
        &self,
    ) -> (
        MutexGuard<'_, ConnectionTable>,
        MutexGuard<'_, Incoming>,
        MutexGuard<'_, Outgoing>,
    ) {
        (
            lock(&self.connections),
            lock(&self.incoming),
            lock(&self.outgoing),
        )
    }

    /// Classifies one raw datagram and routes it to the matching channel
    /// handler. Called from the socket thread for every received datagram;
    /// unit tests call it directly to simulate arbitrary arrival orders.
    pub(crate) fn handle_datagram(&self, data: &[u8], from: NetAddress) {
        if data.len() < HEADER_SIZE {
            // Zero-length datagrams are the wake signal; anything else
            // short of a header is junk.
            if !data.is_empty() {
                lock(&self.stats).bad_packets += 1;
            }
            return;
        }
        if data.len() > MAX_DATAGRAM_SIZE {
            lock(&self.stats).bad_packets += 1;
            return;
        }
        let raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let Some(channel) = Channel::from_raw(raw) else {
            lock(&self.stats).bad_packets += 1;
            return;
        };
        {
            let mut stats = lock(&self.stats);
            stats.packets_received += 1;
            stats.bytes_received += data.len() as u64;
        }
        let sequence = raw & SEQUENCE_MASK;
        let payload = &data[HEADER_SIZE..];
        let now = self.now_ms();
        match channel {
            Channel::Control => self.handle_control(sequence, payload, from, now),
            Channel::Acknowledge => self.handle_acknowledge(sequence, from, now),
            Channel::Reliable => self.handle_reliable(raw, sequence, payload, from),
            Channel::Unreliable | Channel::Unordered => {
                self.handle_sequenced_data(channel, raw, sequence, payload, from)
            }
            Channel::Connectionless => self.handle_connectionless(raw, payload, from),
        }
    }

    fn handle_control(&self, sequence: u32, payload: &[u8], from: NetAddress, now: u64) {
        let Some(code) = ControlCode::from_sequence(sequence) else {
            lock(&self.stats).bad_packets += 1;
            return;
        };
        let param = (payload.len() >= 4)
            .then(|| u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]));

        match code {
            ControlCode::ConnectRequest => {
                let (mut table, mut outgoing) = self.lock_send();
                if param != Some(self.config.protocol_id) {
                    debug!("{from}: connect request with wrong protocol id");
                    enqueue_control(
                        &mut outgoing,
                        from,
                        ControlCode::ConnectDeny,
                        Some(DenyReason::WrongProtocol as u32),
                    );
                    return;
                }
                if let Some(connection) = table.get(from) {
                    // The accept was lost in transit; answer the duplicate
                    // request with the same seed.
                    if connection.status == ConnectionStatus::Open {
                        let seed = connection.initial_sequence;
                        enqueue_control(
                            &mut outgoing,
                            from,
                            ControlCode::ConnectAccept,
                            Some(seed),
                        );
                    }
                    return;
                }
                if table.is_full() {
                    let reason = if self.config.max_connections == 0 {
                        DenyReason::NotServer
                    } else {
                        DenyReason::ServerFull
                    };
                    debug!("{from}: connect request denied, {reason:?}");
                    enqueue_control(
                        &mut outgoing,
                        from,
                        ControlCode::ConnectDeny,
                        Some(reason as u32),
                    );
                    return;
                }
                let seed = rand_u32() & SEQUENCE_MASK;
                table.insert(Connection::new(from, ConnectionStatus::Open, seed, now));
                enqueue_control(&mut outgoing, from, ControlCode::ConnectAccept, Some(seed));
                info!("connection opened from {from}");
                self.push_event(NetEvent::ConnectionOpened { address: from });
            }
            ControlCode::ConnectAccept => {
                let mut table = self.lock_connections();
                let Some(connection) = table.get_mut(from) else {
                    return;
                };
                if connection.status != ConnectionStatus::Request {
                    return;
                }
                let Some(seed) = param else {
                    return;
                };
                connection.reseed(seed);
                connection.status = ConnectionStatus::Open;
                connection.rtt =
                    now.saturating_sub(connection.control_send_time).min(i32::MAX as u64) as i32;
                connection.control_resend_count = 0;
                info!("connection to {from} accepted");
                self.push_event(NetEvent::ConnectionAccepted { address: from });
            }
            ControlCode::ConnectDeny => {
                let (mut table, mut incoming, mut outgoing) = self.lock_all();
                let Some(connection) = table.get(from) else {
                    return;
                };
                if connection.status != ConnectionStatus::Request {
                    return;
                }
                let reason = param
                    .and_then(DenyReason::from_raw)
                    .unwrap_or(DenyReason::NotServer);
                warn!("connection to {from} denied: {reason:?}");
                self.teardown(
                    &mut table,
                    &mut incoming,
                    &mut outgoing,
                    from,
                    NetEvent::ConnectionFailed {
                        address: from,
                        reason,
                    },
                );
            }
            ControlCode::Disconnect => {
                let (mut table, mut incoming, mut outgoing) = self.lock_all();
                if table.contains(from) {
                    info!("{from} disconnected");
                    self.teardown(
                        &mut table,
                        &mut incoming,
                        &mut outgoing,
                        from,
                        NetEvent::ConnectionClosed { address: from },
                    );
                }
            }
        }
    }

    fn handle_acknowledge(&self, sequence: u32, from: NetAddress, now: u64) {
        let (mut table, mut outgoing) = self.lock_send();
        let Some(index) = outgoing.pending_ack.iter().position(|&handle| {
            let packet = outgoing.pool.get(handle);
            packet.address == from && packet.number.sequence() == sequence
        }) else {
            return;
        };
        let handle = outgoing.pending_ack.remove(index);
        let sent_time = outgoing.pool.get(handle).sent_time;
        outgoing.pool.release(handle);
        if let Some(connection) = table.get_mut(from) {
            connection.rtt = now.saturating_sub(sent_time).min(i32::MAX as u64) as i32;
            connection.outgoing_reliable_count =
                connection.outgoing_reliable_count.saturating_sub(1);
        }
    }

    fn handle_reliable(&self, raw: u32, sequence: u32, payload: &[u8], from: NetAddress) {
        let (mut table, mut incoming, mut outgoing) = self.lock_all();
        let Some(connection) = table.get_mut(from) else {
            return;
        };
        match connection.classify_reliable(sequence) {
            ReliableAccept::OutOfWindow => {}
            ReliableAccept::Duplicate => {
                // Already consumed; re-acknowledge so the peer stops
                // resending.
                enqueue_ack(&mut outgoing, from, sequence);
            }
            ReliableAccept::InWindow => {
                // Acknowledge before any buffering decision: the resend must
                // stop even if the reorder buffer cannot hold the payload
                // right now.
                enqueue_ack(&mut outgoing, from, sequence);
                let duplicate = incoming.active.iter().any(|&handle| {
                    let packet = incoming.pool.get(handle);
                    packet.address == from
                        && packet.number.sequence() == sequence
                        && packet.number.channel() == Some(Channel::Reliable)
                });
                if duplicate || !connection.can_buffer_incoming_reliable() {
                    return;
                }
                let Some(handle) = incoming.pool.acquire() else {
                    return;
                };
                fill_incoming(&mut incoming.pool, handle, from, raw, payload);
                incoming.active.push_back(handle);
                connection.incoming_reliable_count += 1;
            }
        }
    }

    fn handle_sequenced_data(
        &self,
        channel: Channel,
        raw: u32,
        sequence: u32,
        payload: &[u8],
        from: NetAddress,
    ) {
        let (mut table, mut incoming) = self.lock_receive();
        let Some(connection) = table.get_mut(from) else {
            return;
        };
        if channel == Channel::Unreliable && !connection.accepts_unreliable(sequence) {
            return;
        }
        if !connection.can_buffer_incoming_unreliable() {
            return;
        }
        let Some(handle) = incoming.pool.acquire() else {
            return;
        };
        fill_incoming(&mut incoming.pool, handle, from, raw, payload);
        incoming.active.push_back(handle);
        connection.incoming_unreliable_count += 1;
    }

    fn handle_connectionless(&self, raw: u32, payload: &[u8], from: NetAddress) {
        // Drop our own broadcast echo: the source must match one of our own
        // addresses exactly. A remote peer sending from the same well-known
        // port is legitimate discovery traffic.
        if *lock(&self.local_address) == Some(from)
            || lock(&self.self_addresses).contains(&from)
        {
            return;
        }
        let mut incoming = lock(&self.incoming);
        if incoming.connectionless_count >= MAX_CONNECTIONLESS_COUNT {
            return;
        }
        let Some(handle) = incoming.pool.acquire() else {
            return;
        };
        fill_incoming(&mut incoming.pool, handle, from, raw, payload);
        incoming.active.push_back(handle);
        incoming.connectionless_count += 1;
    }

    /// Sends everything queued on the active-outgoing list. Returns true if
    /// the socket refused a datagram with a would-block condition, in which
    /// case the remaining packets stay queued for the next pass.
    pub(crate) fn flush_sends(&self, socket: &UdpSocket) -> bool {
        let now = self.now_ms();
        let (mut table, mut outgoing) = self.lock_send();
        while let Some(&handle) = outgoing.active.front() {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            let (len, dest, channel) = {
                let packet = outgoing.pool.get(handle);
                buf[..HEADER_SIZE].copy_from_slice(&packet.number.raw().to_be_bytes());
                buf[HEADER_SIZE..HEADER_SIZE + packet.size].copy_from_slice(packet.payload());
                (HEADER_SIZE + packet.size, packet.address, packet.channel())
            };
            match socket.send_to(&buf[..len], dest.to_socket_addr()) {
                Ok(sent) => {
                    let mut stats = lock(&self.stats);
                    stats.packets_sent += 1;
                    stats.bytes_sent += sent as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) => {
                    // A hard send error costs this transmission only;
                    // reliable packets still enter the pending list and the
                    // resend machinery retries them.
                    warn!("send to {dest} failed: {e}");
                }
            }
            outgoing.active.pop_front();
            match channel {
                Some(Channel::Reliable) => {
                    outgoing.pool.get_mut(handle).sent_time = now;
                    outgoing.pending_ack.push(handle);
                }
                Some(Channel::Unreliable) | Some(Channel::Unordered) => {
                    if let Some(connection) = table.get_mut(dest) {
                        connection.outgoing_unreliable_count =
                            connection.outgoing_unreliable_count.saturating_sub(1);
                    }
                    outgoing.pool.release(handle);
                }
                Some(Channel::Connectionless) => {
                    outgoing.connectionless_count = outgoing.connectionless_count.saturating_sub(1);
                    outgoing.pool.release(handle);
                }
                // Control packets and acknowledgements are fire-and-forget;
                // their retries are driven by the per-tick task, not by the
                // packet itself.
                _ => outgoing.pool.release(handle),
            }
        }
        false
    }

    /// The per-tick driver: handshake/teardown control retries and reliable
    /// retransmission. Must be invoked from one consistent thread; it is not
    /// designed for concurrent re-entry with itself.
    pub(crate) fn run_task(&self, now: u64) {
        let (mut table, mut incoming, mut outgoing) = self.lock_all();

        // Handshake and teardown retries.
        enum Action {
            Retry(ControlCode, Option<u32>),
            Expire(NetEvent),
        }
        for address in table.addresses() {
            let action = {
                let Some(connection) = table.get_mut(address) else {
                    continue;
                };
                let (code, param) = match connection.status {
                    ConnectionStatus::Request => {
                        (ControlCode::ConnectRequest, Some(self.config.protocol_id))
                    }
                    ConnectionStatus::Disconnect => (ControlCode::Disconnect, None),
                    _ => continue,
                };
                let due = connection.control_resend_count == 0
                    || now.saturating_sub(connection.control_send_time)
                        >= self.config.reliable_resend_time;
                if !due {
                    continue;
                }
                if connection.control_resend_count >= self.config.reliable_resend_count {
                    let event = match connection.status {
                        ConnectionStatus::Request => {
                            NetEvent::ConnectionTimedOut { address }
                        }
                        _ => NetEvent::ConnectionClosed { address },
                    };
                    Action::Expire(event)
                } else {
                    connection.control_send_time = now;
                    connection.control_resend_count += 1;
                    Action::Retry(code, param)
                }
            };
            match action {
                Action::Retry(code, param) => {
                    enqueue_control(&mut outgoing, address, code, param);
                }
                Action::Expire(event) => {
                    warn!("{address}: control retries exhausted");
                    self.teardown(&mut table, &mut incoming, &mut outgoing, address, event);
                }
            }
        }

        // Reliable retransmission with exponential-ish backoff.
        let mut expired: Vec<NetAddress> = Vec::new();
        let mut index = 0;
        while index < outgoing.pending_ack.len() {
            let handle = outgoing.pending_ack[index];
            let (due, exhausted, address) = {
                let packet = outgoing.pool.get(handle);
                (
                    now.saturating_sub(packet.sent_time) >= packet.resend_time,
                    packet.resend_count + 1 >= self.config.reliable_resend_count,
                    packet.address,
                )
            };
            if !due {
                index += 1;
                continue;
            }
            if exhausted {
                if !expired.contains(&address) {
                    expired.push(address);
                }
                index += 1;
                continue;
            }
            outgoing.pending_ack.remove(index);
            {
                let packet = outgoing.pool.get_mut(handle);
                packet.resend_count += 1;
                packet.resend_time += packet.resend_time >> 2;
            }
            lock(&self.stats).packets_resent += 1;
            outgoing.active.push_back(handle);
        }
        for address in expired {
            warn!("{address}: reliable delivery gave up after retries");
            self.teardown(
                &mut table,
                &mut incoming,
                &mut outgoing,
                address,
                NetEvent::ConnectionTimedOut { address },
            );
        }
    }

    /// Removes the connection and every packet addressed to it from all
    /// shared lists, then reports the reason through the event queue.
    fn teardown(
        &self,
        table: &mut ConnectionTable,
        incoming: &mut Incoming,
        outgoing: &mut Outgoing,
        address: NetAddress,
        event: NetEvent,
    ) {
        flush_address(incoming, outgoing, address);
        table.remove(address);
        self.push_event(event);
    }
}

/// Copies an inbound payload into a pooled slot and undoes the obfuscation.
fn fill_incoming(
    pool: &mut PacketPool,
    handle: PacketHandle,
    from: NetAddress,
    raw: u32,
    payload: &[u8],
) {
    let packet = pool.get_mut(handle);
    packet.address = from;
    packet.number = PacketNumber::from_raw(raw);
    packet.size = payload.len();
    packet.data[..payload.len()].copy_from_slice(payload);
    cipher::decrypt_in_place(&mut packet.data[..payload.len()], raw);
}

fn enqueue_control(outgoing: &mut Outgoing, to: NetAddress, code: ControlCode, param: Option<u32>) {
    let Some(handle) = outgoing.pool.acquire() else {
        debug!("outgoing pool exhausted; {code:?} to {to} dropped");
        return;
    };
    let packet = outgoing.pool.get_mut(handle);
    packet.address = to;
    packet.number = PacketNumber::new(Channel::Control, code as u32);
    if let Some(value) = param {
        packet.data[..4].copy_from_slice(&value.to_be_bytes());
        packet.size = 4;
    }
    outgoing.active.push_back(handle);
}

fn enqueue_ack(outgoing: &mut Outgoing, to: NetAddress, sequence: u32) {
    let Some(handle) = outgoing.pool.acquire() else {
        debug!("outgoing pool exhausted; acknowledge to {to} dropped");
        return;
    };
    let packet = outgoing.pool.get_mut(handle);
    packet.address = to;
    packet.number = PacketNumber::new(Channel::Acknowledge, sequence);
    outgoing.active.push_back(handle);
}

fn flush_address(incoming: &mut Incoming, outgoing: &mut Outgoing, address: NetAddress) {
    let mut index = 0;
    while index < incoming.active.len() {
        let handle = incoming.active[index];
        if incoming.pool.get(handle).address == address {
            if incoming.pool.get(handle).channel() == Some(Channel::Connectionless) {
                incoming.connectionless_count = incoming.connectionless_count.saturating_sub(1);
            }
            incoming.active.remove(index);
            incoming.pool.release(handle);
        } else {
            index += 1;
        }
    }
    let mut index = 0;
    while index < outgoing.active.len() {
        let handle = outgoing.active[index];
        if outgoing.pool.get(handle).address == address {
            if outgoing.pool.get(handle).channel() == Some(Channel::Connectionless) {
                outgoing.connectionless_count = outgoing.connectionless_count.saturating_sub(1);
            }
            outgoing.active.remove(index);
            outgoing.pool.release(handle);
        } else {
            index += 1;
        }
    }
    let mut index = 0;
    while index < outgoing.pending_ack.len() {
        let handle = outgoing.pending_ack[index];
        if outgoing.pool.get(handle).address == address {
            outgoing.pending_ack.remove(index);
            outgoing.pool.release(handle);
        } else {
            index += 1;
        }
    }
}

/// The transport manager. One instance owns the socket, the connection
/// table, and every packet pool; there is no global state. Construct it,
/// call [`initialize`](Self::initialize), and drive it with
/// [`network_task`](Self::network_task) once per simulation tick.
pub struct NetworkMgr {
    pub(crate) shared: Arc<Shared>,
    socket: Option<NetSocket>,
}

impl NetworkMgr {
    pub fn new(config: NetConfig) -> Self {
        Self {
            shared: Arc::new(Shared::new(config)),
            socket: None,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.shared.config
    }

    /// Binds the UDP socket and starts the background I/O thread.
    /// Idempotent; a second call on an open manager does nothing.
    pub fn initialize(&mut self) -> Result<(), NetError> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = NetSocket::open(self.shared.config.local_port, Arc::clone(&self.shared))?;
        let local = NetAddress::from_socket(socket.local_addr());
        *lock(&self.shared.local_address) = local;
        if let Some(local) = local {
            let mut selves = vec![local, NetAddress::new(0x7F00_0001, local.port)];
            if let Some(iface) = socket::broadcast_source(local.port) {
                selves.push(iface);
            }
            *lock(&self.shared.self_addresses) = selves;
        }
        info!("network initialized on {}", socket.local_addr());
        self.socket = Some(socket);
        Ok(())
    }

    /// Stops the I/O thread, joins it, and drops all connections and queued
    /// packets. The manager can be initialized again afterwards.
    pub fn terminate(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
        let (mut table, mut incoming, mut outgoing) = self.shared.lock_all();
        table.clear();
        while let Some(handle) = incoming.active.pop_front() {
            incoming.pool.release(handle);
        }
        incoming.connectionless_count = 0;
        while let Some(handle) = outgoing.active.pop_front() {
            outgoing.pool.release(handle);
        }
        for handle in std::mem::take(&mut outgoing.pending_ack) {
            outgoing.pool.release(handle);
        }
        outgoing.connectionless_count = 0;
        lock(&self.shared.events).clear();
        *lock(&self.shared.local_address) = None;
        lock(&self.shared.self_addresses).clear();
        info!("network terminated");
    }

    /// Local socket address, available between `initialize` and `terminate`.
    pub fn local_address(&self) -> Option<NetAddress> {
        *lock(&self.shared.local_address)
    }

    /// Starts an outbound handshake. The first ConnectRequest goes out on
    /// the next `network_task` tick and retries until the peer answers or
    /// the retry budget runs out, which fires a timeout event.
    pub fn connect(&self, address: NetAddress) -> Result<(), NetError> {
        let mut table = self.shared.lock_connections();
        if table.contains(address) {
            return Ok(());
        }
        if table.is_full() {
            return Err(NetError::BufferFull);
        }
        let now = self.shared.now_ms();
        table.insert(Connection::new(
            address,
            ConnectionStatus::Request,
            rand_u32(),
            now,
        ));
        info!("connecting to {address}");
        Ok(())
    }

    /// Starts teardown. Disconnect control packets retry like a handshake;
    /// the connection is deleted when the peer confirms nothing (there is no
    /// ack for Disconnect) and the retry budget is spent.
    pub fn disconnect(&self, address: NetAddress) -> Result<(), NetError> {
        let mut table = self.shared.lock_connections();
        let Some(connection) = table.get_mut(address) else {
            return Err(NetError::NoConnection);
        };
        connection.status = ConnectionStatus::Disconnect;
        connection.control_send_time = self.shared.now_ms();
        connection.control_resend_count = 0;
        info!("disconnecting from {address}");
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.shared.lock_connections().len()
    }

    /// Round-trip estimate for a peer in ms; -1 until first measured.
    pub fn ping(&self, address: NetAddress) -> Result<i32, NetError> {
        self.shared
            .lock_connections()
            .get(address)
            .map(|connection| connection.rtt)
            .ok_or(NetError::NoConnection)
    }

    /// Number of inbound packets queued for `address` on the channels
    /// selected by `mask`.
    pub fn packet_count(&self, address: NetAddress, mask: ChannelMask) -> usize {
        let incoming = lock(&self.shared.incoming);
        incoming
            .active
            .iter()
            .filter(|&&handle| {
                let packet = incoming.pool.get(handle);
                packet.address == address
                    && packet
                        .channel()
                        .is_some_and(|channel| mask.intersects(channel.mask()))
            })
            .count()
    }

    pub fn stats(&self) -> NetworkStats {
        *lock(&self.shared.stats)
    }

    pub fn send_reliable_packet(&self, to: NetAddress, data: &[u8]) -> Result<(), NetError> {
        self.send_data(Channel::Reliable, to, data)
    }

    pub fn send_unreliable_packet(&self, to: NetAddress, data: &[u8]) -> Result<(), NetError> {
        self.send_data(Channel::Unreliable, to, data)
    }

    pub fn send_unordered_packet(&self, to: NetAddress, data: &[u8]) -> Result<(), NetError> {
        self.send_data(Channel::Unordered, to, data)
    }

    fn send_data(&self, channel: Channel, to: NetAddress, data: &[u8]) -> Result<(), NetError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(NetError::PacketTooLarge);
        }
        {
            let (mut table, mut outgoing) = self.shared.lock_send();
            let Some(connection) = table.get_mut(to) else {
                return Err(NetError::NoConnection);
            };
            if !connection.accepts_sends() {
                return Err(NetError::NoConnection);
            }
            let has_room = match channel {
                Channel::Reliable => connection.can_queue_outgoing_reliable(),
                _ => connection.can_queue_outgoing_unreliable(),
            };
            if !has_room {
                return Err(NetError::BufferFull);
            }
            let Some(handle) = outgoing.pool.acquire() else {
                return Err(NetError::BufferFull);
            };
            let sequence = match channel {
                Channel::Reliable => {
                    let sequence = connection.outgoing_reliable_sequence;
                    connection.outgoing_reliable_sequence = next_sequence(sequence);
                    connection.outgoing_reliable_count += 1;
                    sequence
                }
                _ => {
                    let sequence = connection.outgoing_unreliable_sequence;
                    connection.outgoing_unreliable_sequence = next_sequence(sequence);
                    connection.outgoing_unreliable_count += 1;
                    sequence
                }
            };
            let number = PacketNumber::new(channel, sequence);
            let packet = outgoing.pool.get_mut(handle);
            packet.address = to;
            packet.number = number;
            packet.size = data.len();
            packet.data[..data.len()].copy_from_slice(data);
            cipher::encrypt_in_place(&mut packet.data[..data.len()], number.raw());
            if channel == Channel::Reliable {
                packet.resend_time = self.shared.config.reliable_resend_time;
                packet.resend_count = 0;
            }
            outgoing.active.push_back(handle);
        }
        self.wake();
        Ok(())
    }

    /// Sends to an arbitrary address with no connection, no ordering, and no
    /// delivery guarantee. Used for discovery query/reply exchanges.
    pub fn send_connectionless_packet(
        &self,
        to: NetAddress,
        data: &[u8],
    ) -> Result<(), NetError> {
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(NetError::PacketTooLarge);
        }
        {
            let mut outgoing = lock(&self.shared.outgoing);
            if outgoing.connectionless_count >= MAX_CONNECTIONLESS_COUNT {
                return Err(NetError::BufferFull);
            }
            let Some(handle) = outgoing.pool.acquire() else {
                return Err(NetError::BufferFull);
            };
            let sequence = outgoing.connectionless_sequence;
            outgoing.connectionless_sequence = next_sequence(sequence);
            let number = PacketNumber::new(Channel::Connectionless, sequence);
            let packet = outgoing.pool.get_mut(handle);
            packet.address = to;
            packet.number = number;
            packet.size = data.len();
            packet.data[..data.len()].copy_from_slice(data);
            cipher::encrypt_in_place(&mut packet.data[..data.len()], number.raw());
            outgoing.active.push_back(handle);
            outgoing.connectionless_count += 1;
        }
        self.wake();
        Ok(())
    }

    /// Connectionless send to the subnet broadcast address on the configured
    /// broadcast port.
    pub fn broadcast_packet(&self, data: &[u8]) -> Result<(), NetError> {
        self.send_connectionless_packet(
            NetAddress::broadcast(self.shared.config.broadcast_port),
            data,
        )
    }

    /// Non-blocking poll for the next deliverable message, honoring each
    /// channel's ordering rules: reliable delivery blocks on gaps, stale
    /// unreliable packets are discarded, unordered and connectionless
    /// packets come out in arrival order.
    pub fn receive_packet(&self) -> Result<IncomingMessage, NetError> {
        let (mut table, mut incoming) = self.shared.lock_receive();
        let mut index = 0;
        while index < incoming.active.len() {
            let handle = incoming.active[index];
            let (address, number) = {
                let packet = incoming.pool.get(handle);
                (packet.address, packet.number)
            };
            let Some(channel) = number.channel() else {
                incoming.active.remove(index);
                incoming.pool.release(handle);
                continue;
            };
            match channel {
                Channel::Reliable => match table.get_mut(address) {
                    Some(connection)
                        if number.sequence() == connection.incoming_reliable_sequence =>
                    {
                        connection.incoming_reliable_sequence =
                            next_sequence(connection.incoming_reliable_sequence);
                        connection.incoming_reliable_count =
                            connection.incoming_reliable_count.saturating_sub(1);
                        return Ok(take_message(&mut incoming, index, handle, channel));
                    }
                    // Out of order: leave it buffered until the gap fills.
                    Some(_) => index += 1,
                    None => {
                        incoming.active.remove(index);
                        incoming.pool.release(handle);
                    }
                },
                Channel::Unreliable => match table.get_mut(address) {
                    Some(connection) => {
                        connection.incoming_unreliable_count =
                            connection.incoming_unreliable_count.saturating_sub(1);
                        if connection.accepts_unreliable(number.sequence()) {
                            connection.incoming_unreliable_sequence =
                                next_sequence(number.sequence());
                            return Ok(take_message(&mut incoming, index, handle, channel));
                        }
                        // Superseded by a later packet consumed first.
                        incoming.active.remove(index);
                        incoming.pool.release(handle);
                    }
                    None => {
                        incoming.active.remove(index);
                        incoming.pool.release(handle);
                    }
                },
                Channel::Unordered => {
                    if let Some(connection) = table.get_mut(address) {
                        connection.incoming_unreliable_count =
                            connection.incoming_unreliable_count.saturating_sub(1);
                    }
                    return Ok(take_message(&mut incoming, index, handle, channel));
                }
                Channel::Connectionless => {
                    incoming.connectionless_count =
                        incoming.connectionless_count.saturating_sub(1);
                    return Ok(take_message(&mut incoming, index, handle, channel));
                }
                Channel::Control | Channel::Acknowledge => {
                    // Never queued for the consumer.
                    incoming.active.remove(index);
                    incoming.pool.release(handle);
                }
            }
        }
        Err(NetError::NoPacket)
    }

    /// Drains one queued connection event, if any. Intended to be called in
    /// a loop once per tick by the thread that owns the manager.
    pub fn poll_event(&self) -> Option<NetEvent> {
        lock(&self.shared.events).pop_front()
    }

    /// The per-tick driver: runs handshake/teardown retries and reliable
    /// retransmission, then nudges the socket thread. Call once per
    /// simulation tick from a single, consistent thread.
    pub fn network_task(&self) {
        self.shared.run_task(self.shared.now_ms());
        self.wake();
    }

    /// Starts an asynchronous hostname lookup. Poll the returned handle for
    /// completion; dropping it abandons the result.
    pub fn resolve_address(&self, host: &str) -> AddressResolver {
        AddressResolver::spawn(host.to_string())
    }

    fn wake(&self) {
        if let Some(socket) = &self.socket {
            socket.wake();
        }
    }
}

impl Drop for NetworkMgr {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn take_message(
    incoming: &mut Incoming,
    index: usize,
    handle: PacketHandle,
    channel: Channel,
) -> IncomingMessage {
    let (from, data) = {
        let packet = incoming.pool.get(handle);
        (packet.address, packet.payload().to_vec())
    };
    incoming.active.remove(index);
    incoming.pool.release(handle);
    IncomingMessage {
        from,
        channel,
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> NetConfig {
        NetConfig {
            protocol_id: 0xC0DE,
            max_connections: 8,
            reliable_resend_time: 0,
            reliable_resend_count: 3,
            ..NetConfig::default()
        }
    }

    fn addr(port: u16) -> NetAddress {
        NetAddress::new(0x7F00_0001, port)
    }

    fn open_connection(mgr: &NetworkMgr, address: NetAddress, seed: u32) {
        mgr.shared
            .lock_connections()
            .insert(Connection::new(address, ConnectionStatus::Open, seed, 0));
    }

    fn data_datagram(channel: Channel, sequence: u32, payload: &[u8]) -> Vec<u8> {
        let number = PacketNumber::new(channel, sequence);
        let mut out = number.raw().to_be_bytes().to_vec();
        let mut body = payload.to_vec();
        cipher::encrypt_in_place(&mut body, number.raw());
        out.extend_from_slice(&body);
        out
    }

    fn control_datagram(code: ControlCode, param: Option<u32>) -> Vec<u8> {
        let number = PacketNumber::new(Channel::Control, code as u32);
        let mut out = number.raw().to_be_bytes().to_vec();
        if let Some(value) = param {
            out.extend_from_slice(&value.to_be_bytes());
        }
        out
    }

    fn ack_datagram(sequence: u32) -> Vec<u8> {
        PacketNumber::new(Channel::Acknowledge, sequence)
            .raw()
            .to_be_bytes()
            .to_vec()
    }

    fn drain_events(mgr: &NetworkMgr) -> Vec<NetEvent> {
        std::iter::from_fn(|| mgr.poll_event()).collect()
    }

    fn outgoing_channels(mgr: &NetworkMgr) -> Vec<Channel> {
        let outgoing = lock(&mgr.shared.outgoing);
        outgoing
            .active
            .iter()
            .filter_map(|&handle| outgoing.pool.get(handle).channel())
            .collect()
    }

    /// Pretends the socket thread sent everything queued: reliable packets
    /// move to the pending-acknowledge list, the rest go back to the pool.
    fn simulate_flush(mgr: &NetworkMgr) {
        simulate_flush_at(mgr, mgr.shared.now_ms());
    }

    fn simulate_flush_at(mgr: &NetworkMgr, now: u64) {
        let (mut table, _incoming, mut outgoing) = mgr.shared.lock_all();
        while let Some(handle) = outgoing.active.pop_front() {
            let (channel, address) = {
                let packet = outgoing.pool.get(handle);
                (packet.channel(), packet.address)
            };
            match channel {
                Some(Channel::Reliable) => {
                    outgoing.pool.get_mut(handle).sent_time = now;
                    outgoing.pending_ack.push(handle);
                }
                Some(Channel::Unreliable) | Some(Channel::Unordered) => {
                    if let Some(connection) = table.get_mut(address) {
                        connection.outgoing_unreliable_count -= 1;
                    }
                    outgoing.pool.release(handle);
                }
                Some(Channel::Connectionless) => {
                    outgoing.connectionless_count -= 1;
                    outgoing.pool.release(handle);
                }
                _ => outgoing.pool.release(handle),
            }
        }
    }

    #[test]
    fn test_reliable_delivery_reordered_arrival() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9000);
        open_connection(&mgr, peer, 0);

        for sequence in [2u32, 1, 0] {
            let datagram = data_datagram(Channel::Reliable, sequence, &[sequence as u8]);
            mgr.shared.handle_datagram(&datagram, peer);
        }

        // All three are in the window and buffered, but delivery is strictly
        // in sequence order.
        assert_eq!(mgr.packet_count(peer, ChannelMask::RELIABLE), 3);
        for expected in 0u8..3 {
            let message = mgr.receive_packet().unwrap();
            assert_eq!(message.channel, Channel::Reliable);
            assert_eq!(message.data, vec![expected]);
        }
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));

        // Every accepted reliable packet was acknowledged.
        let acks = outgoing_channels(&mgr)
            .iter()
            .filter(|&&c| c == Channel::Acknowledge)
            .count();
        assert_eq!(acks, 3);
    }

    #[test]
    fn test_reliable_gap_blocks_delivery() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9001);
        open_connection(&mgr, peer, 0);

        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 2, b"late"), peer);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 1, b"mid"), peer);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));

        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 0, b"first"), peer);
        assert_eq!(mgr.receive_packet().unwrap().data, b"first");
        assert_eq!(mgr.receive_packet().unwrap().data, b"mid");
        assert_eq!(mgr.receive_packet().unwrap().data, b"late");
    }

    #[test]
    fn test_reorder_window_bound() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9002);
        open_connection(&mgr, peer, 0);

        // Distance 32 is one past the window: dropped, not acknowledged.
        mgr.shared.handle_datagram(
            &data_datagram(Channel::Reliable, MAX_INCOMING_PACKET_COUNT as u32, b"far"),
            peer,
        );
        assert_eq!(mgr.packet_count(peer, ChannelMask::RELIABLE), 0);
        assert!(outgoing_channels(&mgr).is_empty());

        // The edge of the window is still accepted, and the expected
        // sequence is undisturbed when it finally arrives.
        mgr.shared.handle_datagram(
            &data_datagram(Channel::Reliable, MAX_INCOMING_PACKET_COUNT as u32 - 1, b"edge"),
            peer,
        );
        assert_eq!(mgr.packet_count(peer, ChannelMask::RELIABLE), 1);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 0, b"now"), peer);
        assert_eq!(mgr.receive_packet().unwrap().data, b"now");
    }

    #[test]
    fn test_reliable_duplicate_reacknowledged() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9003);
        open_connection(&mgr, peer, 0);

        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 0, b"a"), peer);
        assert_eq!(mgr.receive_packet().unwrap().data, b"a");

        // The same sequence again is behind the expected counter: no second
        // delivery, but the peer still gets an acknowledgement.
        simulate_flush(&mgr);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 0, b"a"), peer);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));
        assert_eq!(outgoing_channels(&mgr), vec![Channel::Acknowledge]);
    }

    #[test]
    fn test_unreliable_latest_wins() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9004);
        open_connection(&mgr, peer, 0);

        for sequence in [5u32, 3, 7] {
            let datagram = data_datagram(Channel::Unreliable, sequence, &[sequence as u8]);
            mgr.shared.handle_datagram(&datagram, peer);
        }

        assert_eq!(mgr.receive_packet().unwrap().data, vec![5]);
        // 3 is now stale and silently discarded; 7 comes out next.
        assert_eq!(mgr.receive_packet().unwrap().data, vec![7]);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));

        // A direct repeat of 7 is rejected at arrival.
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Unreliable, 7, &[7]), peer);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));
    }

    #[test]
    fn test_unordered_always_delivered() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9005);
        open_connection(&mgr, peer, 0);

        for sequence in [9u32, 2, 2] {
            let datagram = data_datagram(Channel::Unordered, sequence, &[sequence as u8]);
            mgr.shared.handle_datagram(&datagram, peer);
        }
        assert_eq!(mgr.receive_packet().unwrap().data, vec![9]);
        assert_eq!(mgr.receive_packet().unwrap().data, vec![2]);
        assert_eq!(mgr.receive_packet().unwrap().data, vec![2]);
    }

    #[test]
    fn test_acknowledge_clears_pending_resend() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9006);
        open_connection(&mgr, peer, 0);

        mgr.send_reliable_packet(peer, b"payload").unwrap();
        simulate_flush(&mgr);
        assert_eq!(lock(&mgr.shared.outgoing).pending_ack.len(), 1);

        // Sequence counters were seeded with 0, so this was sequence 0.
        mgr.shared.handle_datagram(&ack_datagram(0), peer);
        assert!(lock(&mgr.shared.outgoing).pending_ack.is_empty());

        let table = mgr.shared.lock_connections();
        let connection = table.get(peer).unwrap();
        assert!(connection.rtt >= 0);
        assert_eq!(connection.outgoing_reliable_count, 0);
        drop(table);

        // A retry scan after the acknowledge must not resend anything.
        mgr.network_task();
        assert_eq!(mgr.stats().packets_resent, 0);
    }

    #[test]
    fn test_reliable_resend_backoff() {
        let config = NetConfig {
            reliable_resend_time: 100,
            reliable_resend_count: 8,
            ..test_config()
        };
        let mgr = NetworkMgr::new(config);
        let peer = addr(9007);
        open_connection(&mgr, peer, 0);

        mgr.send_reliable_packet(peer, b"x").unwrap();
        simulate_flush_at(&mgr, 0);

        // Not due yet.
        mgr.shared.run_task(50);
        assert_eq!(mgr.stats().packets_resent, 0);

        // Due: requeued with a 1.25x interval.
        mgr.shared.run_task(120);
        assert_eq!(mgr.stats().packets_resent, 1);
        {
            let outgoing = lock(&mgr.shared.outgoing);
            let handle = *outgoing.active.front().unwrap();
            let packet = outgoing.pool.get(handle);
            assert_eq!(packet.resend_count, 1);
            assert_eq!(packet.resend_time, 125);
        }
        simulate_flush_at(&mgr, 120);

        // The grown interval applies to the next retry.
        mgr.shared.run_task(200);
        assert_eq!(mgr.stats().packets_resent, 1);
        mgr.shared.run_task(260);
        assert_eq!(mgr.stats().packets_resent, 2);
    }

    #[test]
    fn test_reliable_retry_exhaustion_tears_down() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9008);
        open_connection(&mgr, peer, 0);

        mgr.send_reliable_packet(peer, b"doomed").unwrap();
        for _ in 0..10 {
            simulate_flush(&mgr);
            mgr.network_task();
        }

        let events = drain_events(&mgr);
        assert_eq!(events, vec![NetEvent::ConnectionTimedOut { address: peer }]);
        assert_eq!(mgr.connection_count(), 0);
        let outgoing = lock(&mgr.shared.outgoing);
        assert!(outgoing.pending_ack.is_empty());
        assert_eq!(outgoing.pool.available(), outgoing.pool.capacity());
    }

    #[test]
    fn test_connect_request_opens_connection() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9010);

        let request = control_datagram(ControlCode::ConnectRequest, Some(0xC0DE));
        mgr.shared.handle_datagram(&request, peer);

        assert_eq!(mgr.connection_count(), 1);
        assert_eq!(
            drain_events(&mgr),
            vec![NetEvent::ConnectionOpened { address: peer }]
        );
        // The reply is a ConnectAccept carrying the connection's seed.
        let outgoing = lock(&mgr.shared.outgoing);
        let handle = *outgoing.active.front().unwrap();
        let packet = outgoing.pool.get(handle);
        assert_eq!(packet.number.channel(), Some(Channel::Control));
        assert_eq!(packet.number.sequence(), ControlCode::ConnectAccept as u32);
        let seed = u32::from_be_bytes(packet.payload().try_into().unwrap());
        drop(outgoing);
        let table = mgr.shared.lock_connections();
        assert_eq!(table.get(peer).unwrap().initial_sequence, seed);
    }

    #[test]
    fn test_connect_request_wrong_protocol_denied() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9011);

        let request = control_datagram(ControlCode::ConnectRequest, Some(0xBAD));
        mgr.shared.handle_datagram(&request, peer);

        assert_eq!(mgr.connection_count(), 0);
        assert!(drain_events(&mgr).is_empty());
        let outgoing = lock(&mgr.shared.outgoing);
        let handle = *outgoing.active.front().unwrap();
        let packet = outgoing.pool.get(handle);
        assert_eq!(packet.number.sequence(), ControlCode::ConnectDeny as u32);
        let reason = u32::from_be_bytes(packet.payload().try_into().unwrap());
        assert_eq!(DenyReason::from_raw(reason), Some(DenyReason::WrongProtocol));
    }

    #[test]
    fn test_connect_request_denied_when_full() {
        let config = NetConfig {
            max_connections: 1,
            ..test_config()
        };
        let mgr = NetworkMgr::new(config);
        open_connection(&mgr, addr(9012), 0);

        let request = control_datagram(ControlCode::ConnectRequest, Some(0xC0DE));
        mgr.shared.handle_datagram(&request, addr(9013));

        assert_eq!(mgr.connection_count(), 1);
        let outgoing = lock(&mgr.shared.outgoing);
        let handle = *outgoing.active.front().unwrap();
        let reason =
            u32::from_be_bytes(outgoing.pool.get(handle).payload().try_into().unwrap());
        assert_eq!(DenyReason::from_raw(reason), Some(DenyReason::ServerFull));
    }

    #[test]
    fn test_duplicate_connect_request_reaccepted() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9014);

        let request = control_datagram(ControlCode::ConnectRequest, Some(0xC0DE));
        mgr.shared.handle_datagram(&request, peer);
        let seed = mgr
            .shared
            .lock_connections()
            .get(peer)
            .unwrap()
            .initial_sequence;
        drain_events(&mgr);
        simulate_flush(&mgr);

        mgr.shared.handle_datagram(&request, peer);
        assert_eq!(mgr.connection_count(), 1);
        assert!(drain_events(&mgr).is_empty());
        let outgoing = lock(&mgr.shared.outgoing);
        let handle = *outgoing.active.front().unwrap();
        let packet = outgoing.pool.get(handle);
        assert_eq!(packet.number.sequence(), ControlCode::ConnectAccept as u32);
        assert_eq!(
            u32::from_be_bytes(packet.payload().try_into().unwrap()),
            seed
        );
    }

    #[test]
    fn test_connect_accept_opens_requesting_connection() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9015);
        mgr.connect(peer).unwrap();

        let accept = control_datagram(ControlCode::ConnectAccept, Some(77));
        mgr.shared.handle_datagram(&accept, peer);

        assert_eq!(
            drain_events(&mgr),
            vec![NetEvent::ConnectionAccepted { address: peer }]
        );
        let table = mgr.shared.lock_connections();
        let connection = table.get(peer).unwrap();
        assert_eq!(connection.status, ConnectionStatus::Open);
        assert_eq!(connection.incoming_reliable_sequence, 77);
        assert_eq!(connection.outgoing_reliable_sequence, 77);
        assert!(connection.rtt >= 0);
    }

    #[test]
    fn test_connect_deny_fails_connection() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9016);
        mgr.connect(peer).unwrap();

        let deny = control_datagram(ControlCode::ConnectDeny, Some(DenyReason::ServerFull as u32));
        mgr.shared.handle_datagram(&deny, peer);

        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(
            drain_events(&mgr),
            vec![NetEvent::ConnectionFailed {
                address: peer,
                reason: DenyReason::ServerFull,
            }]
        );
    }

    #[test]
    fn test_disconnect_control_closes_connection() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9017);
        open_connection(&mgr, peer, 0);
        mgr.send_reliable_packet(peer, b"inflight").unwrap();

        let disconnect = control_datagram(ControlCode::Disconnect, None);
        mgr.shared.handle_datagram(&disconnect, peer);

        assert_eq!(mgr.connection_count(), 0);
        assert_eq!(
            drain_events(&mgr),
            vec![NetEvent::ConnectionClosed { address: peer }]
        );
        // Queued traffic for the peer was flushed back to the pool.
        let outgoing = lock(&mgr.shared.outgoing);
        assert_eq!(outgoing.pool.available(), outgoing.pool.capacity());
    }

    #[test]
    fn test_connect_retry_exhaustion_times_out_once() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9018);
        mgr.connect(peer).unwrap();

        for _ in 0..10 {
            mgr.network_task();
            simulate_flush(&mgr);
        }

        let events = drain_events(&mgr);
        assert_eq!(events, vec![NetEvent::ConnectionTimedOut { address: peer }]);
        assert_eq!(mgr.connection_count(), 0);
    }

    #[test]
    fn test_send_errors() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9019);

        assert!(matches!(
            mgr.send_reliable_packet(peer, b"x"),
            Err(NetError::NoConnection)
        ));

        open_connection(&mgr, peer, 0);
        let oversized = vec![0u8; MAX_PAYLOAD_SIZE + 1];
        assert!(matches!(
            mgr.send_reliable_packet(peer, &oversized),
            Err(NetError::PacketTooLarge)
        ));

        for _ in 0..MAX_OUTGOING_RELIABLE_COUNT {
            mgr.send_reliable_packet(peer, b"fill").unwrap();
        }
        assert!(matches!(
            mgr.send_reliable_packet(peer, b"over"),
            Err(NetError::BufferFull)
        ));
    }

    #[test]
    fn test_send_rejected_while_disconnecting() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9020);
        open_connection(&mgr, peer, 0);
        mgr.disconnect(peer).unwrap();
        assert!(matches!(
            mgr.send_reliable_packet(peer, b"x"),
            Err(NetError::NoConnection)
        ));
    }

    #[test]
    fn test_connectionless_receive_and_self_filter() {
        let mgr = NetworkMgr::new(test_config());
        let local = addr(9021);
        *lock(&mgr.shared.local_address) = Some(local);

        // Our own broadcast echo is ignored.
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Connectionless, 1, b"echo"), local);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));

        let other = addr(9022);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Connectionless, 1, b"query"), other);
        assert_eq!(mgr.packet_count(other, ChannelMask::CONNECTIONLESS), 1);
        let message = mgr.receive_packet().unwrap();
        assert_eq!(message.from, other);
        assert_eq!(message.channel, Channel::Connectionless);
        assert_eq!(message.data, b"query");
    }

    #[test]
    fn test_connectionless_accepts_remote_on_same_port() {
        let mgr = NetworkMgr::new(test_config());
        // Wildcard bind; discovery peers all use the same well-known port.
        *lock(&mgr.shared.local_address) = Some(NetAddress::new(0, 28800));

        let remote = NetAddress::new(0x0A00_0005, 28800);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Connectionless, 1, b"found me"), remote);

        let message = mgr.receive_packet().unwrap();
        assert_eq!(message.from, remote);
        assert_eq!(message.data, b"found me");
    }

    #[test]
    fn test_connectionless_broadcast_echo_suppressed() {
        let mgr = NetworkMgr::new(test_config());
        *lock(&mgr.shared.local_address) = Some(NetAddress::new(0, 28800));
        // The interface our broadcasts leave from, as recorded at
        // initialization.
        let iface = NetAddress::new(0xC0A8_0105, 28800);
        lock(&mgr.shared.self_addresses).push(iface);

        mgr.shared
            .handle_datagram(&data_datagram(Channel::Connectionless, 1, b"echo"), iface);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));

        // A different host on that port is not us.
        let remote = NetAddress::new(0xC0A8_0106, 28800);
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Connectionless, 1, b"hello"), remote);
        assert_eq!(mgr.receive_packet().unwrap().from, remote);
    }

    #[test]
    fn test_connectionless_send_quota() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9023);
        for _ in 0..MAX_CONNECTIONLESS_COUNT {
            mgr.send_connectionless_packet(peer, b"q").unwrap();
        }
        assert!(matches!(
            mgr.send_connectionless_packet(peer, b"q"),
            Err(NetError::BufferFull)
        ));
        simulate_flush(&mgr);
        mgr.send_connectionless_packet(peer, b"q").unwrap();
    }

    #[test]
    fn test_bad_datagrams_counted_not_delivered() {
        let mgr = NetworkMgr::new(test_config());
        let peer = addr(9024);

        // Below the minimum header.
        mgr.shared.handle_datagram(&[1, 2], peer);
        // Unrecognized channel tag (7).
        mgr.shared.handle_datagram(&[0xE0, 0, 0, 0], peer);
        // The zero-length wake datagram is not an error.
        mgr.shared.handle_datagram(&[], peer);

        assert_eq!(mgr.stats().bad_packets, 2);
        assert!(matches!(mgr.receive_packet(), Err(NetError::NoPacket)));
    }

    #[test]
    fn test_terminate_releases_everything() {
        let mut mgr = NetworkMgr::new(test_config());
        let peer = addr(9025);
        open_connection(&mgr, peer, 0);
        mgr.send_reliable_packet(peer, b"queued").unwrap();
        mgr.shared
            .handle_datagram(&data_datagram(Channel::Reliable, 0, b"in"), peer);

        mgr.terminate();

        assert_eq!(mgr.connection_count(), 0);
        let incoming = lock(&mgr.shared.incoming);
        assert_eq!(incoming.pool.available(), incoming.pool.capacity());
        drop(incoming);
        let outgoing = lock(&mgr.shared.outgoing);
        assert_eq!(outgoing.pool.available(), outgoing.pool.capacity());
    }
}
