/// Transport configuration. All knobs are read at [`initialize`] time;
/// changing them afterwards has no effect on an open socket.
///
/// [`initialize`]: crate::NetworkMgr::initialize
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Local UDP port; 0 lets the OS pick one.
    pub local_port: u16,
    /// Destination port for [`broadcast_packet`].
    ///
    /// [`broadcast_packet`]: crate::NetworkMgr::broadcast_packet
    pub broadcast_port: u16,
    /// Must match between peers or connection requests are denied.
    pub protocol_id: u32,
    /// Upper bound on simultaneous connections, local and remote combined.
    /// Zero makes this endpoint refuse inbound requests entirely.
    pub max_connections: usize,
    /// Initial resend interval for reliable packets and control retries, ms.
    pub reliable_resend_time: u64,
    /// Attempts before a reliable exchange gives up and the connection is
    /// torn down.
    pub reliable_resend_count: u32,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            local_port: 0,
            broadcast_port: 28800,
            protocol_id: 0,
            max_connections: 32,
            reliable_resend_time: 500,
            reliable_resend_count: 8,
        }
    }
}
