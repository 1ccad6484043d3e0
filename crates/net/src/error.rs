use std::io;

/// Result codes of the transport. Everything here is an expected operating
/// condition of an unreliable network; nothing is fatal.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("network initialization failed: {0}")]
    InitFailed(#[from] io::Error),
    #[error("no connection exists for the target address")]
    NoConnection,
    #[error("packet exceeds the maximum payload size")]
    PacketTooLarge,
    #[error("packet buffers are full")]
    BufferFull,
    #[error("no packet available")]
    NoPacket,
    #[error("address resolution failed")]
    ResolveFailed,
    #[error("address not found")]
    ResolveNotFound,
}
