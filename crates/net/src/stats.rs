#[derive(Debug, Clone, Copy, Default)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Undersized or unclassifiable datagrams, dropped without comment.
    pub bad_packets: u64,
}

pub fn rand_u32() -> u32 {
    rand_u64() as u32
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::Instant;

    let mut hasher = DefaultHasher::new();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}
