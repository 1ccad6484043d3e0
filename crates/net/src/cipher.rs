//! Payload obfuscation keyed by the packet number.
//!
//! This is NOT a security primitive: it provides no confidentiality,
//! integrity, or authentication. It exists to deter casual sniffing and
//! trivial tampering of datagrams, nothing more.

const ROTATIONS: [u32; 4] = [1, 3, 5, 7];

/// Derives the per-packet rotation amount and 4-byte XOR mask.
fn derive_key(number: u32) -> (u32, [u8; 4]) {
    let r1 = number.wrapping_mul(0xBC65_8A9D);
    let r2 = number.wrapping_mul(0x9DEA_7405);
    // High half of r1, low half of r2.
    let c = (r1 & 0xFFFF_0000) | (r2 & 0x0000_FFFF);
    let mask = [
        (c & 0xFF) as u8,
        (c >> 8) as u8,
        (c >> 16) as u8,
        (c >> 24) as u8,
    ];
    (ROTATIONS[(r1 >> 30) as usize], mask)
}

/// Obfuscates `data` in place. Inverse of [`decrypt_in_place`].
pub fn encrypt_in_place(data: &mut [u8], number: u32) {
    let (rotation, mask) = derive_key(number);
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = byte.rotate_left(rotation) ^ mask[3 - (i & 3)];
    }
}

/// Restores data obfuscated by [`encrypt_in_place`] with the same number.
pub fn decrypt_in_place(data: &mut [u8], number: u32) {
    let (rotation, mask) = derive_key(number);
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = (*byte ^ mask[3 - (i & 3)]).rotate_right(rotation);
    }
}
