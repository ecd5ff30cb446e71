use rand::RngCore;

/// Cryptographically strong byte source.
pub fn rand_bytes(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::rng().fill_bytes(&mut buf);
    buf
}

pub fn rand_u32() -> u32 {
    rand::rng().next_u32()
}
