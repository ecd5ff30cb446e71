use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use ahash::AHasher;

/// Randomize a keep-alive interval against user identity and client IP, to
/// avoid thundering-herd mobile wake-ups. Deterministic for a given
/// (identity, ip, base) so repeated calls for one session don't drift, but
/// spread across accounts.
///
/// Produces a value in `[base_ms * 0.8, base_ms * 1.2]`.
pub fn keepalive_jitter_ms(base_ms: u64, identity: &str, client_ip: IpAddr) -> u64 {
    let mut hasher = AHasher::default();
    identity.hash(&mut hasher);
    client_ip.hash(&mut hasher);
    let h = hasher.finish();

    let span = (base_ms as f64 * 0.4) as i64;
    let offset = if span == 0 {
        0
    } else {
        (h % (span as u64 * 2 + 1)) as i64 - span
    };
    (base_ms as i64 + offset).max(1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_inputs() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = keepalive_jitter_ms(30_000, "user@example.com", ip);
        let b = keepalive_jitter_ms(30_000, "user@example.com", ip);
        assert_eq!(a, b);
        assert!(a >= 18_000 && a <= 42_000);
    }

    #[test]
    fn differs_across_identities() {
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let a = keepalive_jitter_ms(30_000, "alice@example.com", ip);
        let b = keepalive_jitter_ms(30_000, "bob@example.com", ip);
        assert_ne!(a, b);
    }
}
