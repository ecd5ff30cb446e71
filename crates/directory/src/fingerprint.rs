use compact_str::CompactString;
use rsa::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha256};

use crate::types::{Fingerprint, FINGERPRINT_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PemError {
    NotPem,
    NotPublicKey,
    Unrecognized,
}

/// Validates that `pem_text` is a `BEGIN/END PUBLIC KEY` PEM block encoding
/// an RSA or EC public key, and derives its fingerprint: SHA-256 of the
/// DER-encoded SubjectPublicKeyInfo, truncated to the first 20 bytes and
/// lowercase-hex-encoded to a fixed 40-byte width.
pub fn fingerprint_pem(pem_text: &str) -> Result<Fingerprint, PemError> {
    let block = pem::parse(pem_text.as_bytes()).map_err(|_| PemError::NotPem)?;
    if block.tag() != "PUBLIC KEY" {
        return Err(PemError::NotPublicKey);
    }
    let der = block.contents();

    let recognized = rsa::RsaPublicKey::from_public_key_der(der).is_ok()
        || p256::PublicKey::from_public_key_der(der).is_ok()
        || p384::PublicKey::from_public_key_der(der).is_ok();
    if !recognized {
        return Err(PemError::Unrecognized);
    }

    Ok(hash_der(der))
}

fn hash_der(der: &[u8]) -> Fingerprint {
    let digest = Sha256::digest(der);
    let mut hex = String::with_capacity(FINGERPRINT_LEN);
    for byte in &digest[..FINGERPRINT_LEN / 2] {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    Fingerprint(CompactString::from(hex))
}

/// Test fixtures shared across this workspace (gated by `test_mode` rather
/// than `cfg(test)` so other crates' integration tests can reach them too).
#[cfg(any(test, feature = "test_mode"))]
pub mod testutil {
    use p256::pkcs8::EncodePublicKey;

    fn decode_hex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    /// Builds a real, valid P-256 public key PEM from the well-known curve
    /// generator point (FIPS 186-4 / SEC 2), so the fixture is guaranteed to
    /// parse as an on-curve point rather than relying on hand-copied base64.
    pub fn p256_generator_pubkey_pem() -> String {
        let gx = decode_hex("6b17d1f2e12c4247f8bce6e563a440f277037d812deb33a0f4a13945d898c296");
        let gy = decode_hex("4fe342e2fe1a7f9b8ee7eb4a7c0f9e162bce33576b315ececbb6406837bf51f5");
        assert_eq!(gx.len(), 32);
        assert_eq!(gy.len(), 32);

        let mut sec1 = vec![0x04u8];
        sec1.extend_from_slice(&gx);
        sec1.extend_from_slice(&gy);

        let pubkey = p256::PublicKey::from_sec1_bytes(&sec1).expect("generator is on-curve");
        pubkey
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .expect("encode pem")
    }

    /// A second, distinct valid P-256 public key, derived deterministically
    /// from a tiny nonzero scalar (so it's certain to be below the curve
    /// order) rather than a second hand-copied constant. `seed` only needs
    /// to vary the scalar; any two distinct small nonzero values give two
    /// distinct points.
    pub fn deterministic_pubkey_pem(seed: u8) -> String {
        let mut scalar_bytes = [0u8; 32];
        scalar_bytes[31] = seed.wrapping_add(1).max(1);
        let secret = p256::SecretKey::from_slice(&scalar_bytes).expect("tiny scalar is valid");
        secret
            .public_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .expect("encode pem")
    }
}

#[cfg(test)]
mod tests {
    use super::testutil;
    use super::*;

    #[test]
    fn rejects_non_pem() {
        assert_eq!(fingerprint_pem("not a pem"), Err(PemError::NotPem));
    }

    #[test]
    fn accepts_ec_public_key_and_is_deterministic() {
        let pem = testutil::p256_generator_pubkey_pem();
        let a = fingerprint_pem(&pem).expect("valid key");
        let b = fingerprint_pem(&pem).expect("valid key");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
        assert!(a.as_str().bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn distinct_seeds_yield_distinct_fingerprints() {
        let a = fingerprint_pem(&testutil::deterministic_pubkey_pem(1)).unwrap();
        let b = fingerprint_pem(&testutil::deterministic_pubkey_pem(2)).unwrap();
        assert_ne!(a, b);
    }
}
