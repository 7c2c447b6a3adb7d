//! Head↔node trust layer: Ed25519 key material, the signed request envelope,
//! and the replay-protection nonce window.

pub mod envelope;
pub mod keys;
pub mod nonce;

pub use envelope::{EnvelopeSigner, EnvelopeVerifier, SigMeta, body_digest, canonical_string};
pub use keys::{HeadKeypair, KeyRing, TrustedKey, ensure_keypair};
pub use nonce::NonceWindow;

/// Compare two secrets without leaking the mismatch position through timing.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    use subtle::ConstantTimeEq;
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches() {
        assert!(constant_time_eq("token", "token"));
        assert!(!constant_time_eq("token", "tokem"));
        assert!(!constant_time_eq("token", "toke"));
    }
}
