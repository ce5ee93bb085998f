//! Credential codec: one-way password hashing and hex transport encoding.
//!
//! digest = SHA-256(password), carried on the wire and stored as 64 lowercase
//! hex characters so stored and transmitted hashes compare byte-for-byte.

use crate::error::{CourierError, CourierResult};
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of a credential digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// A SHA-256 password digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialDigest([u8; DIGEST_LEN]);

impl CredentialDigest {
    /// Hex form used on the wire and in the store.
    pub fn to_hex(&self) -> String {
        encode(self)
    }
}

// Never print digests in logs.
impl fmt::Debug for CredentialDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialDigest(..)")
    }
}

/// Hash a plaintext password.
pub fn hash(password: &str) -> CredentialDigest {
    let digest = Sha256::digest(password.as_bytes());
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&digest);
    CredentialDigest(out)
}

/// Encode a digest as lowercase hex.
pub fn encode(digest: &CredentialDigest) -> String {
    hex::encode(digest.0)
}

/// Decode a hex string into a digest.
///
/// Fails with [`CourierError::MalformedCredential`] on a wrong length or a
/// non-hex character.
pub fn decode(s: &str) -> CourierResult<CredentialDigest> {
    if s.len() != DIGEST_LEN * 2 {
        return Err(CourierError::MalformedCredential(format!(
            "invalid length: expected {}, got {}",
            DIGEST_LEN * 2,
            s.len()
        )));
    }
    let mut out = [0u8; DIGEST_LEN];
    hex::decode_to_slice(s, &mut out)
        .map_err(|e| CourierError::MalformedCredential(format!("invalid hex: {e}")))?;
    Ok(CredentialDigest(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash("pw1"), hash("pw1"));
        assert_ne!(hash("pw1"), hash("pw2"));
    }

    #[test]
    fn known_vector() {
        // sha256("abc")
        assert_eq!(
            encode(&hash("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn decode_accepts_uppercase() {
        let digest = hash("secret");
        let upper = encode(&digest).to_uppercase();
        assert_eq!(decode(&upper).unwrap(), digest);
        assert_eq!(decode(&upper).unwrap().to_hex(), encode(&digest));
    }

    #[test]
    fn decode_rejects_wrong_length() {
        let err = decode("abcd").unwrap_err();
        assert!(matches!(err, CourierError::MalformedCredential(_)));
    }

    #[test]
    fn decode_rejects_non_hex() {
        let bad = "zz".repeat(DIGEST_LEN);
        let err = decode(&bad).unwrap_err();
        assert!(matches!(err, CourierError::MalformedCredential(_)));
    }

    #[test]
    fn debug_hides_bytes() {
        let shown = format!("{:?}", hash("pw"));
        assert_eq!(shown, "CredentialDigest(..)");
    }
}
