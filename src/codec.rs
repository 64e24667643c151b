//! Invite codes: reversible, checksummed encodings of user ids.
//!
//! A code is the URL-safe base64 (no padding) of
//!
//! ```text
//! minimal big-endian id bytes (1..=8) || SHA-256(secret || "refgate-invite" || id bytes)[..4]
//! ```
//!
//! so it decodes straight back to the id without a lookup table, and a code
//! cannot be forged for an arbitrary id without the secret. Codes are at most
//! 16 characters from `[A-Za-z0-9_-]`, which fits bot deep-link parameters.

use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};

use crate::model::UserId;

const TAG_LEN: usize = 4;
const DOMAIN: &[u8] = b"refgate-invite";
/// 8 id bytes + tag, base64 without padding.
pub const MAX_CODE_LEN: usize = 16;

/// Why a presented code was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidCode {
    Empty,
    TooLong,
    Alphabet,
    Length,
    NonCanonical,
    Checksum,
}

impl fmt::Display for InvalidCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidCode::Empty => write!(f, "empty invite code"),
            InvalidCode::TooLong => write!(f, "invite code longer than {MAX_CODE_LEN} characters"),
            InvalidCode::Alphabet => write!(f, "invite code is not url-safe base64"),
            InvalidCode::Length => write!(f, "invite code has the wrong length"),
            InvalidCode::NonCanonical => write!(f, "invite code is not in canonical form"),
            InvalidCode::Checksum => write!(f, "invite code checksum mismatch"),
        }
    }
}

impl std::error::Error for InvalidCode {}

#[derive(Clone)]
pub struct InviteCodec {
    secret: Vec<u8>,
}

impl fmt::Debug for InviteCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InviteCodec").finish_non_exhaustive()
    }
}

impl InviteCodec {
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    fn tag(&self, id_bytes: &[u8]) -> [u8; TAG_LEN] {
        let mut hasher = Sha256::new();
        hasher.update(&self.secret);
        hasher.update(DOMAIN);
        hasher.update(id_bytes);
        let digest = hasher.finalize();
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&digest[..TAG_LEN]);
        tag
    }

    /// Deterministic and total.
    pub fn encode(&self, id: UserId) -> String {
        let be = id.0.to_be_bytes();
        let skip = be.iter().take_while(|b| **b == 0).count().min(be.len() - 1);
        let id_bytes = &be[skip..];

        let mut raw = Vec::with_capacity(id_bytes.len() + TAG_LEN);
        raw.extend_from_slice(id_bytes);
        raw.extend_from_slice(&self.tag(id_bytes));
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Parse a presented code. Never panics on arbitrary input.
    pub fn decode(&self, code: &str) -> Result<UserId, InvalidCode> {
        let code = code.trim();
        if code.is_empty() {
            return Err(InvalidCode::Empty);
        }
        if code.len() > MAX_CODE_LEN {
            return Err(InvalidCode::TooLong);
        }
        let raw = URL_SAFE_NO_PAD
            .decode(code)
            .map_err(|_| InvalidCode::Alphabet)?;
        if raw.len() <= TAG_LEN || raw.len() > 8 + TAG_LEN {
            return Err(InvalidCode::Length);
        }

        let (id_bytes, tag) = raw.split_at(raw.len() - TAG_LEN);
        if id_bytes.len() > 1 && id_bytes[0] == 0 {
            return Err(InvalidCode::NonCanonical);
        }
        if self.tag(id_bytes) != tag {
            return Err(InvalidCode::Checksum);
        }

        let mut be = [0u8; 8];
        be[8 - id_bytes.len()..].copy_from_slice(id_bytes);
        Ok(UserId(u64::from_be_bytes(be)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> InviteCodec {
        InviteCodec::new("unit-test-secret")
    }

    #[test]
    fn decode_inverts_encode_across_the_id_space() {
        let c = codec();
        let mut ids = vec![0, 1, 42, 255, 256, 65_535, 65_536, u64::MAX, u64::MAX - 1];
        ids.extend((0..64).map(|shift| 1u64 << shift));
        ids.extend((0..64).map(|shift| (1u64 << shift).wrapping_sub(1)));
        ids.push(7_123_456_789);
        for id in ids {
            let code = c.encode(UserId(id));
            assert!(code.len() <= MAX_CODE_LEN, "{code} too long");
            assert_eq!(c.decode(&code), Ok(UserId(id)), "id {id} code {code}");
        }
    }

    #[test]
    fn encode_is_deterministic_and_alphabet_safe() {
        let c = codec();
        let a = c.encode(UserId(123_456));
        assert_eq!(a, c.encode(UserId(123_456)));
        assert!(a
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
        assert_ne!(a, c.encode(UserId(123_457)));
    }

    #[test]
    fn other_secret_rejects_code() {
        let code = codec().encode(UserId(1));
        assert_eq!(
            InviteCodec::new("another-secret").decode(&code),
            Err(InvalidCode::Checksum)
        );
    }

    #[test]
    fn tampered_code_fails_checksum() {
        let c = codec();
        let code = c.encode(UserId(987_654));
        let mut raw = URL_SAFE_NO_PAD.decode(&code).unwrap();
        raw[0] ^= 0x01;
        let forged = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(c.decode(&forged), Err(InvalidCode::Checksum));
    }

    #[test]
    fn leading_zero_padding_is_rejected() {
        let c = codec();
        let id_bytes = [0u8, 5];
        let mut raw = id_bytes.to_vec();
        raw.extend_from_slice(&c.tag(&id_bytes));
        let padded = URL_SAFE_NO_PAD.encode(raw);
        assert_eq!(c.decode(&padded), Err(InvalidCode::NonCanonical));
    }

    #[test]
    fn malformed_input_is_invalid_not_a_panic() {
        let c = codec();
        assert_eq!(c.decode(""), Err(InvalidCode::Empty));
        assert_eq!(c.decode("   "), Err(InvalidCode::Empty));
        assert_eq!(c.decode("AAAAAAAAAAAAAAAAAAAA"), Err(InvalidCode::TooLong));
        assert_eq!(c.decode("abc$"), Err(InvalidCode::Alphabet));
        assert_eq!(c.decode("ab=="), Err(InvalidCode::Alphabet));
        assert_eq!(c.decode("AAAA"), Err(InvalidCode::Length));
        assert!(c.decode("ключ").is_err());
        assert!(c.decode("A").is_err());
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        let c = codec();
        let code = c.encode(UserId(77));
        assert_eq!(c.decode(&format!("  {code}\n")), Ok(UserId(77)));
    }
}
