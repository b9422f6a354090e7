//! Thin helpers over the `nkeys` crate: role-aware keypair creation and
//! seed decoding that rejects material with the wrong role prefix.

use nkeys::{KeyPair, KeyPairType};
use thiserror::Error;

/// The three nkey roles this operator mints. Signing keys reuse the role of
/// their owner (an Operator-owned SigningKey is an Operator-prefixed key).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Operator,
    Account,
    User,
}

impl KeyKind {
    pub fn create(&self) -> KeyPair {
        KeyPair::new(self.key_pair_type())
    }

    fn key_pair_type(&self) -> KeyPairType {
        match self {
            KeyKind::Operator => KeyPairType::Operator,
            KeyKind::Account => KeyPairType::Account,
            KeyKind::User => KeyPairType::User,
        }
    }

    /// Two-character prefix of an encoded seed for this role.
    pub fn seed_prefix(&self) -> &'static str {
        match self {
            KeyKind::Operator => "SO",
            KeyKind::Account => "SA",
            KeyKind::User => "SU",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Operator => "operator",
            KeyKind::Account => "account",
            KeyKind::User => "user",
        }
    }
}

#[derive(Debug, Error)]
pub enum SeedError {
    #[error("seed is not valid UTF-8")]
    NotUtf8,
    #[error("failed to parse seed: {0}")]
    Malformed(String),
    #[error("unexpected seed prefix, wanted {wanted:?} but got {got:?}")]
    WrongPrefix { wanted: &'static str, got: String },
}

/// Decodes a seed from raw secret bytes, tolerating surrounding whitespace.
pub fn seed_from_bytes(bytes: &[u8]) -> Result<String, SeedError> {
    let s = std::str::from_utf8(bytes).map_err(|_| SeedError::NotUtf8)?;
    Ok(s.trim().to_string())
}

pub fn from_seed(seed: &str) -> Result<KeyPair, SeedError> {
    KeyPair::from_seed(seed).map_err(|e| SeedError::Malformed(e.to_string()))
}

/// Decodes a seed and verifies its role prefix matches the expected kind.
pub fn from_seed_expecting(seed: &str, kind: KeyKind) -> Result<KeyPair, SeedError> {
    if !seed.starts_with(kind.seed_prefix()) {
        return Err(SeedError::WrongPrefix {
            wanted: kind.seed_prefix(),
            got: seed.chars().take(2).collect(),
        });
    }
    from_seed(seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_pairs_round_trip_through_seed() {
        for kind in [KeyKind::Operator, KeyKind::Account, KeyKind::User] {
            let kp = kind.create();
            let seed = kp.seed().expect("seed");
            assert!(seed.starts_with(kind.seed_prefix()), "seed {seed}");

            let restored = from_seed_expecting(&seed, kind).expect("restore");
            assert_eq!(restored.public_key(), kp.public_key());
        }
    }

    #[test]
    fn wrong_prefix_is_rejected() {
        let account = KeyKind::Account.create();
        let seed = account.seed().expect("seed");
        let err = from_seed_expecting(&seed, KeyKind::Operator).unwrap_err();
        assert!(matches!(err, SeedError::WrongPrefix { wanted: "SO", .. }));
    }

    #[test]
    fn seed_bytes_are_trimmed() {
        let kp = KeyKind::User.create();
        let seed = kp.seed().expect("seed");
        let padded = format!("{seed}\n");
        assert_eq!(seed_from_bytes(padded.as_bytes()).unwrap(), seed);
    }
}
