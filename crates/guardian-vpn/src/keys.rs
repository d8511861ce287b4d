//! WireGuard key material
//!
//! Keys travel as standard base64 of 32 raw bytes, the way `wg` prints them.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use rand::rngs::OsRng;
use std::fmt;
use std::str::FromStr;
use x25519_dalek::{PublicKey as DalekPublic, StaticSecret};

pub const KEY_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("Key is not valid base64")]
    InvalidBase64,

    #[error("Key must decode to 32 bytes, got {0}")]
    InvalidLength(usize),
}

fn decode(s: &str) -> Result<[u8; KEY_LEN], KeyError> {
    let raw = BASE64.decode(s.trim()).map_err(|_| KeyError::InvalidBase64)?;
    let len = raw.len();
    raw.try_into().map_err(|_| KeyError::InvalidLength(len))
}

/// Device secret. `Debug` never prints it.
#[derive(Clone)]
pub struct PrivateKey(StaticSecret);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(StaticSecret::random_from_rng(OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(DalekPublic::from(&self.0).to_bytes())
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0.as_bytes())
    }
}

impl FromStr for PrivateKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).map(|bytes| Self(StaticSecret::from(bytes)))
    }
}

impl PartialEq for PrivateKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PrivateKey {}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Peer or device public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode(s).map(Self)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_key_text_form() {
        let key = PrivateKey::generate();
        let restored: PrivateKey = key.to_base64().parse().unwrap();

        assert_eq!(restored, key);
        assert_eq!(restored.public_key(), key.public_key());
    }

    #[test]
    fn test_known_public_key() {
        let text = "Wy2FhqDJcZU03O/D9IUG/U5BL0PLbF06nvsfgIwrmGk=";
        let key: PublicKey = format!("  {}\n", text).parse().unwrap();
        assert_eq!(key.to_string(), text);
    }

    #[test]
    fn test_invalid_keys() {
        assert_eq!("not-valid-base64!!!".parse::<PublicKey>(), Err(KeyError::InvalidBase64));
        assert_eq!("AAAA".parse::<PrivateKey>(), Err(KeyError::InvalidLength(3)));
    }

    #[test]
    fn test_private_key_redacted() {
        let key = PrivateKey::generate();
        assert_eq!(format!("{:?}", key), "PrivateKey(..)");
    }
}
