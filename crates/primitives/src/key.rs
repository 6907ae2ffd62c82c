//! Public keys, secret keys, and discovery-key derivation.

use crate::error::{KeyError, Result};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Size of a public key or discovery key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of a secret key in bytes (seed followed by the public half).
pub const SECRET_KEY_SIZE: usize = 64;

/// Namespace mixed into discovery-key derivation so the hash cannot be
/// confused with any other use of the public key.
const DISCOVERY_NAMESPACE: &[u8] = b"wharf-discovery";

/// The public identity of a log.
///
/// Globally unique and immutable for the lifetime of the log.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Creates a public key from raw bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Creates a public key from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes =
            <[u8; KEY_SIZE]>::try_from(slice).map_err(|_| KeyError::length(KEY_SIZE, slice.len()))?;
        Ok(Self(bytes))
    }

    /// Derives the discovery key for this public key.
    ///
    /// The derivation is a one-way hash: peers holding only the discovery
    /// key cannot recover the public key, while any holder of the public
    /// key computes the same discovery key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = Sha256::new();
        hasher.update(DISCOVERY_NAMESPACE);
        hasher.update(self.0);
        DiscoveryKey(hasher.finalize().into())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({self})")
    }
}

impl FromStr for PublicKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The topic identity a log is announced under.
///
/// Derived from the public key via [`PublicKey::discovery_key`]; safe to
/// advertise to peers that must not learn the public key itself.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; KEY_SIZE]);

impl DiscoveryKey {
    /// Creates a discovery key from raw bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// Creates a discovery key from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes =
            <[u8; KEY_SIZE]>::try_from(slice).map_err(|_| KeyError::length(KEY_SIZE, slice.len()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({self})")
    }
}

impl FromStr for DiscoveryKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for DiscoveryKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// The secret half of a log keypair.
///
/// Layout matches the Ed25519 keypair encoding: a 32-byte seed followed by
/// the 32-byte public key. Present only for logs created locally.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; SECRET_KEY_SIZE]);

impl SecretKey {
    /// Creates a secret key from raw bytes.
    pub fn new(bytes: [u8; SECRET_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_SIZE] {
        &self.0
    }

    /// Creates a secret key from a slice, checking the length.
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes = <[u8; SECRET_KEY_SIZE]>::try_from(slice)
            .map_err(|_| KeyError::length(SECRET_KEY_SIZE, slice.len()))?;
        Ok(Self(bytes))
    }

    /// Returns the public key embedded in the trailing half.
    pub fn public_key(&self) -> PublicKey {
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&self.0[KEY_SIZE..]);
        PublicKey(bytes)
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret material.
        f.write_str("SecretKey(..)")
    }
}

impl Serialize for SecretKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> core::result::Result<Self, D::Error> {
        struct SecretKeyVisitor;

        impl serde::de::Visitor<'_> for SecretKeyVisitor {
            type Value = SecretKey;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{SECRET_KEY_SIZE} bytes of secret key material")
            }

            fn visit_bytes<E: serde::de::Error>(
                self,
                v: &[u8],
            ) -> core::result::Result<Self::Value, E> {
                SecretKey::from_slice(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_bytes(SecretKeyVisitor)
    }
}

/// A freshly generated log identity.
#[derive(Clone)]
pub struct Keypair {
    /// The public half, used as the log identity.
    pub public: PublicKey,
    /// The secret half, kept by the writer.
    pub secret: SecretKey,
}

impl Keypair {
    /// Generates a new random keypair.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        Self {
            public: PublicKey(signing.verifying_key().to_bytes()),
            secret: SecretKey(signing.to_keypair_bytes()),
        }
    }
}
