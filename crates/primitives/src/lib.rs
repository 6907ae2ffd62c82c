//! Key material for wharf logs.
//!
//! Every log is identified by an Ed25519 public key. The discovery key,
//! a one-way hash of the public key, is the identity announced to peers.

mod error;
mod key;

pub use error::{KeyError, Result};
pub use key::{DiscoveryKey, KEY_SIZE, Keypair, PublicKey, SECRET_KEY_SIZE, SecretKey};
