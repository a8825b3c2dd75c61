//! Master-key crypto and the on-disk envelope.
//!
//! Every file the server persists starts with the 5-byte magic `KRIN` plus
//! an algorithm byte, followed by a data-encryption key wrapped under the
//! master key, followed by fixed-size AEAD frames. The master key itself
//! lives in `master.key`, wrapped under a passphrase-derived key.

pub mod envelope;
pub mod master;
pub mod stream;

pub use master::{Algorithm, DataKey, MasterKey};
pub use stream::{StreamReader, StreamWriter, CHUNK_SIZE};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key bytes that are wiped from memory when released.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(pub(crate) Vec<u8>);

impl SecretBytes {
    pub fn new(bytes: Vec<u8>) -> SecretBytes {
        SecretBytes(bytes)
    }

    pub fn random(len: usize) -> SecretBytes {
        use rand::RngCore;
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        SecretBytes(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SecretBytes(..)")
    }
}
