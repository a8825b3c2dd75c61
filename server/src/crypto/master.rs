use super::SecretBytes;
use crate::error::{ServerError, ServerResult};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use std::io::Write;
use std::path::Path;

pub const MAGIC: [u8; 4] = *b"KRIN";

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;

const MASTER_KEY_AAD: &[u8] = b"master.key";
const WRAPPED_VALUE_AAD: &[u8] = b"wrapped-value";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Algorithm {
    Aes256Gcm,
    Chacha20Poly1305,
}

impl Algorithm {
    pub fn byte(self) -> u8 {
        match self {
            Algorithm::Aes256Gcm => b'A',
            Algorithm::Chacha20Poly1305 => b'C',
        }
    }

    pub fn from_byte(b: u8) -> Option<Algorithm> {
        match b {
            b'A' => Some(Algorithm::Aes256Gcm),
            b'C' => Some(Algorithm::Chacha20Poly1305),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Algorithm::Aes256Gcm => "aes-256-gcm",
            Algorithm::Chacha20Poly1305 => "chacha20-poly1305",
        }
    }
}

pub(crate) fn aead_encrypt(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    msg: &[u8],
    aad: &[u8],
) -> Vec<u8> {
    let payload = Payload { msg, aad };
    match alg {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).expect("key length");
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(nonce), payload)
                .expect("aead encrypt")
        }
        Algorithm::Chacha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length");
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
                .expect("aead encrypt")
        }
    }
}

pub(crate) fn aead_decrypt(
    alg: Algorithm,
    key: &[u8],
    nonce: &[u8; NONCE_LEN],
    ct: &[u8],
    aad: &[u8],
) -> ServerResult<Vec<u8>> {
    let payload = Payload { msg: ct, aad };
    let out = match alg {
        Algorithm::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key).expect("key length");
            cipher.decrypt(aes_gcm::Nonce::from_slice(nonce), payload)
        }
        Algorithm::Chacha20Poly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key).expect("key length");
            cipher.decrypt(chacha20poly1305::Nonce::from_slice(nonce), payload)
        }
    };
    out.map_err(|_| ServerError::DecryptFailed)
}

/// A per-object data-encryption key, generated fresh for every stored
/// object and wrapped under the master key in the object's header.
pub struct DataKey {
    pub(crate) algorithm: Algorithm,
    pub(crate) key: SecretBytes,
}

impl DataKey {
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }
}

/// The server master key. All persistent state is unreadable without it.
pub struct MasterKey {
    algorithm: Algorithm,
    key: SecretBytes,
}

impl MasterKey {
    /// A fresh key that has not been persisted anywhere.
    pub fn random(algorithm: Algorithm) -> MasterKey {
        MasterKey {
            algorithm,
            key: SecretBytes::random(KEY_LEN),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Creates `path` on first run, or opens it. Failure to open an
    /// existing key file is fatal for the caller.
    pub fn create_or_open(
        path: &Path,
        passphrase: &str,
        algorithm: Algorithm,
    ) -> ServerResult<MasterKey> {
        if path.exists() {
            MasterKey::open(path, passphrase)
        } else {
            let key = MasterKey::random(algorithm);
            key.save(path, passphrase)?;
            Ok(key)
        }
    }

    pub fn open(path: &Path, passphrase: &str) -> ServerResult<MasterKey> {
        let raw = std::fs::read(path)?;
        if raw.len() < 5 + SALT_LEN + NONCE_LEN || raw[..4] != MAGIC {
            return Err(ServerError::DecryptFailed);
        }
        let algorithm = Algorithm::from_byte(raw[4]).ok_or(ServerError::DecryptFailed)?;
        let salt = &raw[5..5 + SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&raw[5 + SALT_LEN..5 + SALT_LEN + NONCE_LEN]);
        let ct = &raw[5 + SALT_LEN + NONCE_LEN..];

        let kek = derive_key(passphrase, salt)?;
        let key = aead_decrypt(algorithm, kek.as_slice(), &nonce, ct, MASTER_KEY_AAD)?;
        Ok(MasterKey {
            algorithm,
            key: SecretBytes::new(key),
        })
    }

    /// Writes the key file atomically; used on first run and as the last
    /// step of a key-format conversion.
    pub fn save(&self, path: &Path, passphrase: &str) -> ServerResult<()> {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let kek = derive_key(passphrase, &salt)?;
        let ct = aead_encrypt(
            self.algorithm,
            kek.as_slice(),
            &nonce,
            self.key.as_slice(),
            MASTER_KEY_AAD,
        );

        let mut out = Vec::with_capacity(5 + SALT_LEN + NONCE_LEN + ct.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.algorithm.byte());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);

        let tmp = path.with_extension("tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                f.set_permissions(std::fs::Permissions::from_mode(0o600))?;
            }
            f.write_all(&out)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Encrypts a small opaque value (per-user wrapped keys and the like).
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let ct = aead_encrypt(
            self.algorithm,
            self.key.as_slice(),
            &nonce,
            plaintext,
            WRAPPED_VALUE_AAD,
        );
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        out
    }

    pub fn decrypt(&self, blob: &[u8]) -> ServerResult<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(ServerError::DecryptFailed);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&blob[..NONCE_LEN]);
        aead_decrypt(
            self.algorithm,
            self.key.as_slice(),
            &nonce,
            &blob[NONCE_LEN..],
            WRAPPED_VALUE_AAD,
        )
    }

    pub fn new_data_key(&self) -> DataKey {
        DataKey {
            algorithm: self.algorithm,
            key: SecretBytes::random(KEY_LEN),
        }
    }

    pub fn wrap_data_key(&self, key: &DataKey) -> Vec<u8> {
        self.encrypt(key.key.as_slice())
    }

    pub fn unwrap_data_key(&self, wrapped: &[u8], algorithm: Algorithm) -> ServerResult<DataKey> {
        let key = self.decrypt(wrapped)?;
        if key.len() != KEY_LEN {
            return Err(ServerError::DecryptFailed);
        }
        Ok(DataKey {
            algorithm,
            key: SecretBytes::new(key),
        })
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> ServerResult<SecretBytes> {
    let config = argon2::Config {
        variant: argon2::Variant::Argon2id,
        hash_length: KEY_LEN as u32,
        mem_cost: 65536,
        time_cost: 3,
        ..argon2::Config::default()
    };
    let key = argon2::hash_raw(passphrase.as_bytes(), salt, &config)?;
    Ok(SecretBytes::new(key))
}
