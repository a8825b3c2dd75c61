//! The asymmetric envelope used between clients and the server. Each user
//! has a server-side x25519 key pair; clients seal request parameters to
//! its public half with an ephemeral key, HKDF-SHA256 and
//! ChaCha20-Poly1305.

use super::SecretBytes;
use crate::error::{ServerError, ServerResult};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const HKDF_INFO: &[u8] = b"krin-envelope-v1";

pub struct KeyPair {
    public: [u8; PUBLIC_KEY_LEN],
    secret: SecretBytes,
}

impl KeyPair {
    pub fn generate() -> KeyPair {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let public = PublicKey::from(&secret);
        KeyPair {
            public: public.to_bytes(),
            secret: SecretBytes::new(secret.to_bytes().to_vec()),
        }
    }

    pub fn from_secret(bytes: &[u8]) -> ServerResult<KeyPair> {
        let secret: [u8; SECRET_KEY_LEN] =
            bytes.try_into().map_err(|_| ServerError::DecryptFailed)?;
        let secret = StaticSecret::from(secret);
        let public = PublicKey::from(&secret);
        Ok(KeyPair {
            public: public.to_bytes(),
            secret: SecretBytes::new(secret.to_bytes().to_vec()),
        })
    }

    pub fn public(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.public
    }

    pub fn secret_bytes(&self) -> &[u8] {
        self.secret.as_slice()
    }
}

fn derive(shared: &[u8], eph_pk: &[u8], recipient_pk: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, shared);
    let mut info = Vec::with_capacity(HKDF_INFO.len() + 64);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(eph_pk);
    info.extend_from_slice(recipient_pk);
    let mut key = [0u8; 32];
    hk.expand(&info, &mut key).expect("hkdf expand");
    key
}

/// Output layout: ephemeral public key (32), nonce (12), ciphertext.
pub fn seal(plaintext: &[u8], recipient_pk: &[u8; PUBLIC_KEY_LEN]) -> Vec<u8> {
    let eph = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pk = PublicKey::from(&eph);
    let shared = eph.diffie_hellman(&PublicKey::from(*recipient_pk));
    let key = derive(shared.as_bytes(), eph_pk.as_bytes(), recipient_pk);

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("key length");
    let ct = cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &[],
            },
        )
        .expect("aead encrypt");

    let mut out = Vec::with_capacity(PUBLIC_KEY_LEN + NONCE_LEN + ct.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ct);
    out
}

pub fn open(blob: &[u8], recipient: &KeyPair) -> ServerResult<Vec<u8>> {
    if blob.len() < PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(ServerError::DecryptFailed);
    }
    let eph_pk: [u8; PUBLIC_KEY_LEN] = blob[..PUBLIC_KEY_LEN].try_into().unwrap();
    let nonce = &blob[PUBLIC_KEY_LEN..PUBLIC_KEY_LEN + NONCE_LEN];
    let ct = &blob[PUBLIC_KEY_LEN + NONCE_LEN..];

    let secret: [u8; SECRET_KEY_LEN] = recipient
        .secret_bytes()
        .try_into()
        .map_err(|_| ServerError::DecryptFailed)?;
    let shared = StaticSecret::from(secret).diffie_hellman(&PublicKey::from(eph_pk));
    let key = derive(shared.as_bytes(), &eph_pk, recipient.public());

    let cipher = ChaCha20Poly1305::new_from_slice(&key).expect("key length");
    cipher
        .decrypt(chacha20poly1305::Nonce::from_slice(nonce), Payload { msg: ct, aad: &[] })
        .map_err(|_| ServerError::DecryptFailed)
}
