//! Scoped tokens sealed under the per-user token key. The subject rides
//! in front of the ciphertext so the server can find the right key; the
//! AEAD binds it, so a swapped prefix fails authentication.

use crate::crypto::SecretBytes;
use crate::error::{ServerError, ServerResult};
use crate::storage::SecureStore;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};

pub const SESSION_LIFETIME_MS: i64 = 180 * 24 * 3600 * 1000;
pub const DOWNLOAD_LIFETIME_MS: i64 = 12 * 3600 * 1000;

const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct Token {
    pub scope: String,
    pub subject: u64,
    #[serde(default)]
    pub set: Option<String>,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub thumb: bool,
    pub exp: i64,
}

impl Token {
    pub fn session(subject: u64, now_ms: i64) -> Token {
        Token {
            scope: wire::SCOPE_SESSION.to_string(),
            subject,
            set: None,
            file: None,
            thumb: false,
            exp: now_ms + SESSION_LIFETIME_MS,
        }
    }

    pub fn download(subject: u64, set: &str, file: &str, thumb: bool, now_ms: i64) -> Token {
        Token {
            scope: wire::SCOPE_DOWNLOAD.to_string(),
            subject,
            set: Some(set.to_string()),
            file: Some(file.to_string()),
            thumb,
            exp: now_ms + DOWNLOAD_LIFETIME_MS,
        }
    }
}

pub fn mint(key: &SecretBytes, token: &Token) -> String {
    let plaintext = bincode::serialize(token).expect("token serialization");
    let subject = token.subject.to_be_bytes();

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice()).expect("key length");
    let ct = cipher
        .encrypt(
            chacha20poly1305::Nonce::from_slice(&nonce),
            Payload {
                msg: &plaintext,
                aad: &subject,
            },
        )
        .expect("aead encrypt");

    let mut raw = Vec::with_capacity(8 + NONCE_LEN + ct.len());
    raw.extend_from_slice(&subject);
    raw.extend_from_slice(&nonce);
    raw.extend_from_slice(&ct);
    base64::encode_config(raw, base64::URL_SAFE_NO_PAD)
}

/// The claimed subject, readable without the key; `check` verifies it.
pub fn subject_hint(token: &str) -> Option<u64> {
    let raw = base64::decode_config(token, base64::URL_SAFE_NO_PAD).ok()?;
    let bytes: [u8; 8] = raw.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

pub fn check(key: &SecretBytes, token: &str, scope: &str, now_ms: i64) -> ServerResult<Token> {
    let raw = base64::decode_config(token, base64::URL_SAFE_NO_PAD)
        .map_err(|_| ServerError::InvalidCredentials)?;
    if raw.len() < 8 + NONCE_LEN {
        return Err(ServerError::InvalidCredentials);
    }
    let subject = u64::from_be_bytes(raw[..8].try_into().unwrap());
    let nonce = &raw[8..8 + NONCE_LEN];
    let ct = &raw[8 + NONCE_LEN..];

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_slice()).expect("key length");
    let plaintext = cipher
        .decrypt(
            chacha20poly1305::Nonce::from_slice(nonce),
            Payload {
                msg: ct,
                aad: &raw[..8],
            },
        )
        .map_err(|_| ServerError::InvalidCredentials)?;

    let parsed: Token =
        bincode::deserialize(&plaintext).map_err(|_| ServerError::InvalidCredentials)?;
    if parsed.subject != subject || parsed.scope != scope || parsed.exp <= now_ms {
        return Err(ServerError::InvalidCredentials);
    }
    Ok(parsed)
}

/// The stable digest stored in `valid_tokens`.
pub fn hash(token: &str) -> String {
    SecureStore::hash_string(token)
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> SecretBytes {
        SecretBytes::random(32)
    }

    #[test]
    fn mint_check_round_trip() {
        let k = key();
        let t = Token::session(42, 1_000);
        let minted = mint(&k, &t);

        assert_eq!(subject_hint(&minted), Some(42));
        let parsed = check(&k, &minted, wire::SCOPE_SESSION, 2_000).unwrap();
        assert_eq!(parsed, t);
    }

    #[test]
    fn expired_token_rejected() {
        let k = key();
        let t = Token::session(1, 0);
        let minted = mint(&k, &t);
        assert!(check(&k, &minted, wire::SCOPE_SESSION, SESSION_LIFETIME_MS + 1).is_err());
    }

    #[test]
    fn scope_mismatch_rejected() {
        let k = key();
        let minted = mint(&k, &Token::download(1, "0", "f", false, 0));
        assert!(check(&k, &minted, wire::SCOPE_SESSION, 1).is_err());
        assert!(check(&k, &minted, wire::SCOPE_DOWNLOAD, 1).is_ok());
    }

    #[test]
    fn any_bit_flip_rejected() {
        let k = key();
        let minted = mint(&k, &Token::session(7, 0));
        let raw = base64::decode_config(&minted, base64::URL_SAFE_NO_PAD).unwrap();
        for i in 0..raw.len() {
            let mut bad = raw.clone();
            bad[i] ^= 1;
            let bad = base64::encode_config(bad, base64::URL_SAFE_NO_PAD);
            assert!(
                matches!(
                    check(&k, &bad, wire::SCOPE_SESSION, 1),
                    Err(ServerError::InvalidCredentials)
                ),
                "byte {}",
                i
            );
        }
    }

    #[test]
    fn wrong_key_rejected() {
        let minted = mint(&key(), &Token::session(7, 0));
        assert!(check(&key(), &minted, wire::SCOPE_SESSION, 1).is_err());
    }
}
