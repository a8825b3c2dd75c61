//! WebAuthn registration and assertion verification.
//!
//! Attestation is parsed but deliberately not validated: every format,
//! `none` and self-attestation included, yields a usable credential.
//! Supported credential algorithms are ES256 and RS256, read from the
//! COSE key carried in the authenticator data. Sign-counter regressions
//! are logged, never fatal; a cloned-authenticator heuristic is not worth
//! locking users out over.

use crate::error::{ServerError, ServerResult};
use ciborium::value::Value;
use rand::RngCore;
use ring::signature;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::warn;

pub const CHALLENGE_TTL_MS: i64 = 5 * 60 * 1000;
pub const MAX_CHALLENGES: usize = 16;
/// A fresh MFA success lets the same session skip re-prompts briefly.
pub const GRACE_WINDOW_MS: i64 = 5 * 60 * 1000;

pub const ALG_ES256: i64 = -7;
pub const ALG_RS256: i64 = -257;

const FLAG_UP: u8 = 0x01;
const FLAG_UV: u8 = 0x04;
const FLAG_BE: u8 = 0x08;
const FLAG_BS: u8 = 0x10;
const FLAG_AT: u8 = 0x40;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Challenge {
    pub value: String,
    pub expires: i64,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Credential {
    pub credential_id: String,
    /// Raw COSE key bytes as delivered by the authenticator.
    pub public_key: Vec<u8>,
    pub alg: i64,
    pub rp_id_hash: Vec<u8>,
    pub sign_count: u32,
    pub transports: Vec<String>,
    pub discoverable: bool,
    pub backup_eligible: bool,
    pub backup_state: bool,
    pub date_created: i64,
    pub last_seen: i64,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Default, Debug)]
pub struct WebauthnConfig {
    /// The user handle authenticators return at assertion time; it must
    /// match or the assertion is rejected.
    pub user_handle: Vec<u8>,
    pub challenges: Vec<Challenge>,
    pub credentials: Vec<Credential>,
    /// token hash → time of the last accepted MFA for that session.
    pub last_auth_times: HashMap<String, i64>,
}

impl WebauthnConfig {
    pub fn ensure_user_handle(&mut self) {
        if self.user_handle.is_empty() {
            let mut handle = vec![0u8; 16];
            rand::thread_rng().fill_bytes(&mut handle);
            self.user_handle = handle;
        }
    }

    /// Mints a challenge into the bounded set.
    pub fn new_challenge(&mut self, now: i64) -> String {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let value = base64::encode_config(raw, base64::URL_SAFE_NO_PAD);

        self.challenges.retain(|c| c.expires > now);
        while self.challenges.len() >= MAX_CHALLENGES {
            self.challenges.remove(0);
        }
        self.challenges.push(Challenge {
            value: value.clone(),
            expires: now + CHALLENGE_TTL_MS,
        });
        value
    }

    /// Consumes a challenge on first use.
    pub fn take_challenge(&mut self, value: &str, now: i64) -> bool {
        let before = self.challenges.len();
        self.challenges
            .retain(|c| !(c.value == value && c.expires > now));
        let taken = self.challenges.len() != before;
        self.challenges.retain(|c| c.expires > now);
        taken
    }

    pub fn in_grace_window(&self, token_hash: &str, now: i64) -> bool {
        self.last_auth_times
            .get(token_hash)
            .map(|&t| now - t < GRACE_WINDOW_MS)
            .unwrap_or(false)
    }

    pub fn record_auth(&mut self, token_hash: &str, now: i64) {
        self.last_auth_times
            .retain(|_, &mut t| now - t < GRACE_WINDOW_MS);
        self.last_auth_times.insert(token_hash.to_string(), now);
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct RegistrationParams {
    #[serde(rename = "attestationObject")]
    pub attestation_object: String,
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    #[serde(default)]
    pub transports: Vec<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub discoverable: bool,
}

#[derive(Deserialize, Clone, Debug)]
pub struct AssertionParams {
    #[serde(rename = "credentialId")]
    pub credential_id: String,
    #[serde(rename = "authenticatorData")]
    pub authenticator_data: String,
    #[serde(rename = "clientDataJSON")]
    pub client_data_json: String,
    pub signature: String,
    #[serde(rename = "userHandle", default)]
    pub user_handle: String,
}

/// Options for `navigator.credentials.create`. Passkey mode requests a
/// discoverable credential and mandatory user verification.
pub fn creation_options(
    cfg: &mut WebauthnConfig,
    rp_id: &str,
    email: &str,
    passkey: bool,
    now: i64,
) -> serde_json::Value {
    cfg.ensure_user_handle();
    let challenge = cfg.new_challenge(now);
    json!({
        "challenge": challenge,
        "rp": { "id": rp_id, "name": rp_id },
        "user": {
            "id": base64::encode_config(&cfg.user_handle, base64::URL_SAFE_NO_PAD),
            "name": email,
            "displayName": email,
        },
        "pubKeyCredParams": [
            { "type": "public-key", "alg": ALG_ES256 },
            { "type": "public-key", "alg": ALG_RS256 },
        ],
        "authenticatorSelection": {
            "residentKey": if passkey { "required" } else { "discouraged" },
            "userVerification": if passkey { "required" } else { "preferred" },
        },
        "attestation": "none",
        "timeout": CHALLENGE_TTL_MS,
    })
}

/// Options for `navigator.credentials.get`, sent in the `mfa` part of a
/// challenge response.
pub fn assertion_options(cfg: &mut WebauthnConfig, rp_id: &str, now: i64) -> serde_json::Value {
    let challenge = cfg.new_challenge(now);
    let allow: Vec<serde_json::Value> = cfg
        .credentials
        .iter()
        .filter(|c| !c.discoverable)
        .map(|c| {
            json!({
                "type": "public-key",
                "id": c.credential_id,
                "transports": c.transports,
            })
        })
        .collect();
    let passkeys_only = cfg.credentials.iter().all(|c| c.discoverable);
    json!({
        "challenge": challenge,
        "rpId": rp_id,
        "allowCredentials": allow,
        "userVerification": if passkeys_only { "required" } else { "preferred" },
        "timeout": CHALLENGE_TTL_MS,
    })
}

struct ClientData {
    kind: String,
    challenge: String,
}

fn parse_client_data(b64: &str) -> ServerResult<(Vec<u8>, ClientData)> {
    let raw = base64::decode_config(b64, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode(b64))
        .map_err(|_| ServerError::BadRequest)?;
    let parsed: serde_json::Value = serde_json::from_slice(&raw)?;
    let kind = parsed["type"].as_str().unwrap_or_default().to_string();
    let challenge = parsed["challenge"].as_str().unwrap_or_default().to_string();
    Ok((raw, ClientData { kind, challenge }))
}

struct AuthData {
    rp_id_hash: Vec<u8>,
    flags: u8,
    sign_count: u32,
    credential_id: Option<Vec<u8>>,
    cose_key: Option<Vec<u8>>,
}

fn parse_auth_data(raw: &[u8]) -> ServerResult<AuthData> {
    if raw.len() < 37 {
        return Err(ServerError::BadRequest);
    }
    let rp_id_hash = raw[..32].to_vec();
    let flags = raw[32];
    let sign_count = u32::from_be_bytes(raw[33..37].try_into().unwrap());

    let mut credential_id = None;
    let mut cose_key = None;
    if flags & FLAG_AT != 0 {
        if raw.len() < 55 {
            return Err(ServerError::BadRequest);
        }
        let id_len = u16::from_be_bytes(raw[53..55].try_into().unwrap()) as usize;
        if raw.len() < 55 + id_len {
            return Err(ServerError::BadRequest);
        }
        credential_id = Some(raw[55..55 + id_len].to_vec());
        cose_key = Some(raw[55 + id_len..].to_vec());
    }

    Ok(AuthData {
        rp_id_hash,
        flags,
        sign_count,
        credential_id,
        cose_key,
    })
}

fn cbor_get<'a>(map: &'a [(Value, Value)], key: i128) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Integer(i) if i128::from(*i) == key => Some(v),
        _ => None,
    })
}

fn cbor_get_text<'a>(map: &'a [(Value, Value)], key: &str) -> Option<&'a Value> {
    map.iter().find_map(|(k, v)| match k {
        Value::Text(t) if t == key => Some(v),
        _ => None,
    })
}

fn cbor_bytes(v: &Value) -> ServerResult<Vec<u8>> {
    match v {
        Value::Bytes(b) => Ok(b.clone()),
        _ => Err(ServerError::BadRequest),
    }
}

/// The COSE algorithm identifier of a key, without trusting anything else
/// in it yet.
fn cose_alg(cose: &[u8]) -> ServerResult<i64> {
    let value: Value =
        ciborium::de::from_reader(cose).map_err(|_| ServerError::BadRequest)?;
    let map = match value {
        Value::Map(m) => m,
        _ => return Err(ServerError::BadRequest),
    };
    match cbor_get(&map, 3) {
        Some(Value::Integer(alg)) => Ok(i128::from(*alg) as i64),
        _ => Err(ServerError::BadRequest),
    }
}

/// Verifies `signature` over `message` with a COSE-encoded public key.
fn verify_cose_signature(cose: &[u8], message: &[u8], sig: &[u8]) -> ServerResult<()> {
    let value: Value =
        ciborium::de::from_reader(cose).map_err(|_| ServerError::BadRequest)?;
    let map = match value {
        Value::Map(m) => m,
        _ => return Err(ServerError::BadRequest),
    };
    let alg = match cbor_get(&map, 3) {
        Some(Value::Integer(alg)) => i128::from(*alg) as i64,
        _ => return Err(ServerError::BadRequest),
    };

    match alg {
        ALG_ES256 => {
            let x = cbor_bytes(cbor_get(&map, -2).ok_or(ServerError::BadRequest)?)?;
            let y = cbor_bytes(cbor_get(&map, -3).ok_or(ServerError::BadRequest)?)?;
            if x.len() != 32 || y.len() != 32 {
                return Err(ServerError::BadRequest);
            }
            let mut point = Vec::with_capacity(65);
            point.push(0x04);
            point.extend_from_slice(&x);
            point.extend_from_slice(&y);
            signature::UnparsedPublicKey::new(&signature::ECDSA_P256_SHA256_ASN1, &point)
                .verify(message, sig)
                .map_err(|_| ServerError::InvalidCredentials)
        }
        ALG_RS256 => {
            let n = cbor_bytes(cbor_get(&map, -1).ok_or(ServerError::BadRequest)?)?;
            let e = cbor_bytes(cbor_get(&map, -2).ok_or(ServerError::BadRequest)?)?;
            let der = rsa_public_key_der(&n, &e);
            signature::UnparsedPublicKey::new(&signature::RSA_PKCS1_2048_8192_SHA256, &der)
                .verify(message, sig)
                .map_err(|_| ServerError::InvalidCredentials)
        }
        _ => Err(ServerError::BadRequest),
    }
}

fn der_len(len: usize) -> Vec<u8> {
    if len < 128 {
        vec![len as u8]
    } else if len < 256 {
        vec![0x81, len as u8]
    } else {
        vec![0x82, (len >> 8) as u8, len as u8]
    }
}

fn der_uint(bytes: &[u8]) -> Vec<u8> {
    let mut start = 0;
    while start < bytes.len() - 1 && bytes[start] == 0 {
        start += 1;
    }
    let body = &bytes[start..];
    let pad = body[0] & 0x80 != 0;
    let mut out = vec![0x02];
    out.extend_from_slice(&der_len(body.len() + pad as usize));
    if pad {
        out.push(0);
    }
    out.extend_from_slice(body);
    out
}

/// RFC 8017 `RSAPublicKey ::= SEQUENCE { modulus, publicExponent }`.
fn rsa_public_key_der(n: &[u8], e: &[u8]) -> Vec<u8> {
    let mut body = der_uint(n);
    body.extend_from_slice(&der_uint(e));
    let mut out = vec![0x30];
    out.extend_from_slice(&der_len(body.len()));
    out.extend_from_slice(&body);
    out
}

/// Checks a `create` response and adds the credential. Any attestation
/// format is accepted; only the authenticator data matters.
pub fn verify_registration(
    cfg: &mut WebauthnConfig,
    rp_id: &str,
    params: &RegistrationParams,
    now: i64,
) -> ServerResult<()> {
    let (_, client_data) = parse_client_data(&params.client_data_json)?;
    if client_data.kind != "webauthn.create" {
        return Err(ServerError::BadRequest);
    }
    if !cfg.take_challenge(&client_data.challenge, now) {
        return Err(ServerError::InvalidCredentials);
    }

    let attestation = base64::decode_config(&params.attestation_object, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode(&params.attestation_object))
        .map_err(|_| ServerError::BadRequest)?;
    let value: Value =
        ciborium::de::from_reader(attestation.as_slice()).map_err(|_| ServerError::BadRequest)?;
    let map = match value {
        Value::Map(m) => m,
        _ => return Err(ServerError::BadRequest),
    };
    let auth_data_raw = cbor_bytes(cbor_get_text(&map, "authData").ok_or(ServerError::BadRequest)?)?;
    let auth_data = parse_auth_data(&auth_data_raw)?;

    if auth_data.rp_id_hash != Sha256::digest(rp_id.as_bytes()).as_slice() {
        return Err(ServerError::InvalidCredentials);
    }
    if auth_data.flags & FLAG_UP == 0 {
        return Err(ServerError::InvalidCredentials);
    }
    let discoverable = params.discoverable;
    if discoverable && auth_data.flags & FLAG_UV == 0 {
        return Err(ServerError::InvalidCredentials);
    }

    let credential_id = auth_data.credential_id.ok_or(ServerError::BadRequest)?;
    let cose_key = auth_data.cose_key.ok_or(ServerError::BadRequest)?;
    let alg = cose_alg(&cose_key)?;
    if alg != ALG_ES256 && alg != ALG_RS256 {
        return Err(ServerError::BadRequest);
    }

    let credential_id = base64::encode_config(credential_id, base64::URL_SAFE_NO_PAD);
    cfg.credentials.retain(|c| c.credential_id != credential_id);
    cfg.ensure_user_handle();
    cfg.credentials.push(Credential {
        credential_id,
        public_key: cose_key,
        alg,
        rp_id_hash: auth_data.rp_id_hash,
        sign_count: auth_data.sign_count,
        transports: params.transports.clone(),
        discoverable,
        backup_eligible: auth_data.flags & FLAG_BE != 0,
        backup_state: auth_data.flags & FLAG_BS != 0,
        date_created: now,
        last_seen: now,
        name: params.name.clone(),
    });
    Ok(())
}

/// Checks a `get` response against a stored credential.
pub fn verify_assertion(
    cfg: &mut WebauthnConfig,
    rp_id: &str,
    params: &AssertionParams,
    now: i64,
) -> ServerResult<()> {
    let (client_data_raw, client_data) = parse_client_data(&params.client_data_json)?;
    if client_data.kind != "webauthn.get" {
        return Err(ServerError::BadRequest);
    }
    if !cfg.take_challenge(&client_data.challenge, now) {
        return Err(ServerError::InvalidCredentials);
    }

    let auth_data_raw = base64::decode_config(&params.authenticator_data, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode(&params.authenticator_data))
        .map_err(|_| ServerError::BadRequest)?;
    let auth_data = parse_auth_data(&auth_data_raw)?;
    if auth_data.rp_id_hash != Sha256::digest(rp_id.as_bytes()).as_slice() {
        return Err(ServerError::InvalidCredentials);
    }
    if auth_data.flags & FLAG_UP == 0 {
        return Err(ServerError::InvalidCredentials);
    }

    let (discoverable, public_key) = {
        let cred = cfg
            .credentials
            .iter()
            .find(|c| c.credential_id == params.credential_id)
            .ok_or(ServerError::InvalidCredentials)?;
        (cred.discoverable, cred.public_key.clone())
    };

    if discoverable {
        if auth_data.flags & FLAG_UV == 0 {
            return Err(ServerError::InvalidCredentials);
        }
        let handle = base64::decode_config(&params.user_handle, base64::URL_SAFE_NO_PAD)
            .map_err(|_| ServerError::InvalidCredentials)?;
        if handle != cfg.user_handle {
            return Err(ServerError::InvalidCredentials);
        }
    }

    let sig = base64::decode_config(&params.signature, base64::URL_SAFE_NO_PAD)
        .or_else(|_| base64::decode(&params.signature))
        .map_err(|_| ServerError::BadRequest)?;
    let mut message = auth_data_raw.clone();
    message.extend_from_slice(&Sha256::digest(&client_data_raw));
    verify_cose_signature(&public_key, &message, &sig)?;

    let cred = cfg
        .credentials
        .iter_mut()
        .find(|c| c.credential_id == params.credential_id)
        .ok_or(ServerError::InvalidCredentials)?;

    if auth_data.sign_count > 0 && auth_data.sign_count <= cred.sign_count {
        warn!(
            credential = %cred.credential_id,
            stored = cred.sign_count,
            presented = auth_data.sign_count,
            "sign counter did not advance",
        );
    } else {
        cred.sign_count = auth_data.sign_count.max(cred.sign_count);
    }
    cred.last_seen = now;
    Ok(())
}
