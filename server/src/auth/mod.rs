//! Account lifecycle, login, sessions and MFA.
//!
//! Login is two-phase: `preLogin` hands out the salt (a deterministic
//! fake for unknown emails), `login` verifies the bcrypt hash and gates
//! on MFA. Decoy accounts are a deliberate deception feature: a password
//! matching a decoy, directly or after a primary-side MFA failure, yields
//! a session on the decoy.

pub mod otp;
pub mod remote;
pub mod token;
pub mod webauthn;

use crate::crypto::envelope;
use crate::db::user::NewUser;
use crate::db::{Db, UserRecord};
use crate::error::{ServerError, ServerResult};
use lru::LruCache;
use rand::Rng;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

const CACHE_SIZE: usize = 1024;
const BCRYPT_COST: u32 = 12;

/// Random 0–200 ms pause on every authentication path, masking timing
/// differences between the branches.
pub async fn auth_delay() {
    let ms = rand::thread_rng().gen_range(0..200u64);
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// Extra inputs a login request may carry for the MFA gate.
#[derive(Default)]
pub struct MfaInput {
    pub webauthn: Option<webauthn::AssertionParams>,
    /// From the capabilities header; without it the fallback is remote
    /// MFA.
    pub has_mfa_capability: bool,
}

/// Outcome of the synchronous part of a login. `NeedRemote` sends the
/// caller off to await a remote-MFA approval before minting anything.
#[derive(Debug)]
pub enum LoginStep {
    Session { user: UserRecord, token: String },
    MfaChallenge { options: Value },
    NeedRemote { user_id: u64 },
}

pub struct AuthService {
    db: Arc<Db>,
    pub remote: remote::RemoteMfa,
    prelogin_cache: Mutex<LruCache<String, String>>,
    checkkey_cache: Mutex<LruCache<String, Vec<u8>>>,
    allow_new_accounts: bool,
    auto_approve_new_accounts: bool,
}

impl AuthService {
    pub fn new(db: Arc<Db>, allow_new_accounts: bool, auto_approve_new_accounts: bool) -> AuthService {
        AuthService {
            db,
            remote: remote::RemoteMfa::new(),
            prelogin_cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap())),
            checkkey_cache: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_SIZE).unwrap())),
            allow_new_accounts,
            auto_approve_new_accounts,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    fn decode_key_bundle(bundle: &str) -> ServerResult<(Vec<u8>, bool)> {
        let raw = base64::decode(bundle).map_err(|_| ServerError::BadRequest)?;
        if raw.len() < envelope::PUBLIC_KEY_LEN {
            return Err(ServerError::BadRequest);
        }
        let public_key = raw[..envelope::PUBLIC_KEY_LEN].to_vec();
        let is_backup = raw.len() > envelope::PUBLIC_KEY_LEN;
        Ok((public_key, is_backup))
    }

    pub fn create_account(&self, p: &wire::CreateAccountParams) -> ServerResult<UserRecord> {
        if !self.allow_new_accounts {
            return Err(ServerError::NotAuthorized);
        }
        let (public_key, is_backup) = Self::decode_key_bundle(&p.key_bundle)?;
        let hashed_password = bcrypt::hash(p.password.as_ref(), BCRYPT_COST)?;
        self.db.add_user(NewUser {
            email: p.email.to_string(),
            hashed_password,
            salt: p.salt.to_string(),
            key_bundle: p.key_bundle.to_string(),
            public_key,
            is_backup,
            need_approval: !self.auto_approve_new_accounts,
        })
    }

    /// The salt for a known account, or a stable per-email fake so the
    /// response does not reveal whether the account exists. Callers pair
    /// this with `auth_delay`.
    pub fn pre_login(&self, email: &str) -> ServerResult<String> {
        if let Some(user) = self.db.user_by_email(email)? {
            if !user.login_disabled {
                return Ok(user.salt);
            }
        }
        let mut cache = self.prelogin_cache.lock().unwrap();
        if let Some(salt) = cache.get(email) {
            return Ok(salt.clone());
        }
        let fake: String = {
            let raw: [u8; 16] = rand::thread_rng().gen();
            raw.iter().map(|b| format!("{:02x}", b)).collect()
        };
        cache.put(email.to_string(), fake.clone());
        Ok(fake)
    }

    /// The blocking half of a login. A remote-MFA fallback is signalled
    /// to the caller, which awaits the approval and then calls
    /// `mint_session` (or `decoy_fallback` on denial).
    pub fn login_begin(
        &self,
        email_field: &str,
        password: &str,
        mfa: &MfaInput,
        rp_id: &str,
    ) -> ServerResult<LoginStep> {
        // An OTP may ride inline as `code%email`.
        let (inline_code, email) = match email_field.split_once('%') {
            Some((code, email)) => (Some(code), email),
            None => (None, email_field),
        };

        let user = match self.db.user_by_email(email)? {
            Some(u) => u,
            None => return Err(ServerError::InvalidCredentials),
        };

        if user.login_disabled || !bcrypt::verify(password, &user.hashed_password)? {
            return self.decoy_step(&user, password);
        }

        if user.require_mfa {
            let now = self.db.now_ms();

            if let Some(code) = inline_code {
                if !otp::validate(&user.otp_key, code, now / 1000) {
                    return self.decoy_step(&user, password);
                }
            } else if let Some(ref assertion) = mfa.webauthn {
                let rp = rp_id.to_string();
                let assertion = assertion.clone();
                let verified = self.db.mutate_user(user.user_id, move |u| {
                    webauthn::verify_assertion(&mut u.webauthn, &rp, &assertion, now)
                });
                if verified.is_err() {
                    return self.decoy_step(&user, password);
                }
            } else if mfa.has_mfa_capability && !user.webauthn.credentials.is_empty() {
                let rp = rp_id.to_string();
                let mut options = Value::Null;
                self.db.mutate_user(user.user_id, |u| {
                    options = webauthn::assertion_options(&mut u.webauthn, &rp, now);
                    Ok(())
                })?;
                return Ok(LoginStep::MfaChallenge { options });
            } else {
                info!(user = user.user_id, "waiting for remote MFA approval");
                return Ok(LoginStep::NeedRemote {
                    user_id: user.user_id,
                });
            }
        }

        let (user, token) = self.mint_session(user.user_id)?;
        Ok(LoginStep::Session { user, token })
    }

    /// A password matching one of the user's decoys logs into the decoy;
    /// the remote-MFA denial path funnels back in here by email.
    pub fn decoy_fallback(&self, email_field: &str, password: &str) -> ServerResult<LoginStep> {
        let email = email_field
            .split_once('%')
            .map(|(_, e)| e)
            .unwrap_or(email_field);
        let user = self
            .db
            .user_by_email(email)?
            .ok_or(ServerError::InvalidCredentials)?;
        self.decoy_step(&user, password)
    }

    fn decoy_step(&self, primary: &UserRecord, password: &str) -> ServerResult<LoginStep> {
        for decoy in &primary.decoys {
            let shadow = match self.db.user_by_id(decoy.user_id)? {
                Some(u) => u,
                None => continue,
            };
            if bcrypt::verify(password, &shadow.hashed_password)? {
                let (user, token) = self.mint_session(shadow.user_id)?;
                return Ok(LoginStep::Session { user, token });
            }
        }
        Err(ServerError::InvalidCredentials)
    }

    pub fn mint_session(&self, user_id: u64) -> ServerResult<(UserRecord, String)> {
        let now = self.db.now_ms();
        let master = self.db.master();
        let mut minted = String::new();
        let user = self.db.mutate_user(user_id, |user| {
            let key = user.unwrapped_token_key(master)?;
            minted = token::mint(&key, &token::Token::session(user_id, now));
            user.valid_tokens.insert(token::hash(&minted));
            Ok(())
        })?;
        Ok((user, minted))
    }

    /// Resolves a session token into its user. The token must decrypt
    /// under the user's token key, be in scope and date, and its hash must
    /// still be listed on the account.
    pub fn check_session(&self, token_str: &str) -> ServerResult<UserRecord> {
        let subject = token::subject_hint(token_str).ok_or(ServerError::InvalidCredentials)?;
        let user = self
            .db
            .user_by_id(subject)?
            .ok_or(ServerError::InvalidCredentials)?;
        let key = user.unwrapped_token_key(self.db.master())?;
        token::check(&key, token_str, wire::SCOPE_SESSION, self.db.now_ms())?;
        if !user.valid_tokens.contains(&token::hash(token_str)) {
            return Err(ServerError::InvalidCredentials);
        }
        Ok(user)
    }

    pub fn check_download(&self, token_str: &str) -> ServerResult<(UserRecord, token::Token)> {
        let subject = token::subject_hint(token_str).ok_or(ServerError::InvalidCredentials)?;
        let user = self
            .db
            .user_by_id(subject)?
            .ok_or(ServerError::InvalidCredentials)?;
        let key = user.unwrapped_token_key(self.db.master())?;
        let parsed = token::check(&key, token_str, wire::SCOPE_DOWNLOAD, self.db.now_ms())?;
        Ok((user, parsed))
    }

    /// Revokes exactly the presented token.
    pub fn logout(&self, user_id: u64, token_str: &str) -> ServerResult<()> {
        let hash = token::hash(token_str);
        self.db.mutate_user(user_id, |user| {
            user.valid_tokens.remove(&hash);
            Ok(())
        })?;
        Ok(())
    }

    /// Rotates the password, the token key, and collapses the valid token
    /// set to the single newly minted session.
    pub fn change_password(
        &self,
        user_id: u64,
        new_password: &str,
        new_salt: &str,
        key_bundle: &str,
    ) -> ServerResult<String> {
        let (public_key, is_backup) = Self::decode_key_bundle(key_bundle)?;
        let hashed = bcrypt::hash(new_password, BCRYPT_COST)?;
        let now = self.db.now_ms();
        let master = self.db.master();

        let mut minted = String::new();
        self.db.mutate_user(user_id, |user| {
            let new_key = crate::crypto::SecretBytes::random(32);
            minted = token::mint(&new_key, &token::Token::session(user_id, now));

            user.hashed_password = hashed.clone();
            user.salt = new_salt.to_string();
            user.key_bundle = key_bundle.to_string();
            user.public_key = public_key.clone();
            user.is_backup = is_backup;
            user.token_key = master.encrypt(new_key.as_slice());
            user.valid_tokens = [token::hash(&minted)].into_iter().collect();
            Ok(())
        })?;
        Ok(minted)
    }

    pub fn reupload_keys(&self, user_id: u64, key_bundle: &str) -> ServerResult<()> {
        let (public_key, is_backup) = Self::decode_key_bundle(key_bundle)?;
        self.db.mutate_user(user_id, |user| {
            user.key_bundle = key_bundle.to_string();
            user.public_key = public_key.clone();
            user.is_backup = is_backup;
            Ok(())
        })?;
        Ok(())
    }

    /// Account-recovery challenge: a random secret sealed to the user's
    /// public key. Unknown emails get an unopenable decoy challenge.
    /// Callers pair this with `auth_delay`.
    pub fn check_key(&self, email: &str) -> ServerResult<String> {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill(&mut secret[..]);

        let challenge = match self.db.user_by_email(email)? {
            Some(user) if user.public_key.len() == envelope::PUBLIC_KEY_LEN => {
                self.checkkey_cache
                    .lock()
                    .unwrap()
                    .put(email.to_string(), secret.clone());
                let pk: [u8; envelope::PUBLIC_KEY_LEN] =
                    user.public_key.as_slice().try_into().unwrap();
                envelope::seal(&secret, &pk)
            }
            _ => {
                let throwaway = envelope::KeyPair::generate();
                envelope::seal(&secret, throwaway.public())
            }
        };
        Ok(base64::encode(challenge))
    }

    /// Proof is the decrypted challenge secret; a match resets the
    /// password exactly like a password change. Callers pair this with
    /// `auth_delay`.
    pub fn recover_account(
        &self,
        email: &str,
        proof: &str,
        new_password: &str,
        new_salt: &str,
        key_bundle: &str,
    ) -> ServerResult<String> {
        let proof = base64::decode(proof).map_err(|_| ServerError::InvalidCredentials)?;
        let expected = self
            .checkkey_cache
            .lock()
            .unwrap()
            .pop(email)
            .ok_or(ServerError::InvalidCredentials)?;
        if !otp::constant_time_eq(&proof, &expected) {
            return Err(ServerError::InvalidCredentials);
        }
        let user = self
            .db
            .user_by_email(email)?
            .ok_or(ServerError::InvalidCredentials)?;
        self.change_password(user.user_id, new_password, new_salt, key_bundle)
    }

    // OTP.

    pub fn generate_otp(&self, email: &str, host: &str) -> ServerResult<(String, Vec<u8>)> {
        let secret = otp::new_secret();
        let url = otp::otpauth_url(&secret, email, host);
        let png = otp::qr_png(&url)?;
        Ok((secret, png))
    }

    /// Stores the OTP key only when the presented code validates against
    /// it, so a mistyped secret cannot lock the account. An empty key
    /// disenrolls, unless it would strip the last factor of an
    /// MFA-required account.
    pub fn set_otp(&self, user_id: u64, key: &str, code: &str) -> ServerResult<()> {
        let now_s = self.db.now_ms() / 1000;
        self.db.mutate_user(user_id, |user| {
            if key.is_empty() {
                if user.require_mfa && user.webauthn.credentials.is_empty() {
                    return Err(ServerError::Denied(
                        "MFA is required; register another factor first",
                    ));
                }
                user.otp_key.clear();
                return Ok(());
            }
            if !otp::validate(key, code, now_s) {
                return Err(ServerError::InvalidCredentials);
            }
            user.otp_key = key.to_string();
            Ok(())
        })?;
        Ok(())
    }

    /// Enables or disables the MFA requirement. Enabling needs at least
    /// one registered factor.
    pub fn set_require_mfa(&self, user_id: u64, enable: bool) -> ServerResult<()> {
        self.db.mutate_user(user_id, |user| {
            if enable && !user.has_mfa_factor() {
                return Err(ServerError::Denied(
                    "register an OTP or security key first",
                ));
            }
            user.require_mfa = enable;
            Ok(())
        })?;
        Ok(())
    }

    /// Gate for sensitive operations of MFA-required accounts. A recent
    /// success within the grace window passes; otherwise a factor must
    /// accompany the request or the caller gets a challenge back.
    pub fn require_recent_mfa(
        &self,
        user: &UserRecord,
        token_hash: &str,
        otp_code: Option<&str>,
        assertion: Option<&webauthn::AssertionParams>,
        rp_id: &str,
    ) -> ServerResult<()> {
        if !user.require_mfa {
            return Ok(());
        }
        let now = self.db.now_ms();
        if user.webauthn.in_grace_window(token_hash, now) {
            return Ok(());
        }

        if let Some(code) = otp_code {
            if otp::validate(&user.otp_key, code, now / 1000) {
                let hash = token_hash.to_string();
                self.db.mutate_user(user.user_id, |u| {
                    u.webauthn.record_auth(&hash, now);
                    Ok(())
                })?;
                return Ok(());
            }
            return Err(ServerError::InvalidCredentials);
        }

        if let Some(assertion) = assertion {
            let rp_id = rp_id.to_string();
            let assertion = assertion.clone();
            let hash = token_hash.to_string();
            self.db.mutate_user(user.user_id, move |u| {
                webauthn::verify_assertion(&mut u.webauthn, &rp_id, &assertion, now)?;
                u.webauthn.record_auth(&hash, now);
                Ok(())
            })?;
            return Ok(());
        }

        let mut options = Value::Null;
        let rp_id = rp_id.to_string();
        self.db.mutate_user(user.user_id, |u| {
            options = webauthn::assertion_options(&mut u.webauthn, &rp_id, now);
            Ok(())
        })?;
        Err(ServerError::MfaRequired(options))
    }

    // WebAuthn credential management.

    pub fn webauthn_register_begin(
        &self,
        user_id: u64,
        rp_id: &str,
        passkey: bool,
    ) -> ServerResult<Value> {
        let now = self.db.now_ms();
        let mut options = Value::Null;
        let rp_id = rp_id.to_string();
        self.db.mutate_user(user_id, |user| {
            let email = user.email.clone();
            options = webauthn::creation_options(&mut user.webauthn, &rp_id, &email, passkey, now);
            Ok(())
        })?;
        Ok(options)
    }

    pub fn webauthn_register_finish(
        &self,
        user_id: u64,
        rp_id: &str,
        params: &webauthn::RegistrationParams,
    ) -> ServerResult<()> {
        let now = self.db.now_ms();
        let rp_id = rp_id.to_string();
        let params = params.clone();
        self.db.mutate_user(user_id, move |user| {
            webauthn::verify_registration(&mut user.webauthn, &rp_id, &params, now)
        })?;
        Ok(())
    }

    pub fn webauthn_keys(&self, user: &UserRecord) -> Vec<Value> {
        user.webauthn
            .credentials
            .iter()
            .map(|c| {
                serde_json::json!({
                    "id": c.credential_id,
                    "name": c.name,
                    "alg": c.alg,
                    "discoverable": c.discoverable,
                    "backupEligible": c.backup_eligible,
                    "backupState": c.backup_state,
                    "transports": c.transports,
                    "dateCreated": c.date_created,
                    "lastSeen": c.last_seen,
                })
            })
            .collect()
    }

    pub fn webauthn_update_keys(
        &self,
        user_id: u64,
        remove: &[String],
        rename: &[(String, String)],
    ) -> ServerResult<()> {
        self.db.mutate_user(user_id, |user| {
            let remaining = user
                .webauthn
                .credentials
                .iter()
                .filter(|c| !remove.contains(&c.credential_id))
                .count();
            if user.require_mfa && remaining == 0 && user.otp_key.is_empty() {
                return Err(ServerError::Denied(
                    "MFA is required; register another factor first",
                ));
            }
            user.webauthn
                .credentials
                .retain(|c| !remove.contains(&c.credential_id));
            for (id, name) in rename {
                if let Some(c) = user
                    .webauthn
                    .credentials
                    .iter_mut()
                    .find(|c| &c.credential_id == id)
                {
                    c.name = name.clone();
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    pub fn push_subscribe(
        &self,
        user_id: u64,
        endpoint: &str,
        auth: &str,
        p256dh: &str,
    ) -> ServerResult<()> {
        let now = self.db.now_ms();
        self.db.mutate_user(user_id, |user| {
            user.push
                .endpoints
                .retain(|e| e.endpoint != endpoint);
            user.push.endpoints.push(crate::db::user::PushSubscription {
                endpoint: endpoint.to_string(),
                auth: auth.to_string(),
                p256dh: p256dh.to_string(),
                date_created: now,
            });
            Ok(())
        })?;
        Ok(())
    }
}
