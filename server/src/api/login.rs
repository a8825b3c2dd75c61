use super::{
    decrypt_params, field, form_fields, has_mfa_capability, join, require_session, respond,
    respond_ok, rp_id, state_of, throttle,
};
use crate::auth::{auth_delay, webauthn, LoginStep, MfaInput};
use crate::error::{ServerError, ServerResult};
use hyper::{Body, Request, Response};
use routerify::Router;
use serde::Deserialize;
use tokio::task::block_in_place;
use wire::CreateAccountParams;

async fn create_account(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    let params = CreateAccountParams {
        email: field(&fields, "email")?.into(),
        password: field(&fields, "password")?.into(),
        salt: field(&fields, "salt")?.into(),
        key_bundle: field(&fields, "keyBundle")?.into(),
    };

    block_in_place(|| {
        state.auth.create_account(&params)?;
        respond(wire::Response::ok().info("account created"))
    })
}

async fn pre_login(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    auth_delay().await;
    let salt = block_in_place(|| state.auth.pre_login(field(&fields, "email")?))?;
    respond(wire::Response::ok().part("salt", salt))
}

async fn login(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    let email = field(&fields, "email")?;
    let password = field(&fields, "password")?;

    let mfa = MfaInput {
        webauthn: fields
            .get("mfa")
            .and_then(|raw| serde_json::from_str::<webauthn::AssertionParams>(raw).ok()),
        has_mfa_capability: has_mfa_capability(&parts),
    };

    auth_delay().await;
    let step = block_in_place(|| state.auth.login_begin(email, password, &mfa, &rp))?;
    let step = match step {
        LoginStep::NeedRemote { user_id } => {
            let now = state.db.now_ms();
            match state.auth.remote.wait(user_id, now).await {
                Ok(()) => {
                    let (user, token) = block_in_place(|| state.auth.mint_session(user_id))?;
                    LoginStep::Session { user, token }
                }
                Err(ServerError::InvalidCredentials) => {
                    block_in_place(|| state.auth.decoy_fallback(email, password))?
                }
                Err(e) => return Err(e),
            }
        }
        step => step,
    };

    match step {
        LoginStep::NeedRemote { .. } => unreachable!("remote wait already resolved"),
        LoginStep::MfaChallenge { options } => {
            respond(wire::Response::nok().part("mfa", options))
        }
        LoginStep::Session { user, token } => {
            let server_pk = block_in_place(|| -> ServerResult<String> {
                let keypair = user.keypair(state.db.master())?;
                Ok(base64::encode(keypair.public()))
            })?;
            respond(
                wire::Response::ok()
                    .part("token", token)
                    .part("userId", user.user_id.to_string())
                    .part("keyBundle", &user.key_bundle)
                    .part("serverPublicKey", server_pk)
                    .part("isKeyBackedUp", if user.is_backup { "1" } else { "0" })
                    .part("homeFolder", &user.home_folder),
            )
        }
    }
}

async fn logout(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, token) = require_session(&state, &fields)?;
        state.auth.logout(user.user_id, &token)?;
        respond(wire::Response::ok().info("logged out"))
    })
}

#[derive(Deserialize)]
struct ChangePassParams {
    #[serde(rename = "newPassword")]
    new_password: String,
    #[serde(rename = "newSalt")]
    new_salt: String,
    #[serde(rename = "keyBundle")]
    key_bundle: String,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn change_pass(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, token) = require_session(&state, &fields)?;
        if user.login_disabled {
            return Err(ServerError::NotAuthorized);
        }
        let p: ChangePassParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &crate::auth::token::hash(&token),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        let token = state
            .auth
            .change_password(user.user_id, &p.new_password, &p.new_salt, &p.key_bundle)?;
        respond(wire::Response::ok().part("token", token))
    })
}

async fn check_key(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    auth_delay().await;
    let challenge = block_in_place(|| state.auth.check_key(field(&fields, "email")?))?;
    respond(wire::Response::ok().part("challenge", challenge))
}

async fn recover_account(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    auth_delay().await;
    let token = block_in_place(|| {
        state.auth.recover_account(
            field(&fields, "email")?,
            field(&fields, "challenge")?,
            field(&fields, "newPassword")?,
            field(&fields, "newSalt")?,
            field(&fields, "keyBundle")?,
        )
    })?;
    respond(wire::Response::ok().part("token", token))
}

#[derive(Deserialize)]
struct DeleteUserParams {
    password: String,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn delete_user(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, token) = require_session(&state, &fields)?;
        if user.login_disabled {
            return Err(ServerError::NotAuthorized);
        }
        let p: DeleteUserParams = decrypt_params(&state.db, &user, &fields)?;
        if !bcrypt::verify(&p.password, &user.hashed_password)? {
            return Err(ServerError::InvalidCredentials);
        }
        state.auth.require_recent_mfa(
            &user,
            &crate::auth::token::hash(&token),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        state.db.delete_user(user.user_id)?;
        respond(wire::Response::ok().info("account deleted"))
    })
}

#[derive(Deserialize)]
struct ChangeEmailParams {
    #[serde(rename = "newEmail")]
    new_email: String,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn change_email(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, token) = require_session(&state, &fields)?;
        if user.login_disabled {
            return Err(ServerError::NotAuthorized);
        }
        let p: ChangeEmailParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &crate::auth::token::hash(&token),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        state.db.rename_user(user.user_id, &p.new_email)?;
        respond_ok()
    })
}

async fn get_server_pk(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let keypair = user.keypair(state.db.master())?;
        respond(wire::Response::ok().part("serverPK", base64::encode(keypair.public())))
    })
}

#[derive(Deserialize)]
struct ReuploadKeysParams {
    #[serde(rename = "keyBundle")]
    key_bundle: String,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn reupload_keys(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, token) = require_session(&state, &fields)?;
        let p: ReuploadKeysParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &crate::auth::token::hash(&token),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        state.auth.reupload_keys(user.user_id, &p.key_bundle)?;
        respond_ok()
    })
}

pub fn register_router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/createAccount", create_account)
        .build()
        .unwrap()
}

pub fn login_router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/preLogin", pre_login)
        .post("/login", login)
        .post("/logout", logout)
        .post("/changePass", change_pass)
        .post("/checkKey", check_key)
        .post("/recoverAccount", recover_account)
        .post("/deleteUser", delete_user)
        .post("/changeEmail", change_email)
        .build()
        .unwrap()
}

pub fn keys_router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/getServerPK", get_server_pk)
        .post("/reuploadKeys", reupload_keys)
        .build()
        .unwrap()
}
