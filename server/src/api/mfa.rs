use super::{
    decrypt_params, form_fields, join, require_session, respond, respond_ok, rp_id, state_of,
    throttle,
};
use crate::auth::{token, webauthn};
use crate::error::{ServerError, ServerResult};
use hyper::{Body, Request, Response};
use routerify::Router;
use serde::Deserialize;
use tokio::task::block_in_place;

#[derive(Deserialize)]
struct EnableParams {
    #[serde(rename = "requireMFA")]
    require_mfa: bool,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn enable(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, tok) = require_session(&state, &fields)?;
        let p: EnableParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &token::hash(&tok),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        state.auth.set_require_mfa(user.user_id, p.require_mfa)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct CheckParams {
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

/// Verifies a factor ahead of a sensitive operation, stamping the grace
/// window for this session on success.
async fn check(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, tok) = require_session(&state, &fields)?;
        let p: CheckParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &token::hash(&tok),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct ApproveParams {
    #[serde(rename = "sessionId")]
    session_id: String,
    pub approve: bool,
}

/// Another logged-in device answers a pending remote-MFA request.
async fn approve(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: ApproveParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.remote.resolve(&p.session_id, user.user_id, p.approve)?;
        respond_ok()
    })
}

async fn status(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let pending: Vec<serde_json::Value> = state
            .auth
            .remote
            .pending_for(user.user_id)
            .into_iter()
            .map(|(id, created)| serde_json::json!({ "sessionId": id, "date": created }))
            .collect();
        respond(wire::Response::ok().part("pending", pending))
    })
}

#[derive(Deserialize)]
struct WebauthnRegisterParams {
    #[serde(default)]
    passkey: bool,
    #[serde(rename = "attestationObject", default)]
    attestation_object: Option<String>,
    #[serde(rename = "clientDataJSON", default)]
    client_data_json: Option<String>,
    #[serde(default)]
    transports: Vec<String>,
    #[serde(default)]
    name: String,
}

/// Without an attestation this begins registration and returns creation
/// options; with one it finishes and stores the credential.
async fn webauthn_register(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: WebauthnRegisterParams = decrypt_params(&state.db, &user, &fields)?;

        match (p.attestation_object, p.client_data_json) {
            (Some(attestation_object), Some(client_data_json)) => {
                let params = webauthn::RegistrationParams {
                    attestation_object,
                    client_data_json,
                    transports: p.transports,
                    name: p.name,
                    discoverable: p.passkey,
                };
                state
                    .auth
                    .webauthn_register_finish(user.user_id, &rp, &params)?;
                respond_ok()
            }
            _ => {
                let options = state
                    .auth
                    .webauthn_register_begin(user.user_id, &rp, p.passkey)?;
                respond(wire::Response::ok().part("attestationOptions", options))
            }
        }
    })
}

async fn webauthn_keys(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        respond(wire::Response::ok().part("keys", state.auth.webauthn_keys(&user)))
    })
}

#[derive(Deserialize)]
struct UpdateKeysParams {
    #[serde(default)]
    remove: Vec<String>,
    #[serde(default)]
    rename: Vec<(String, String)>,
    #[serde(rename = "otp", default)]
    otp_code: Option<String>,
    #[serde(rename = "mfa", default)]
    assertion: Option<webauthn::AssertionParams>,
}

async fn webauthn_update_keys(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, tok) = require_session(&state, &fields)?;
        let p: UpdateKeysParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.require_recent_mfa(
            &user,
            &token::hash(&tok),
            p.otp_code.as_deref(),
            p.assertion.as_ref(),
            &rp,
        )?;
        state
            .auth
            .webauthn_update_keys(user.user_id, &p.remove, &p.rename)?;
        respond_ok()
    })
}

async fn generate_otp(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let rp = rp_id(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let (secret, png) = state.auth.generate_otp(&user.email, &rp)?;
        respond(
            wire::Response::ok()
                .part("key", secret)
                .part("img", format!("data:image/png;base64,{}", base64::encode(png))),
        )
    })
}

#[derive(Deserialize)]
struct SetOtpParams {
    #[serde(default)]
    key: String,
    #[serde(default)]
    code: String,
}

async fn set_otp(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: SetOtpParams = decrypt_params(&state.db, &user, &fields)?;
        state.auth.set_otp(user.user_id, &p.key, &p.code)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct PushParams {
    endpoint: String,
    #[serde(default)]
    auth: String,
    #[serde(default)]
    p256dh: String,
}

async fn push(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: PushParams = decrypt_params(&state.db, &user, &fields)?;
        state
            .auth
            .push_subscribe(user.user_id, &p.endpoint, &p.auth, &p.p256dh)?;
        respond_ok()
    })
}

pub fn mfa_router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/enable", enable)
        .post("/check", check)
        .post("/approve", approve)
        .post("/status", status)
        .build()
        .unwrap()
}

pub fn config_router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/webauthn/register", webauthn_register)
        .post("/webauthn/keys", webauthn_keys)
        .post("/webauthn/updateKeys", webauthn_update_keys)
        .post("/generateOTP", generate_otp)
        .post("/setOTP", set_otp)
        .post("/push", push)
        .build()
        .unwrap()
}
