//! HTTP adapter: form fields in, the JSON status envelope out. Handlers
//! stay thin; everything stateful happens in the database and auth
//! layers, under `block_in_place` because storage is blocking.

pub mod admin;
pub mod albums;
pub mod files;
pub mod login;
pub mod mfa;
pub mod sync;

use crate::auth::AuthService;
use crate::db::{Db, UserRecord};
use crate::error::{ServerError, ServerResult};
use hyper::http::request::Parts;
use hyper::{header, Body, Request, Response, StatusCode};
use routerify::ext::RequestExt;
use routerify::{Middleware, Router};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{error, info};

pub struct AppState {
    pub db: Arc<Db>,
    pub auth: Arc<AuthService>,
    pub limiter: Arc<Semaphore>,
}

/// Blocks in FIFO order once the configured number of requests is in
/// flight.
pub async fn throttle(parts: &Parts) -> OwnedSemaphorePermit
{
    let state = parts.data::<Arc<AppState>>().unwrap();
    state
        .limiter
        .clone()
        .acquire_owned()
        .await
        .expect("limiter never closes")
}

pub fn state_of(parts: &Parts) -> Arc<AppState> {
    parts.data::<Arc<AppState>>().unwrap().clone()
}

pub async fn join(body: Body) -> ServerResult<Vec<u8>> {
    use futures::TryStreamExt;

    let mut data = vec![];
    let mut stream = body.into_stream();
    while let Some(chunk) = stream.try_next().await? {
        data.extend_from_slice(&chunk);
    }
    Ok(data)
}

fn url_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decoded `application/x-www-form-urlencoded` fields.
pub fn form_fields(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    querystring::querify(&text)
        .into_iter()
        .map(|(k, v)| (url_decode(k), url_decode(v)))
        .collect()
}

pub fn field<'a>(fields: &'a HashMap<String, String>, name: &str) -> ServerResult<&'a str> {
    fields
        .get(name)
        .map(|s| s.as_str())
        .ok_or(ServerError::BadRequest)
}

/// Session check for authenticated endpoints: the `token` form field.
pub fn require_session(
    state: &AppState,
    fields: &HashMap<String, String>,
) -> ServerResult<(UserRecord, String)> {
    let token = field(fields, "token")?;
    let user = state.auth.check_session(token)?;
    Ok((user, token.to_string()))
}

/// Accounts awaiting operator approval may read but not write.
pub fn require_approved(user: &UserRecord) -> ServerResult<()> {
    if user.need_approval {
        return Err(ServerError::NotAuthorized);
    }
    Ok(())
}

/// Opens the sealed `params` field with the user's server key pair.
pub fn decrypt_params<T: DeserializeOwned>(
    db: &Db,
    user: &UserRecord,
    fields: &HashMap<String, String>,
) -> ServerResult<T> {
    let sealed = field(fields, "params")?;
    let raw = base64::decode_config(sealed, base64::URL_SAFE_NO_PAD)
        .map_err(|_| ServerError::BadRequest)?;
    let keypair = user.keypair(db.master())?;
    let plain = crate::crypto::envelope::open(&raw, &keypair)?;
    Ok(serde_json::from_slice(&plain)?)
}

/// The relying-party id used by WebAuthn: the request host without the
/// port.
pub fn rp_id(parts: &Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn has_mfa_capability(parts: &Parts) -> bool {
    parts
        .headers
        .get(wire::CAPABILITIES_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(|caps| caps.split(',').any(|c| c.trim() == wire::CAPABILITY_MFA))
        .unwrap_or(false)
}

pub fn respond(resp: wire::Response) -> ServerResult<Response<Body>> {
    let json = serde_json::to_string(&resp)?;
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .status(StatusCode::OK)
        .body(Body::from(json))
        .unwrap())
}

pub fn respond_ok() -> ServerResult<Response<Body>> {
    respond(wire::Response::ok())
}

async fn logger(req: Request<Body>) -> ServerResult<Request<Body>> {
    info!(
        method = %req.method(),
        path = req.uri().path(),
        remote = %req.remote_addr(),
        "request",
    );
    Ok(req)
}

/// Domain errors become a `nok` envelope with a constant message; real
/// failures become an opaque 500.
pub async fn handle_error(err: routerify::RouteError) -> Response<Body> {
    let err = match err.downcast::<ServerError>() {
        Ok(e) => *e,
        Err(other) => {
            error!(error = %other, "unclassified error");
            return plain_status(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if err.is_internal() {
        error!(error = %err, "internal error");
        let resp = wire::Response::nok();
        let json = serde_json::to_string(&resp).unwrap();
        return Response::builder()
            .header(header::CONTENT_TYPE, "application/json")
            .status(StatusCode::INTERNAL_SERVER_ERROR)
            .body(Body::from(json))
            .unwrap();
    }

    let resp = match err {
        ServerError::MfaRequired(options) => wire::Response::nok().part("mfa", options),
        ServerError::DecryptFailed => {
            error!("decrypt failure on request path");
            wire::Response::nok()
        }
        ServerError::Timeout => wire::Response::nok(),
        ServerError::Denied(msg) => wire::Response::nok().error(msg),
        ServerError::InvalidCredentials => wire::Response::nok().error("invalid credentials"),
        ServerError::NotAuthorized => wire::Response::nok().error("not authorized"),
        ServerError::QuotaExceeded => wire::Response::nok().error("quota exceeded"),
        ServerError::EmailTaken => wire::Response::nok().error("email already in use"),
        ServerError::OutOfSync => wire::Response::nok().error(wire::OUT_OF_SYNC),
        _ => wire::Response::nok(),
    };
    let json = serde_json::to_string(&resp).unwrap();
    Response::builder()
        .header(header::CONTENT_TYPE, "application/json")
        .status(StatusCode::OK)
        .body(Body::from(json))
        .unwrap()
}

fn plain_status(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap()
}

pub fn router(state: Arc<AppState>) -> Router<Body, ServerError> {
    Router::builder()
        .middleware(Middleware::pre(logger))
        .data(state)
        .scope("/v2/register", login::register_router())
        .scope("/v2/login", login::login_router())
        .scope("/v2/keys", login::keys_router())
        .scope("/v2/sync", sync::router())
        .scope("/v2/download", files::signed_router())
        .scope("/v2x/mfa", mfa::mfa_router())
        .scope("/v2x/config", mfa::config_router())
        .scope("/c2/admin", admin::router())
        .any(|_| async { Err(ServerError::NotFound) })
        .err_handler(handle_error)
        .build()
        .unwrap()
}
