use super::{
    decrypt_params, form_fields, join, require_session, respond, state_of, throttle,
};
use crate::db::AdminChange;
use crate::error::{ServerError, ServerResult};
use hyper::{Body, Request, Response};
use routerify::Router;
use serde::Deserialize;
use tokio::task::block_in_place;

#[derive(Deserialize, Default)]
struct AdminParams {
    #[serde(default)]
    change: Option<AdminChange>,
}

async fn users(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        if !user.admin {
            return Err(ServerError::NotAuthorized);
        }
        let p: AdminParams = decrypt_params(&state.db, &user, &fields).unwrap_or_default();
        let listing = state.db.admin_data(p.change.as_ref())?;
        respond(wire::Response::ok().part("users", listing))
    })
}

pub fn router() -> Router<Body, ServerError> {
    Router::builder().post("/users", users).build().unwrap()
}
