use super::{
    decrypt_params, form_fields, join, require_approved, require_session, respond_ok, state_of,
    throttle,
};
use crate::error::ServerResult;
use hyper::{Body, Request, Response};
use serde::Deserialize;
use tokio::task::block_in_place;
use wire::{AddAlbumParams, ShareAlbumParams};

pub async fn add_album(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: AddAlbumParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.add_album(user.user_id, &p)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct AlbumIdParams {
    #[serde(rename = "albumId")]
    album_id: String,
}

pub async fn delete_album(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: AlbumIdParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.delete_album(user.user_id, &p.album_id)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct CoverParams {
    #[serde(rename = "albumId")]
    album_id: String,
    cover: String,
}

pub async fn change_album_cover(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: CoverParams = decrypt_params(&state.db, &user, &fields)?;
        state
            .db
            .change_album_cover(user.user_id, &p.album_id, &p.cover)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct MetadataParams {
    #[serde(rename = "albumId")]
    album_id: String,
    metadata: String,
}

pub async fn change_metadata(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: MetadataParams = decrypt_params(&state.db, &user, &fields)?;
        state
            .db
            .change_metadata(user.user_id, &p.album_id, &p.metadata)?;
        respond_ok()
    })
}

pub async fn share_album(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: ShareAlbumParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.share_album(user.user_id, &p)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct PermsParams {
    #[serde(rename = "albumId")]
    album_id: String,
    permissions: String,
}

pub async fn edit_perms(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: PermsParams = decrypt_params(&state.db, &user, &fields)?;
        state
            .db
            .update_perms(user.user_id, &p.album_id, &p.permissions)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct MemberParams {
    #[serde(rename = "albumId")]
    album_id: String,
    #[serde(rename = "memberUserId")]
    member_user_id: u64,
}

pub async fn remove_album_member(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: MemberParams = decrypt_params(&state.db, &user, &fields)?;
        state
            .db
            .remove_album_member(user.user_id, &p.album_id, p.member_user_id)?;
        respond_ok()
    })
}

pub async fn unshare_album(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: AlbumIdParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.unshare_album(user.user_id, &p.album_id)?;
        respond_ok()
    })
}

pub async fn leave_album(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: AlbumIdParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.leave_album(user.user_id, &p.album_id)?;
        respond_ok()
    })
}
