use super::{
    decrypt_params, form_fields, join, require_approved, require_session, respond, respond_ok,
    state_of, throttle,
};
use crate::db::fileset::MoveSpec;
use crate::error::{ServerError, ServerResult};
use hyper::{Body, Request, Response};
use routerify::Router;
use serde::Deserialize;
use tokio::task::block_in_place;
use wire::{GetUpdatesParams, MoveFileParams, Set};

async fn get_updates(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let cursors: GetUpdatesParams = decrypt_params(&state.db, &user, &fields)?;
        let updates = state.db.get_updates(user.user_id, &cursors)?;

        let mut resp = wire::Response::ok()
            .part("files", &updates.files)
            .part("trash", &updates.trash)
            .part("albums", &updates.albums)
            .part("albumFiles", &updates.album_files)
            .part("contacts", &updates.contacts)
            .part("deletes", &updates.deletes)
            .part("spaceUsed", updates.space_used)
            .part("spaceQuota", updates.space_quota);
        if updates.out_of_sync {
            resp = resp.error(wire::OUT_OF_SYNC);
        }
        respond(resp)
    })
}

async fn move_file(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: MoveFileParams = decrypt_params(&state.db, &user, &fields)?;

        let set_from = Set::from_wire(&p.set_from).ok_or(ServerError::BadRequest)?;
        let set_to = Set::from_wire(&p.set_to).ok_or(ServerError::BadRequest)?;
        let opt = |s: &String| {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        };
        let spec = MoveSpec {
            set_from,
            album_id_from: opt(&p.album_id_from),
            set_to,
            album_id_to: opt(&p.album_id_to),
            is_moving: p.is_moving == "1",
            filenames: p.filenames,
            headers: p.headers,
        };
        state.db.move_file(user.user_id, &spec)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct EmptyTrashParams {
    /// Trash records modified at or before this timestamp are removed.
    time: i64,
}

async fn empty_trash(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: EmptyTrashParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.empty_trash(user.user_id, p.time)?;
        respond_ok()
    })
}

#[derive(Deserialize)]
struct DeleteParams {
    files: Vec<String>,
}

async fn delete(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        require_approved(&user)?;
        let p: DeleteParams = decrypt_params(&state.db, &user, &fields)?;
        state.db.delete_files(user.user_id, &p.files)?;
        respond_ok()
    })
}

pub fn router() -> Router<Body, ServerError> {
    Router::builder()
        .post("/getUpdates", get_updates)
        .post("/upload", super::files::upload)
        .post("/moveFile", move_file)
        .post("/emptyTrash", empty_trash)
        .post("/delete", delete)
        .post("/download", super::files::download)
        .post("/getUrl", super::files::get_url)
        .post("/getDownloadUrls", super::files::get_download_urls)
        .post("/addAlbum", super::albums::add_album)
        .post("/deleteAlbum", super::albums::delete_album)
        .post("/changeAlbumCover", super::albums::change_album_cover)
        .post("/renameAlbum", super::albums::change_metadata)
        .post("/shareAlbum", super::albums::share_album)
        .post("/editPerms", super::albums::edit_perms)
        .post("/removeAlbumMember", super::albums::remove_album_member)
        .post("/unshareAlbum", super::albums::unshare_album)
        .post("/leaveAlbum", super::albums::leave_album)
        .build()
        .unwrap()
}
