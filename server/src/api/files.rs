//! Streaming upload and download.
//!
//! Uploads spool each file part through the master-key stream writer into
//! the upload area under a pre-allocated blob name, so the commit is a
//! rename. The session token is only checked once the streams are on
//! disk; every non-commit exit removes the temp files. Each chunk
//! refreshes a deadline instead of one request-wide timeout, so a stalled
//! peer cannot hold a slot for long.

use super::{
    decrypt_params, field, form_fields, join, require_approved, require_session, respond,
    state_of, throttle, AppState,
};
use crate::auth::token;
use crate::db::fileset::FileSpec;
use crate::db::Db;
use crate::error::{ServerError, ServerResult};
use crate::storage::SecureStore;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use hyper::{header, Body, Request, Response, StatusCode};
use routerify::ext::RequestExt;
use routerify::Router;
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::block_in_place;
use wire::Set;

const SCALAR_PART_LIMIT: usize = 2 * 1024;
const CHUNK_DEADLINE: Duration = Duration::from_secs(60);
const COPY_TICK: usize = 4 * 1024;
const COPY_DEADLINE: Duration = Duration::from_secs(10);

/// Temp files owned by an in-flight upload; dropped without `commit`,
/// they are removed, so cancellation and errors cannot leak spool files.
struct UploadTemps {
    paths: Vec<PathBuf>,
    keep: bool,
}

impl UploadTemps {
    fn new() -> UploadTemps {
        UploadTemps {
            paths: vec![],
            keep: false,
        }
    }

    fn commit(&mut self) {
        self.keep = true;
    }
}

impl Drop for UploadTemps {
    fn drop(&mut self) {
        if !self.keep {
            for p in &self.paths {
                let _ = std::fs::remove_file(p);
            }
        }
    }
}

struct StreamedPart {
    blob_name: String,
    temp: PathBuf,
    bytes: u64,
}

async fn read_file_part(
    state: &AppState,
    field: &mut multer::Field<'_>,
    temps: &mut UploadTemps,
) -> ServerResult<StreamedPart> {
    let blob_name = SecureStore::new_blob_name();
    let (temp, mut writer) = block_in_place(|| state.db.store().blob_writer(&blob_name))?;
    temps.paths.push(temp.clone());

    loop {
        let chunk = tokio::time::timeout(CHUNK_DEADLINE, field.chunk())
            .await
            .map_err(|_| ServerError::Timeout)??;
        match chunk {
            Some(bytes) => block_in_place(|| writer.write_all(&bytes))?,
            None => break,
        }
    }

    let bytes = block_in_place(|| -> ServerResult<u64> {
        let (file, total) = writer.finish()?;
        file.sync_all()?;
        Ok(total)
    })?;

    Ok(StreamedPart {
        blob_name,
        temp,
        bytes,
    })
}

async fn read_scalar_part(field: &mut multer::Field<'_>) -> ServerResult<String> {
    let mut data = Vec::new();
    loop {
        let chunk = tokio::time::timeout(CHUNK_DEADLINE, field.chunk())
            .await
            .map_err(|_| ServerError::Timeout)??;
        match chunk {
            Some(bytes) => {
                if data.len() + bytes.len() > SCALAR_PART_LIMIT {
                    return Err(ServerError::BadRequest);
                }
                data.extend_from_slice(&bytes);
            }
            None => break,
        }
    }
    String::from_utf8(data).map_err(|_| ServerError::BadRequest)
}

pub async fn upload(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let boundary = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|ct| ct.to_str().ok())
        .and_then(|ct| multer::parse_boundary(ct).ok())
        .ok_or(ServerError::BadRequest)?;
    let mut multipart = multer::Multipart::new(body, boundary);

    let mut temps = UploadTemps::new();
    let mut file_part: Option<StreamedPart> = None;
    let mut thumb_part: Option<StreamedPart> = None;
    let mut scalars = std::collections::HashMap::new();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => file_part = Some(read_file_part(&state, &mut field, &mut temps).await?),
            Some("thumb") => {
                thumb_part = Some(read_file_part(&state, &mut field, &mut temps).await?)
            }
            Some(name) => {
                let value = read_scalar_part(&mut field).await?;
                scalars.insert(name.to_string(), value);
            }
            None => continue,
        }
    }

    let file_part = file_part.ok_or(ServerError::BadRequest)?;
    let thumb_part = thumb_part.ok_or(ServerError::BadRequest)?;

    // Streams are captured; now authenticate and commit.
    block_in_place(|| {
        let (user, _) = require_session(&state, &scalars)?;
        require_approved(&user)?;

        let set = Set::from_wire(field(&scalars, "set")?).ok_or(ServerError::BadRequest)?;
        let album_id = scalars.get("albumId").filter(|s| !s.is_empty()).cloned();
        let date_created = field(&scalars, "dateCreated")?
            .parse()
            .map_err(|_| ServerError::BadRequest)?;
        let version = field(&scalars, "version")?.to_string();
        let headers = field(&scalars, "headers")?.to_string();

        let file_name = SecureStore::new_blob_name();
        let spec = FileSpec {
            version,
            date_created,
            date_modified: 0,
            headers,
            album_id: album_id.clone(),
            store_file: file_part.blob_name.clone(),
            store_file_size: file_part.bytes as i64,
            store_thumb: thumb_part.blob_name.clone(),
            store_thumb_size: thumb_part.bytes as i64,
        };

        state
            .db
            .store()
            .import_blob(&file_part.temp, &file_part.blob_name)?;
        state
            .db
            .store()
            .import_blob(&thumb_part.temp, &thumb_part.blob_name)?;
        temps.commit();

        if let Err(e) =
            state
                .db
                .add_file(user.user_id, set, album_id.as_deref(), &file_name, spec)
        {
            // The record never landed; the imported blobs are unreachable.
            let _ = state.db.store().delete_blob(&file_part.blob_name);
            let _ = state.db.store().delete_blob(&thumb_part.blob_name);
            return Err(e);
        }

        respond(wire::Response::ok().part("file", file_name))
    })
}

fn blob_stream(
    db: std::sync::Arc<Db>,
    name: String,
    offset: u64,
) -> impl Stream<Item = io::Result<Bytes>> {
    try_stream! {
        let mut reader = block_in_place(|| -> io::Result<_> {
            let mut r = db
                .store()
                .blob_reader(&name)
                .map_err(to_io)?;
            if offset > 0 {
                r.seek_to(offset).map_err(to_io)?;
            }
            Ok(r)
        })?;

        loop {
            // The deadline refreshes on every tick; a read that stalls
            // errors the stream out instead of holding the slot.
            let step = tokio::time::timeout(
                COPY_DEADLINE,
                tokio::task::spawn_blocking(move || -> io::Result<_> {
                    let mut buf = vec![0u8; COPY_TICK];
                    let n = reader.read(&mut buf)?;
                    buf.truncate(n);
                    Ok((reader, buf))
                }),
            )
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read deadline expired"))?
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

            let (returned, chunk) = step?;
            reader = returned;
            if chunk.is_empty() {
                break;
            }
            yield Bytes::from(chunk);
        }
    }
}

fn to_io(e: ServerError) -> io::Error {
    match e {
        ServerError::Io(e) => e,
        ServerError::NotFound => io::Error::new(io::ErrorKind::NotFound, "no such blob"),
        _ => io::Error::new(io::ErrorKind::InvalidData, "decrypt failed"),
    }
}

#[derive(Deserialize)]
struct DownloadParams {
    file: String,
    set: String,
    #[serde(rename = "albumId", default)]
    album_id: String,
    #[serde(default)]
    thumb: bool,
}

/// Session-authenticated download; the response body is the client's own
/// ciphertext stream.
pub async fn download(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    let (spec, thumb) = block_in_place(|| -> ServerResult<(FileSpec, bool)> {
        let (user, _) = require_session(&state, &fields)?;
        let p: DownloadParams = decrypt_params(&state.db, &user, &fields)?;
        let set = Set::from_wire(&p.set).ok_or(ServerError::BadRequest)?;
        let album_id = if p.album_id.is_empty() {
            None
        } else {
            Some(p.album_id.as_str())
        };
        let spec = state.db.find_file(user.user_id, set, album_id, &p.file)?;
        Ok((spec, p.thumb))
    })?;

    let blob = if thumb {
        spec.store_thumb
    } else {
        spec.store_file
    };
    let stream = blob_stream(state.db.clone(), blob, 0);
    Ok(Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .status(StatusCode::OK)
        .body(Body::wrap_stream(stream))
        .unwrap())
}

fn parse_range(parts: &hyper::http::request::Parts) -> Option<u64> {
    let raw = parts.headers.get(header::RANGE)?.to_str().ok()?;
    let rest = raw.strip_prefix("bytes=")?;
    let (start, end) = rest.split_once('-')?;
    if !end.is_empty() {
        return None;
    }
    start.parse().ok()
}

/// Range-capable download authenticated by a signed URL token.
pub async fn signed_download(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, _) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);

    let token_str = parts.param("token").ok_or(ServerError::BadRequest)?.clone();
    let range_start = parse_range(&parts);

    let (blob, size) = block_in_place(|| -> ServerResult<(String, u64)> {
        let (user, tok) = state.auth.check_download(&token_str)?;
        let set = tok
            .set
            .as_deref()
            .and_then(Set::from_wire)
            .ok_or(ServerError::InvalidCredentials)?;
        let file = tok.file.as_deref().ok_or(ServerError::InvalidCredentials)?;
        let spec = state.db.locate_file(user.user_id, set, file)?;
        let blob = if tok.thumb {
            spec.store_thumb
        } else {
            spec.store_file
        };
        let size = state.db.store().blob_plaintext_size(&blob)?;
        Ok((blob, size))
    })?;

    match range_start {
        Some(start) => {
            if start >= size {
                return Ok(Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                    .body(Body::empty())
                    .unwrap());
            }
            let stream = blob_stream(state.db.clone(), blob, start);
            Ok(Response::builder()
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, size - 1, size),
                )
                .header(header::CONTENT_LENGTH, size - start)
                .body(Body::wrap_stream(stream))
                .unwrap())
        }
        _ => {
            let stream = blob_stream(state.db.clone(), blob, 0);
            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .header(header::CONTENT_LENGTH, size)
                .body(Body::wrap_stream(stream))
                .unwrap())
        }
    }
}

fn host_of(parts: &hyper::http::request::Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost")
        .to_string()
}

fn make_download_url(
    state: &AppState,
    user: &crate::db::UserRecord,
    host: &str,
    file: &str,
    set: &str,
    thumb: bool,
) -> ServerResult<String> {
    let key = user.unwrapped_token_key(state.db.master())?;
    let tok = token::mint(
        &key,
        &token::Token::download(user.user_id, set, file, thumb, state.db.now_ms()),
    );
    Ok(format!("https://{}/v2/download/{}", host, tok))
}

#[derive(Deserialize)]
struct GetUrlParams {
    file: String,
    set: String,
    #[serde(default)]
    thumb: bool,
}

pub async fn get_url(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let host = host_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: GetUrlParams = decrypt_params(&state.db, &user, &fields)?;
        let set = Set::from_wire(&p.set).ok_or(ServerError::BadRequest)?;
        state.db.locate_file(user.user_id, set, &p.file)?;
        let url = make_download_url(&state, &user, &host, &p.file, &p.set, p.thumb)?;
        respond(wire::Response::ok().part("url", url))
    })
}

#[derive(Deserialize)]
struct GetUrlsParams {
    files: Vec<wire::DownloadTarget>,
}

pub async fn get_download_urls(req: Request<Body>) -> ServerResult<Response<Body>> {
    let (parts, body) = req.into_parts();
    let _permit = throttle(&parts).await;
    let state = state_of(&parts);
    let host = host_of(&parts);

    let body = join(body).await?;
    let fields = form_fields(&body);
    block_in_place(|| {
        let (user, _) = require_session(&state, &fields)?;
        let p: GetUrlsParams = decrypt_params(&state.db, &user, &fields)?;

        let mut urls = serde_json::Map::new();
        for target in &p.files {
            let set = Set::from_wire(&target.set).ok_or(ServerError::BadRequest)?;
            if state
                .db
                .locate_file(user.user_id, set, &target.filename)
                .is_err()
            {
                continue;
            }
            let url = make_download_url(
                &state,
                &user,
                &host,
                &target.filename,
                &target.set,
                target.thumb,
            )?;
            urls.insert(target.filename.clone(), serde_json::Value::String(url));
        }
        respond(wire::Response::ok().part("urls", urls))
    })
}

pub fn signed_router() -> Router<Body, ServerError> {
    Router::builder()
        .get("/:token", signed_download)
        .build()
        .unwrap()
}
