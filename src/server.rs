use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ DefaultBodyLimit, Multipart, Path, Query, State };
use axum::http::{ header, StatusCode };
use axum::response::{ IntoResponse, Response };
use axum::routing::{ get, post };
use axum::{ Json, Router };
use serde::Deserialize;
use serde_json::{ json, Value };
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{ error, info, warn };

use crate::error::SearchError;
use crate::job::{ JobRunner, JobStatus };
use crate::media::MediaLibrary;
use crate::models::SearchResult;
use crate::search::SearchEngine;

pub const MAX_FILE_SIZE: u64 = 100_000_000;
pub const MAX_FIELDS: usize = 10;
pub const MAX_FILES: usize = 1;

#[derive(Clone)]
pub struct AppState {
    pub search: Arc<SearchEngine>,
    pub runner: Arc<JobRunner>,
    pub media: MediaLibrary,
    pub shutdown: CancellationToken,
    /// Largest accepted upload in bytes, normally [`MAX_FILE_SIZE`].
    pub max_file_size: u64,
}

pub fn router(state: AppState) -> Router {
    // room for multipart framing and the small text fields around the file
    let body_limit = usize::try_from(state.max_file_size)
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);
    Router::new()
        .route("/health", get(health))
        .route("/files", get(list_files))
        .route("/upload", post(upload))
        .route("/search", get(search))
        .route("/play/:file_id", get(play))
        .route("/media/:file_id", get(media))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

struct ApiError(SearchError);

impl From<SearchError> for ApiError {
    fn from(err: SearchError) -> Self {
        Self(err)
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        Self(SearchError::Io(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = if self.0.is_client_error() {
            StatusCode::BAD_REQUEST
        } else if self.0.is_not_found() {
            StatusCode::NOT_FOUND
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "request failed");
            "An error occurred on the server".to_string()
        } else {
            self.0.to_string()
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(SearchError::Validation(message.into()))
}

async fn health() -> &'static str {
    "OK"
}

async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.media.list_media().await?))
}

async fn upload(
    State(state): State<AppState>,
    multipart: Multipart
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let mut stored: Option<(String, PathBuf)> = None;
    let result = receive_upload(&state.media, state.max_file_size, multipart, &mut stored).await;
    if let Err(e) = result {
        if let Some((_, path)) = &stored {
            let _ = tokio::fs::remove_file(path).await;
        }
        return Err(e);
    }

    let (file_id, path) = stored.ok_or_else(|| bad_request("No file uploaded"))?;
    info!(file_id = %file_id, "accepted upload");
    state.runner.spawn(path, file_id.clone(), state.shutdown.child_token());
    Ok((StatusCode::ACCEPTED, Json(json!({ "fileId": file_id, "status": JobStatus::Uploading }))))
}

async fn receive_upload(
    media: &MediaLibrary,
    max_file_size: u64,
    mut multipart: Multipart,
    stored: &mut Option<(String, PathBuf)>
) -> Result<(), ApiError> {
    let mut fields = 0;
    let mut files = 0;
    while let Some(mut field) = multipart.next_field().await.map_err(|e| bad_request(e.body_text()))? {
        let Some(original) = field.file_name().map(str::to_string) else {
            fields += 1;
            if fields > MAX_FIELDS {
                return Err(bad_request(format!("at most {MAX_FIELDS} fields are accepted")));
            }
            continue;
        };
        files += 1;
        if files > MAX_FILES {
            return Err(bad_request("exactly one file per request"));
        }

        let file_id = MediaLibrary::stored_name(&original);
        let path = media.media_path(&file_id)?;
        let mut file = tokio::fs::File::create(&path).await?;
        *stored = Some((file_id, path));

        let mut written: u64 = 0;
        while let Some(bytes) = field.chunk().await.map_err(|e| bad_request(e.body_text()))? {
            written += bytes.len() as u64;
            if written > max_file_size {
                return Err(bad_request(format!("file exceeds {max_file_size} bytes")));
            }
            file.write_all(&bytes).await?;
        }
        file.flush().await?;
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    keyword: Option<String>,
    #[serde(rename = "fileId", alias = "fileName")]
    file_id: Option<String>,
    #[serde(rename = "useEmbedding")]
    use_embedding: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>
) -> Result<Json<Vec<SearchResult>>, ApiError> {
    let keyword = params.keyword.filter(|k| !k.trim().is_empty());
    let file_id = params.file_id.filter(|f| !f.trim().is_empty());
    let (Some(keyword), Some(file_id)) = (keyword, file_id) else {
        return Err(bad_request("Keyword and fileId are required"));
    };
    let use_embedding = params.use_embedding
        .as_deref()
        .is_some_and(|v| matches!(v, "true" | "1"));

    let results = state.search.search(&keyword, &file_id, use_embedding).await?;
    Ok(Json(results))
}

async fn play(
    State(state): State<AppState>,
    Path(file_id): Path<String>
) -> Result<Json<Value>, ApiError> {
    // Links shaped like the metadata document name resolve to the media file.
    let file_id = file_id.strip_suffix("_metadata.json").unwrap_or(&file_id).to_string();
    let playback = state.media.playback(&file_id).await.map_err(|e| {
        if e.is_not_found() {
            warn!(file_id = %file_id, "file not found");
        }
        e
    })?;
    Ok(
        Json(
            json!({
                "fileId": playback.file_id,
                "mediaUrl": format!("/media/{}", playback.file_id),
                "metadata": playback.metadata,
            })
        )
    )
}

async fn media(
    State(state): State<AppState>,
    Path(file_id): Path<String>
) -> Result<Response, ApiError> {
    let playback = state.media.playback(&file_id).await?;
    let file = tokio::fs::File::open(&playback.media_path).await?;
    let mime = mime_guess::from_path(&playback.media_path).first_or_octet_stream();
    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(header::CONTENT_TYPE, mime.to_string())], body).into_response())
}
