//! Single-host HTTP file server rooted at one uploads directory
//!
//! Every client-supplied path goes through [`containment::resolve_within`]
//! before it touches the disk.

pub mod archive;
pub mod containment;
pub mod listing;

use std::io;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State, multipart::MultipartError},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::LocalSettings;
use crate::listen;
use containment::{PathEscape, is_root, resolve_within};
use listing::TreeEntry;

/// Name prefix of uploads still being streamed to disk
pub const PARTIAL_PREFIX: &str = ".ferry-upload-";

#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Forbidden(#[from] PathEscape),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read upload: {0}")]
    Multipart(#[from] MultipartError),

    #[error("{0}")]
    Internal(String),
}

impl LocalError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        LocalError::Io {
            context: context.into(),
            source,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            LocalError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LocalError::Forbidden(_) => StatusCode::FORBIDDEN,
            LocalError::NotFound(_) => StatusCode::NOT_FOUND,
            LocalError::Multipart(e) => e.status(),
            LocalError::Io { .. } | LocalError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LocalError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "success": false, "message": self.to_string() }))).into_response()
    }
}

#[derive(Clone)]
pub struct LocalState {
    root: Arc<PathBuf>,
}

impl LocalState {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &FsPath {
        &self.root
    }

    /// Resolves a client path, logging rejected escapes.
    fn resolve(&self, relative: &str) -> Result<PathBuf, LocalError> {
        resolve_within(&self.root, relative).map_err(|e| {
            tracing::warn!(path = %relative, "Rejected path outside the uploads root");
            LocalError::from(e)
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    path: Option<String>,
}

impl PathQuery {
    fn required(&self) -> Result<&str, LocalError> {
        match self.path.as_deref() {
            Some(path) if !path.trim().is_empty() => Ok(path),
            _ => Err(LocalError::BadRequest("Missing path parameter".to_string())),
        }
    }
}

pub fn router(state: LocalState, max_upload_bytes: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/tree", get(tree))
        .route("/upload", post(upload))
        .route("/download-folder", get(download_folder))
        .route("/delete", delete(delete_path))
        .route("/uploads/{*path}", get(serve_upload))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the local file server until ctrl-c
pub async fn run_local_server(settings: LocalSettings) -> Result<()> {
    let root = if settings.root.is_absolute() {
        settings.root.clone()
    } else {
        std::env::current_dir()
            .context("Failed to determine working directory")?
            .join(&settings.root)
    };
    fs::create_dir_all(&root)
        .await
        .with_context(|| format!("Failed to create uploads directory at {}", root.display()))?;

    let listener = listen::bind_with_fallback(settings.bind, settings.port)
        .await
        .with_context(|| format!("Failed to bind file server on {}:{}", settings.bind, settings.port))?;
    let port = listener.local_addr()?.port();

    tracing::info!(port, root = %root.display(), "File server listening");
    println!("File server started");
    println!("  Local:   http://localhost:{}", port);
    if let Some(host) = hostname::get().ok().and_then(|h| h.into_string().ok()) {
        println!("  Network: http://{}:{}", host, port);
    }
    println!("  Files are stored in {}", root.display());

    let app = router(LocalState::new(root), settings.max_upload_bytes);
    axum::serve(listener, app)
        .with_graceful_shutdown(listen::shutdown_signal())
        .await
        .context("File server failed")?;

    tracing::info!("File server stopped");
    Ok(())
}

async fn load_tree(root: PathBuf) -> Result<Vec<TreeEntry>, LocalError> {
    tokio::task::spawn_blocking(move || listing::folder_tree(&root))
        .await
        .map_err(|e| LocalError::Internal(format!("Listing task failed: {}", e)))?
        .map_err(|e| LocalError::Internal(format!("{:#}", e)))
}

async fn index(State(state): State<LocalState>) -> Result<Html<String>, LocalError> {
    let tree = load_tree(state.root.to_path_buf()).await?;
    Ok(Html(listing::render_page(&state.root.display().to_string(), &tree)))
}

async fn tree(State(state): State<LocalState>) -> Result<Json<Vec<TreeEntry>>, LocalError> {
    Ok(Json(load_tree(state.root.to_path_buf()).await?))
}

/// Streams the first file part to disk, then moves it under the optional `path` folder.
async fn upload(State(state): State<LocalState>, mut multipart: Multipart) -> Result<Json<serde_json::Value>, LocalError> {
    let mut folder = String::new();
    let mut stored: Option<(String, PathBuf)> = None;

    let result = async {
        while let Some(mut field) = multipart.next_field().await? {
            if let Some(file_name) = field.file_name().map(str::to_string) {
                if stored.is_some() {
                    continue;
                }
                let name = FsPath::new(&file_name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| LocalError::BadRequest(format!("Invalid file name: {}", file_name)))?;

                let partial = state
                    .root
                    .join(format!("{}{:016x}", PARTIAL_PREFIX, rand::random::<u64>()));
                // recorded before writing so a failed stream is still cleaned up
                stored = Some((name, partial.clone()));

                let mut file = fs::File::create(&partial)
                    .await
                    .map_err(|e| LocalError::io("Failed to create file", e))?;
                while let Some(chunk) = field.chunk().await? {
                    file.write_all(&chunk)
                        .await
                        .map_err(|e| LocalError::io("Failed to write file", e))?;
                }
                file.flush().await.map_err(|e| LocalError::io("Failed to write file", e))?;
            } else if field.name() == Some("path") {
                folder = field.text().await?;
            }
        }
        Ok::<_, LocalError>(())
    }
    .await;

    if let Err(e) = result {
        if let Some((_, partial)) = &stored {
            let _ = fs::remove_file(partial).await;
        }
        return Err(e);
    }

    let Some((name, partial)) = stored else {
        return Err(LocalError::BadRequest("No file uploaded".to_string()));
    };

    match place_upload(&state, folder.trim(), &name, &partial).await {
        Ok(relative) => {
            tracing::info!(path = %relative, "Upload stored");
            Ok(Json(json!({ "success": true, "filename": name, "path": relative })))
        }
        Err(e) => {
            let _ = fs::remove_file(&partial).await;
            Err(e)
        }
    }
}

async fn place_upload(state: &LocalState, folder: &str, name: &str, partial: &FsPath) -> Result<String, LocalError> {
    let dir = state.resolve(folder)?;
    fs::create_dir_all(&dir)
        .await
        .map_err(|e| LocalError::io("Failed to create directory", e))?;
    fs::rename(partial, dir.join(name))
        .await
        .map_err(|e| LocalError::io("Failed to store file", e))?;

    let mut parts: Vec<String> = dir
        .strip_prefix(state.root())
        .map(|rel| rel.components().map(|c| c.as_os_str().to_string_lossy().into_owned()).collect())
        .unwrap_or_default();
    parts.push(name.to_string());
    Ok(parts.join("/"))
}

async fn download_folder(State(state): State<LocalState>, Query(query): Query<PathQuery>) -> Result<Response, LocalError> {
    let relative = query.required()?;
    let dir = state.resolve(relative)?;

    let metadata = match fs::metadata(&dir).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LocalError::NotFound(relative.to_string())),
        Err(e) => return Err(LocalError::io("Failed to read folder", e)),
    };
    if !metadata.is_dir() {
        return Err(LocalError::BadRequest(format!("Not a folder: {}", relative)));
    }

    let archive_dir = dir.clone();
    let bytes = tokio::task::spawn_blocking(move || archive::zip_directory(&archive_dir))
        .await
        .map_err(|e| LocalError::Internal(format!("Archive task failed: {}", e)))?
        .map_err(|e| LocalError::Internal(format!("{:#}", e)))?;

    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "uploads".to_string());
    tracing::info!(path = %relative, bytes = bytes.len(), "Folder archived");

    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.zip\"", listing::encode_component(&name)),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn delete_path(
    State(state): State<LocalState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<serde_json::Value>, LocalError> {
    let relative = query.required()?;
    let target = state.resolve(relative)?;
    if is_root(relative) {
        return Err(LocalError::BadRequest("Refusing to delete the uploads root".to_string()));
    }

    let metadata = match fs::symlink_metadata(&target).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LocalError::NotFound(relative.to_string())),
        Err(e) => return Err(LocalError::io("Failed to delete", e)),
    };

    let removed = if metadata.is_dir() {
        fs::remove_dir_all(&target).await
    } else {
        fs::remove_file(&target).await
    };
    removed.map_err(|e| LocalError::io("Failed to delete", e))?;

    tracing::info!(path = %relative, "Deleted");
    Ok(Json(json!({ "success": true })))
}

async fn serve_upload(State(state): State<LocalState>, Path(relative): Path<String>) -> Result<Response, LocalError> {
    let path = state.resolve(&relative)?;

    let file = match fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LocalError::NotFound(relative)),
        Err(e) => return Err(LocalError::io("Failed to open file", e)),
    };
    let metadata = file
        .metadata()
        .await
        .map_err(|e| LocalError::io("Failed to open file", e))?;
    if !metadata.is_file() {
        return Err(LocalError::NotFound(relative));
    }

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    Ok((
        [
            (header::CONTENT_TYPE, mime.to_string()),
            (header::CONTENT_LENGTH, metadata.len().to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}
