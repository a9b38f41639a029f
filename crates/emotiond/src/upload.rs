//! Multipart upload intake and transient file lifecycle.

use axum::extract::multipart::{Field, MultipartError};
use axum::extract::Multipart;
use axum::http::StatusCode;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// Multipart field that carries the photo.
pub const UPLOAD_FIELD: &str = "foto";

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("no `foto` file in request")]
    Missing,
    #[error("more than one `foto` file in request")]
    Duplicate,
    #[error("unsupported content type: {0}")]
    UnsupportedType(String),
    #[error("upload exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("malformed multipart body: {0}")]
    Malformed(String),
    #[error("transient storage: {0}")]
    Io(#[from] std::io::Error),
}

/// A transient upload on disk. The file is removed when the guard is
/// released or dropped, whichever happens first.
#[derive(Debug)]
pub struct StoredUpload {
    path: Option<PathBuf>,
    size: usize,
    content_type: Option<String>,
}

impl StoredUpload {
    fn new(path: PathBuf, content_type: Option<String>) -> Self {
        Self {
            path: Some(path),
            size: 0,
            content_type,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Read the stored bytes and delete the file.
    pub async fn into_bytes(mut self) -> Result<Vec<u8>, UploadError> {
        let path = self.path.as_deref().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "upload already released")
        })?;
        let bytes = tokio::fs::read(path).await?;
        if let Some(path) = self.path.take() {
            log_removal(&path, tokio::fs::remove_file(&path).await);
        }
        Ok(bytes)
    }

    /// Delete the file. Failures are logged, never returned; later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(path) = self.path.take() {
            log_removal(&path, std::fs::remove_file(&path));
        }
    }
}

fn log_removal(path: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => tracing::debug!(path = %path.display(), "transient upload removed"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove transient upload"),
    }
}

impl Drop for StoredUpload {
    fn drop(&mut self) {
        self.release();
    }
}

/// Read the multipart body, streaming the single photo field into `dir`.
///
/// Fields other than [`UPLOAD_FIELD`] are skipped.
pub async fn receive(
    multipart: &mut Multipart,
    dir: &Path,
    max_bytes: usize,
) -> Result<StoredUpload, UploadError> {
    let mut stored: Option<StoredUpload> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        if stored.is_some() {
            return Err(UploadError::Duplicate);
        }

        let content_type = field.content_type().map(str::to_owned);
        if let Some(ct) = content_type.as_deref() {
            if !is_accepted_type(ct) {
                return Err(UploadError::UnsupportedType(ct.to_string()));
            }
        }

        stored = Some(store_field(field, dir, content_type, max_bytes).await?);
    }

    stored.ok_or(UploadError::Missing)
}

async fn store_field(
    mut field: Field<'_>,
    dir: &Path,
    content_type: Option<String>,
    max_bytes: usize,
) -> Result<StoredUpload, UploadError> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!("{}.upload", Uuid::new_v4()));
    let mut file = tokio::fs::File::create(&path).await?;
    // from here on the guard owns the file, every early return removes it
    let mut upload = StoredUpload::new(path, content_type);

    while let Some(chunk) = field.chunk().await.map_err(|e| multipart_error(e, max_bytes))? {
        upload.size += chunk.len();
        if upload.size > max_bytes {
            return Err(UploadError::TooLarge { limit: max_bytes });
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    tracing::debug!(
        path = ?upload.path(),
        size = upload.size,
        content_type = ?upload.content_type(),
        "upload stored"
    );
    Ok(upload)
}

/// The body limit layer surfaces as a multipart error with status 413.
fn multipart_error(e: MultipartError, max_bytes: usize) -> UploadError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::TooLarge { limit: max_bytes }
    } else {
        UploadError::Malformed(e.body_text())
    }
}

/// Image types, generic binary, or anything under `image/`.
fn is_accepted_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("image/") || essence == "application/octet-stream"
}
