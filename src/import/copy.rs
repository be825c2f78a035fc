//! Whole-file import: the external database becomes the working database.

use std::path::Path;

use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{merge, CopyProgress, ImportSource};
use crate::error::{AppError, Result};

pub const CHUNK_SIZE: usize = 1024 * 1024;

enum ChunkSource {
    File(File),
    Http(reqwest::Response),
}

impl ChunkSource {
    async fn open(source: &ImportSource, client: &Client) -> Result<(Self, Option<u64>)> {
        match source {
            ImportSource::Local(path) => {
                let file = File::open(path)
                    .await
                    .map_err(|e| AppError::access(source.display(), e))?;
                let len = file.metadata().await.ok().map(|m| m.len());
                Ok((ChunkSource::File(file), len))
            }
            ImportSource::Remote(url) => {
                let response = client
                    .get(url.clone())
                    .send()
                    .await
                    .map_err(|e| AppError::access(source.display(), e))?;
                if !response.status().is_success() {
                    return Err(AppError::access(
                        source.display(),
                        format!("HTTP {}", response.status()),
                    ));
                }
                let len = response.content_length();
                Ok((ChunkSource::Http(response), len))
            }
        }
    }

    /// Next chunk into `buf`; an empty chunk means end of input.
    async fn next_chunk(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        buf.clear();
        match self {
            ChunkSource::File(file) => {
                buf.resize(CHUNK_SIZE, 0);
                let n = file.read(buf).await?;
                buf.truncate(n);
            }
            ChunkSource::Http(response) => {
                if let Some(bytes) = response.chunk().await? {
                    buf.extend_from_slice(&bytes);
                }
            }
        }
        Ok(())
    }
}

/// Stream `source` into `dest` (created or truncated), counting bytes into
/// `progress`. Returns the number of bytes written.
pub async fn stream_into(
    source: &ImportSource,
    client: &Client,
    dest: &Path,
    progress: &CopyProgress,
) -> Result<u64> {
    let (mut input, total) = ChunkSource::open(source, client).await?;
    progress.set_total(total);

    let mut output = File::create(dest).await?;
    let mut buf = Vec::with_capacity(CHUNK_SIZE);
    let mut written = 0u64;

    loop {
        input.next_chunk(&mut buf).await?;
        if buf.is_empty() {
            break;
        }
        output.write_all(&buf).await?;
        written += buf.len() as u64;
        progress.add(buf.len() as u64);
    }

    output.flush().await?;
    output.sync_all().await?;
    Ok(written)
}

/// Copy `source` over the database file at `db_path`.
///
/// The data lands in a temporary file beside `db_path` first and replaces it
/// only once the copy is complete, non-empty and readable as a compatible
/// database, so an aborted or failed copy leaves the working database
/// untouched. The caller must reopen its
/// repository afterwards.
pub async fn copy_database(
    source: &ImportSource,
    client: &Client,
    db_path: &Path,
    progress: &CopyProgress,
) -> Result<u64> {
    let parent = db_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let temp = tempfile::Builder::new()
        .prefix(".nr-reader-copy-")
        .tempfile_in(parent)?;

    tracing::info!("Copying database from {}", source.display());
    let copied = stream_into(source, client, temp.path(), progress).await?;
    if copied == 0 {
        tracing::warn!("Copy of {} produced no data", source.display());
        return Err(AppError::EmptyCopy);
    }
    if let Err(e) = merge::verify_database(temp.path(), source).await {
        tracing::warn!("Refusing to replace {} with {}: {}", db_path.display(), source.display(), e);
        return Err(e);
    }

    temp.persist(db_path)?;
    tracing::info!("Replaced {} with {} bytes", db_path.display(), copied);
    Ok(copied)
}
