//! File storage collaborator.
//!
//! The router hands every completed file pair to a [`FileStore`] and
//! announces the URL it returns. [`DirectoryFileStore`] keeps files on the
//! local disk, one directory per room.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use huddle_core::RoomName;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

/// Storage failures.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The store refused the file.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Persists shared files and returns a URL clients can fetch them from.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store `bytes` as `filename` in `room`. Returns the public URL.
    async fn store(
        &self,
        room: &RoomName,
        filename: &str,
        bytes: Bytes,
    ) -> Result<String, StorageError>;
}

/// Stores files under `<root>/<room>/<filename>`.
///
/// A name already taken in the room gets a unique suffix instead of
/// overwriting: `report.pdf` becomes `report_<32 hex>.pdf`.
#[derive(Debug, Clone)]
pub struct DirectoryFileStore {
    root: PathBuf,
    url_prefix: String,
}

impl DirectoryFileStore {
    /// Create a store rooted at `root`, announcing URLs under `url_prefix`.
    pub fn new(root: impl Into<PathBuf>, url_prefix: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            url_prefix: url_prefix.into().trim_end_matches('/').to_string(),
        }
    }

    async fn create(dir: &Path, name: &str, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(name))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await
    }
}

#[async_trait]
impl FileStore for DirectoryFileStore {
    async fn store(
        &self,
        room: &RoomName,
        filename: &str,
        bytes: Bytes,
    ) -> Result<String, StorageError> {
        if filename.contains(['/', '\\']) || filename == "." || filename == ".." {
            return Err(StorageError::Rejected(format!(
                "file name {filename:?} is not a plain name"
            )));
        }
        let dir = self.root.join(room.as_str());
        tokio::fs::create_dir_all(&dir).await?;

        let stored_name = match Self::create(&dir, filename, &bytes).await {
            Ok(()) => filename.to_string(),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let unique = unique_name(filename);
                Self::create(&dir, &unique, &bytes).await?;
                unique
            }
            Err(e) => return Err(e.into()),
        };
        debug!(room = %room, file = %stored_name, bytes = bytes.len(), "stored file");
        Ok(format!("{}/{}/{}", self.url_prefix, room, stored_name))
    }
}

/// `name.ext` becomes `name_<uuid hex>.ext`; names without an extension
/// (or dotfiles) get the suffix appended.
pub fn unique_name(filename: &str) -> String {
    let suffix = Uuid::now_v7().simple();
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}_{suffix}.{ext}"),
        _ => format!("{filename}_{suffix}"),
    }
}
