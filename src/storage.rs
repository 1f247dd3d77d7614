//! Local zarr stores and the object storage that finished artifacts are uploaded to.
use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::ReadableWritableListableStorage;

/// Metadata object at the root of a zarr V3 hierarchy.
pub const ROOT_METADATA: &str = "zarr.json";

/// Open (creating if needed) a zarr hierarchy rooted at a local directory.
pub fn open_filesystem_store(path: &Path) -> crate::Result<ReadableWritableListableStorage> {
    std::fs::create_dir_all(path)?;
    let store = FilesystemStore::new(path).map_err(crate::Error::wrap)?;
    Ok(Arc::new(store))
}

/// Open an existing zarr hierarchy without creating anything.
pub fn open_existing_store(path: &Path) -> crate::Result<ReadableWritableListableStorage> {
    if !path.is_dir() {
        return Err(crate::Error::general(format!(
            "no zarr hierarchy at {}",
            path.display()
        )));
    }
    let store = FilesystemStore::new(path).map_err(crate::Error::wrap)?;
    Ok(Arc::new(store))
}

/// Total size in bytes of the files under `path`.
pub fn directory_size(path: &Path) -> crate::Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path) {
        let entry = entry.map_err(crate::Error::wrap)?;
        if entry.file_type().is_file() {
            total += entry.metadata().map_err(crate::Error::wrap)?.len();
        }
    }
    Ok(total)
}

/// Files under a tree, relative to it, with the root `zarr.json` last.
///
/// An uploaded tree is checked for by its root metadata, so that object must only exist once
/// everything else has been copied.
pub(crate) fn upload_order(root: &Path) -> crate::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut root_metadata = None;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(crate::Error::wrap)?;
        if entry.file_type().is_dir() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(crate::Error::wrap)?
            .to_path_buf();
        if relative == Path::new(ROOT_METADATA) {
            root_metadata = Some(relative);
        } else {
            files.push(relative);
        }
    }
    files.extend(root_metadata);
    Ok(files)
}

/// S3-style object storage, addressed by key on upload and by URI afterwards.
pub trait ObjectStorage {
    /// The URI an object uploaded under `key` is published at.
    fn uri(&self, key: &str) -> String;

    /// Upload a file, or a directory tree under the key as a prefix, returning its URI.
    fn put(&self, local_path: &Path, key: &str) -> crate::Result<String>;

    fn exists(&self, uri: &str) -> crate::Result<bool>;
}

/// Object storage backed by a local directory, publishing URIs under `base_uri`.
#[derive(Debug, Clone)]
pub struct LocalObjectStorage {
    root: PathBuf,
    base_uri: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, base_uri: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
        }
    }

    fn local_path(&self, uri: &str) -> Option<PathBuf> {
        let key = uri.strip_prefix(&self.base_uri)?.trim_start_matches('/');
        Some(self.root.join(key))
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn uri(&self, key: &str) -> String {
        format!("{}/{}", self.base_uri, key.trim_start_matches('/'))
    }

    fn put(&self, local_path: &Path, key: &str) -> crate::Result<String> {
        let dest = self.root.join(key.trim_start_matches('/'));
        if local_path.is_dir() {
            let files = upload_order(local_path)?;
            for relative in &files {
                let target = dest.join(relative);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(local_path.join(relative), &target)?;
            }
            log::debug!("uploaded {} files under {key}", files.len());
        } else {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(local_path, &dest)?;
        }
        Ok(self.uri(key))
    }

    fn exists(&self, uri: &str) -> crate::Result<bool> {
        Ok(self.local_path(uri).is_some_and(|path| path.exists()))
    }
}
