//! Object storage for stage outputs.

use std::io::Write;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid destination: {0}")]
    InvalidDestination(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `local` under the `/`-separated key `destination`, returning
    /// the object's URL.
    async fn upload(&self, local: &Path, destination: &str) -> Result<String, StorageError>;
}

/// Object store backed by a bucket directory on local disk.
///
/// Objects are written to a temporary file beside the target and renamed
/// into place, so readers never see a partial object.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key inside the bucket, rejecting anything that escapes it.
    fn object_path(&self, destination: &str) -> Result<PathBuf, StorageError> {
        let key = Path::new(destination.trim_start_matches('/'));
        let mut path = self.root.clone();
        let mut parts = 0;
        for component in key.components() {
            match component {
                Component::Normal(part) => {
                    path.push(part);
                    parts += 1;
                }
                Component::CurDir => {}
                _ => return Err(StorageError::InvalidDestination(destination.to_string())),
            }
        }
        if parts == 0 {
            return Err(StorageError::InvalidDestination(destination.to_string()));
        }
        Ok(path)
    }
}

fn write_object(local: &Path, target: &Path) -> Result<(), StorageError> {
    let parent = target
        .parent()
        .ok_or_else(|| StorageError::InvalidDestination(target.display().to_string()))?;
    std::fs::create_dir_all(parent)?;

    let body = std::fs::read(local)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(&body)?;
    tmp.flush()?;
    tmp.persist(target).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, local: &Path, destination: &str) -> Result<String, StorageError> {
        let target = self.object_path(destination)?;
        let source = local.to_path_buf();
        let dest = target.clone();

        tokio::task::spawn_blocking(move || write_object(&source, &dest))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        let absolute = std::path::absolute(&target)?;
        url::Url::from_file_path(&absolute)
            .map(|u| u.to_string())
            .map_err(|_| StorageError::InvalidDestination(absolute.display().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upload_creates_object_and_url() {
        let bucket = tempdir().unwrap();
        let work = tempdir().unwrap();
        let local = work.path().join("GERAL.txt");
        std::fs::write(&local, "1;2;3\n").unwrap();

        let store = LocalObjectStore::new(bucket.path());
        let url = store
            .upload(&local, "tomados_saida/42-PADARIA/GERAL.txt")
            .await
            .unwrap();

        let object = bucket.path().join("tomados_saida/42-PADARIA/GERAL.txt");
        assert_eq!(std::fs::read_to_string(&object).unwrap(), "1;2;3\n");
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("GERAL.txt"));

        // Uploading again replaces the object.
        std::fs::write(&local, "4;5;6\n").unwrap();
        store
            .upload(&local, "tomados_saida/42-PADARIA/GERAL.txt")
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&object).unwrap(), "4;5;6\n");
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() {
        let bucket = tempdir().unwrap();
        let store = LocalObjectStore::new(bucket.path());
        let local = bucket.path().join("x");
        std::fs::write(&local, "x").unwrap();

        for key in ["../outside.txt", "", "a/../../b"] {
            assert!(matches!(
                store.upload(&local, key).await,
                Err(StorageError::InvalidDestination(_))
            ));
        }
    }
}
