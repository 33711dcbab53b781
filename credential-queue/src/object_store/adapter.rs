//! Object store backends.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use crate::utils::fs::{ensure_parent_dir_with_op, io_error};
use crate::{Error, Result};

/// Byte-object storage addressed by `(account, bucket, object_name)`.
#[async_trait]
pub trait ObjectStoreAdapter: Send + Sync {
    async fn exists(&self, account: &str, bucket: &str, object_name: &str) -> Result<bool>;
    async fn get_object(&self, account: &str, bucket: &str, object_name: &str)
    -> Result<Vec<u8>>;
    async fn put_object(
        &self,
        account: &str,
        bucket: &str,
        object_name: &str,
        data: &[u8],
    ) -> Result<()>;
    /// Returns whether an object was removed.
    async fn delete_object(&self, account: &str, bucket: &str, object_name: &str)
    -> Result<bool>;
}

/// Filesystem backend storing objects at `<root>/<account>/<bucket>/<object_name>`.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, account: &str, bucket: &str, object_name: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for part in [account, bucket, object_name] {
            let relative = Path::new(part);
            let valid = !part.is_empty()
                && relative
                    .components()
                    .all(|c| matches!(c, Component::Normal(_)));
            if !valid {
                return Err(Error::validation(format!(
                    "invalid object path component: {part:?}"
                )));
            }
            path.push(relative);
        }
        Ok(path)
    }
}

#[async_trait]
impl ObjectStoreAdapter for FsObjectStore {
    async fn exists(&self, account: &str, bucket: &str, object_name: &str) -> Result<bool> {
        let path = self.object_path(account, bucket, object_name)?;
        tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error("checking object", &path, e))
    }

    async fn get_object(
        &self,
        account: &str,
        bucket: &str,
        object_name: &str,
    ) -> Result<Vec<u8>> {
        let path = self.object_path(account, bucket, object_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::not_found("Object", object_name))
            }
            Err(e) => Err(io_error("reading object", &path, e)),
        }
    }

    async fn put_object(
        &self,
        account: &str,
        bucket: &str,
        object_name: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.object_path(account, bucket, object_name)?;
        ensure_parent_dir_with_op("creating object directory", &path).await?;

        // Write to a sibling temp file first so readers never see a torn object.
        let tmp = path.with_file_name(format!(".{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error("writing object", &tmp, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error("renaming object", &path, e));
        }

        debug!(path = %path.display(), bytes = data.len(), "Object written");
        Ok(())
    }

    async fn delete_object(
        &self,
        account: &str,
        bucket: &str,
        object_name: &str,
    ) -> Result<bool> {
        let path = self.object_path(account, bucket, object_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error("deleting object", &path, e)),
        }
    }
}
