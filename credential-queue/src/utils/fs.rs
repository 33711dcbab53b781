//! Filesystem helpers shared across modules.
//!
//! These helpers attach the operation and path to IO errors so that log lines
//! and storage errors say where things went wrong.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure the parent directory of a file path exists with a custom operation label.
pub async fn ensure_parent_dir_with_op(op: &'static str, path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all_with_op(op, parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_parent_dir_creates_nested_dirs() {
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a").join("b").join("object.bin");

        ensure_parent_dir_with_op("creating object directory", &file)
            .await
            .unwrap();

        assert!(dir.path().join("a").join("b").is_dir());
    }

    #[test]
    fn test_io_error_carries_path() {
        let err = io_error(
            "reading object",
            Path::new("/nope/object.bin"),
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        let msg = err.to_string();
        assert!(msg.contains("reading object"));
        assert!(msg.contains("/nope/object.bin"));
    }
}
