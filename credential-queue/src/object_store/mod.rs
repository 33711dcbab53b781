//! Encrypted object storage for identity documents.

pub mod adapter;
pub mod cipher;
pub mod helper;

use std::sync::Arc;

use crate::Result;
use crate::config::AppConfig;

pub use adapter::{FsObjectStore, ObjectStoreAdapter};
pub use cipher::{AesGcmCipher, ObjectCipher};
pub use helper::{ObjectStoreHelper, ObjectStoreSettings};

/// Filesystem-backed helper when both a root and a master key are configured.
pub fn helper_from_config(config: &AppConfig) -> Result<Option<ObjectStoreHelper>> {
    let (Some(root), Some(key)) = (&config.object_store_root, &config.object_store_master_key)
    else {
        return Ok(None);
    };
    let cipher = AesGcmCipher::from_hex(key)?;
    Ok(Some(ObjectStoreHelper::new(
        Arc::new(FsObjectStore::new(root)),
        Arc::new(cipher),
        ObjectStoreSettings::default(),
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_from_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().to_string();
        let key = "ab".repeat(32);

        let none = AppConfig::from_lookup(|_| None).unwrap();
        assert!(helper_from_config(&none).unwrap().is_none());

        let config = AppConfig::from_lookup(|k| match k {
            "OBJECT_STORE_ROOT" => Some(root.clone()),
            "OBJECT_STORE_MASTER_KEY" => Some(key.clone()),
            _ => None,
        })
        .unwrap();
        assert!(helper_from_config(&config).unwrap().is_some());

        let bad_key = AppConfig::from_lookup(|k| match k {
            "OBJECT_STORE_ROOT" => Some(root.clone()),
            "OBJECT_STORE_MASTER_KEY" => Some("00".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(helper_from_config(&bad_key).is_err());
    }
}
