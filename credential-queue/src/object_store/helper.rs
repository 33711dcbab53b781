//! Encrypted demographic and biometric document storage.

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use super::adapter::ObjectStoreAdapter;
use super::cipher::ObjectCipher;
use crate::{Error, Result};

const DEMOGRAPHICS: &str = "Demographics";
const BIOMETRICS: &str = "Biometrics";

/// Where documents live and which key reference encrypts each kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub account: String,
    pub bucket: String,
    pub demo_data_ref_id: String,
    pub bio_data_ref_id: String,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            account: "credential".to_string(),
            bucket: "identity".to_string(),
            demo_data_ref_id: "demographic".to_string(),
            bio_data_ref_id: "biometric".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Demographic,
    Biometric,
}

impl ObjectKind {
    fn folder(self) -> &'static str {
        match self {
            Self::Demographic => DEMOGRAPHICS,
            Self::Biometric => BIOMETRICS,
        }
    }
}

/// Stores documents under `<uin_hash>/<Demographics|Biometrics>/<file_ref_id>`,
/// encrypted at rest.
#[derive(Clone)]
pub struct ObjectStoreHelper {
    store: Arc<dyn ObjectStoreAdapter>,
    cipher: Arc<dyn ObjectCipher>,
    settings: ObjectStoreSettings,
}

impl ObjectStoreHelper {
    pub fn new(
        store: Arc<dyn ObjectStoreAdapter>,
        cipher: Arc<dyn ObjectCipher>,
        settings: ObjectStoreSettings,
    ) -> Self {
        Self {
            store,
            cipher,
            settings,
        }
    }

    pub fn settings(&self) -> &ObjectStoreSettings {
        &self.settings
    }

    pub async fn demographic_object_exists(&self, uin_hash: &str, file_ref_id: &str) -> Result<bool> {
        self.exists(uin_hash, ObjectKind::Demographic, file_ref_id)
            .await
    }

    pub async fn biometric_object_exists(&self, uin_hash: &str, file_ref_id: &str) -> Result<bool> {
        self.exists(uin_hash, ObjectKind::Biometric, file_ref_id)
            .await
    }

    pub async fn put_demographic_object(
        &self,
        uin_hash: &str,
        file_ref_id: &str,
        data: &[u8],
    ) -> Result<()> {
        self.put(uin_hash, ObjectKind::Demographic, file_ref_id, data)
            .await
    }

    pub async fn put_biometric_object(
        &self,
        uin_hash: &str,
        file_ref_id: &str,
        data: &[u8],
    ) -> Result<()> {
        self.put(uin_hash, ObjectKind::Biometric, file_ref_id, data)
            .await
    }

    /// Decrypted document, or `NotFound` if it does not exist.
    pub async fn get_demographic_object(&self, uin_hash: &str, file_ref_id: &str) -> Result<Vec<u8>> {
        self.get(uin_hash, ObjectKind::Demographic, file_ref_id)
            .await
    }

    /// Decrypted document, or `NotFound` if it does not exist.
    pub async fn get_biometric_object(&self, uin_hash: &str, file_ref_id: &str) -> Result<Vec<u8>> {
        self.get(uin_hash, ObjectKind::Biometric, file_ref_id)
            .await
    }

    /// Delete a biometric document; absent documents are ignored.
    pub async fn delete_biometric_object(&self, uin_hash: &str, file_ref_id: &str) -> Result<()> {
        if !self.biometric_object_exists(uin_hash, file_ref_id).await? {
            return Ok(());
        }
        let name = object_name(uin_hash, ObjectKind::Biometric, file_ref_id);
        let started = Instant::now();
        self.store
            .delete_object(&self.settings.account, &self.settings.bucket, &name)
            .await
            .map_err(storage_error)?;
        debug!(object = %name, elapsed_ms = started.elapsed().as_millis() as u64, "delete_object");
        Ok(())
    }

    fn ref_id(&self, kind: ObjectKind) -> &str {
        match kind {
            ObjectKind::Demographic => &self.settings.demo_data_ref_id,
            ObjectKind::Biometric => &self.settings.bio_data_ref_id,
        }
    }

    async fn exists(&self, uin_hash: &str, kind: ObjectKind, file_ref_id: &str) -> Result<bool> {
        let name = object_name(uin_hash, kind, file_ref_id);
        let started = Instant::now();
        let exists = self
            .store
            .exists(&self.settings.account, &self.settings.bucket, &name)
            .await
            .map_err(storage_error)?;
        debug!(object = %name, exists, elapsed_ms = started.elapsed().as_millis() as u64, "exists");
        Ok(exists)
    }

    async fn put(
        &self,
        uin_hash: &str,
        kind: ObjectKind,
        file_ref_id: &str,
        data: &[u8],
    ) -> Result<()> {
        let name = object_name(uin_hash, kind, file_ref_id);

        let started = Instant::now();
        let sealed = self.cipher.encrypt(data, self.ref_id(kind))?;
        debug!(object = %name, elapsed_ms = started.elapsed().as_millis() as u64, "put_object encryption");

        let started = Instant::now();
        self.store
            .put_object(&self.settings.account, &self.settings.bucket, &name, &sealed)
            .await
            .map_err(storage_error)?;
        debug!(object = %name, elapsed_ms = started.elapsed().as_millis() as u64, "put_object");
        Ok(())
    }

    async fn get(&self, uin_hash: &str, kind: ObjectKind, file_ref_id: &str) -> Result<Vec<u8>> {
        if !self.exists(uin_hash, kind, file_ref_id).await? {
            return Err(Error::not_found("Object", file_ref_id));
        }
        let name = object_name(uin_hash, kind, file_ref_id);

        let started = Instant::now();
        let sealed = self
            .store
            .get_object(&self.settings.account, &self.settings.bucket, &name)
            .await
            .map_err(storage_error)?;
        debug!(object = %name, elapsed_ms = started.elapsed().as_millis() as u64, "get_object");

        self.cipher
            .decrypt(&sealed, self.ref_id(kind))
            .map_err(storage_error)
    }
}

fn object_name(uin_hash: &str, kind: ObjectKind, file_ref_id: &str) -> String {
    format!("{}/{}/{}", uin_hash, kind.folder(), file_ref_id)
}

/// Backend failures become `StorageAccess`; missing objects and rejected
/// names keep their own kind.
fn storage_error(err: Error) -> Error {
    match err {
        Error::StorageAccess(_) | Error::NotFound { .. } | Error::Validation(_) => err,
        other => Error::storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{AesGcmCipher, FsObjectStore};
    use async_trait::async_trait;

    fn helper(root: &std::path::Path) -> ObjectStoreHelper {
        ObjectStoreHelper::new(
            Arc::new(FsObjectStore::new(root)),
            Arc::new(AesGcmCipher::new([3u8; 32])),
            ObjectStoreSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_demographic_round_trip_is_encrypted_at_rest() {
        let dir = tempfile::TempDir::new().unwrap();
        let helper = helper(dir.path());

        assert!(!helper.demographic_object_exists("uh", "doc").await.unwrap());
        helper
            .put_demographic_object("uh", "doc", b"{\"name\":\"x\"}")
            .await
            .unwrap();
        assert!(helper.demographic_object_exists("uh", "doc").await.unwrap());
        assert!(!helper.biometric_object_exists("uh", "doc").await.unwrap());

        let on_disk = std::fs::read(dir.path().join("credential/identity/uh/Demographics/doc")).unwrap();
        assert_ne!(on_disk, b"{\"name\":\"x\"}");

        assert_eq!(
            helper.get_demographic_object("uh", "doc").await.unwrap(),
            b"{\"name\":\"x\"}"
        );
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempfile::TempDir::new().unwrap();
        let helper = helper(dir.path());
        assert!(matches!(
            helper.get_biometric_object("uh", "face").await,
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            helper.get_demographic_object("uh", "face").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_biometric_object() {
        let dir = tempfile::TempDir::new().unwrap();
        let helper = helper(dir.path());

        // Absent object is a no-op.
        helper.delete_biometric_object("uh", "face").await.unwrap();

        helper
            .put_biometric_object("uh", "face", b"cbeff")
            .await
            .unwrap();
        assert_eq!(helper.get_biometric_object("uh", "face").await.unwrap(), b"cbeff");
        helper.delete_biometric_object("uh", "face").await.unwrap();
        assert!(!helper.biometric_object_exists("uh", "face").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_object_is_storage_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let helper = helper(dir.path());
        let path = dir.path().join("credential/identity/uh/Biometrics/face");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"not encrypted at all").unwrap();

        assert!(matches!(
            helper.get_biometric_object("uh", "face").await,
            Err(Error::StorageAccess(_))
        ));
    }

    struct FailingStore;

    #[async_trait]
    impl ObjectStoreAdapter for FailingStore {
        async fn exists(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Err(Error::Other("backend unavailable".to_string()))
        }
        async fn get_object(&self, _: &str, _: &str, _: &str) -> Result<Vec<u8>> {
            Err(Error::Other("backend unavailable".to_string()))
        }
        async fn put_object(&self, _: &str, _: &str, _: &str, _: &[u8]) -> Result<()> {
            Err(Error::Other("backend unavailable".to_string()))
        }
        async fn delete_object(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Err(Error::Other("backend unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_backend_failures_map_to_storage_access() {
        let helper = ObjectStoreHelper::new(
            Arc::new(FailingStore),
            Arc::new(AesGcmCipher::new([3u8; 32])),
            ObjectStoreSettings::default(),
        );
        assert!(matches!(
            helper.put_demographic_object("uh", "doc", b"x").await,
            Err(Error::StorageAccess(_))
        ));
        assert!(matches!(
            helper.demographic_object_exists("uh", "doc").await,
            Err(Error::StorageAccess(_))
        ));
    }

    /// Reports every object as present but never has any, like an object
    /// deleted between the existence check and the read.
    struct VanishingStore;

    #[async_trait]
    impl ObjectStoreAdapter for VanishingStore {
        async fn exists(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(true)
        }
        async fn get_object(&self, _: &str, _: &str, name: &str) -> Result<Vec<u8>> {
            Err(Error::not_found("Object", name))
        }
        async fn put_object(&self, _: &str, _: &str, _: &str, _: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn delete_object(&self, _: &str, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_object_removed_after_exists_is_not_found() {
        let helper = ObjectStoreHelper::new(
            Arc::new(VanishingStore),
            Arc::new(AesGcmCipher::new([3u8; 32])),
            ObjectStoreSettings::default(),
        );
        assert!(matches!(
            helper.get_demographic_object("uh", "doc").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_object_name_is_validation_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let helper = helper(dir.path());
        assert!(matches!(
            helper.put_demographic_object("..", "doc", b"x").await,
            Err(Error::Validation(_))
        ));
    }
}
