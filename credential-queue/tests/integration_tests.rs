//! Integration tests for the credential-queue database layer and worker.
//!
//! These tests use a real file-backed SQLite database to verify repository
//! operations work correctly with the actual schema.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use credential_queue::database::models::{CredentialDbModel, PageRequest, UinHistoryDbModel};
use credential_queue::database::repositories::{
    ClaimStrategy, CredentialRepository, LockSettings, SqlxCredentialRepository,
    SqlxUinHistoryRepository, UinHistoryRepository,
};
use credential_queue::database::{
    DbPool, WritePool, init_pool_with_size, init_write_pool, run_migrations,
};
use credential_queue::object_store::{
    AesGcmCipher, FsObjectStore, ObjectStoreHelper, ObjectStoreSettings,
};
use credential_queue::worker::{BatchProcessor, BatchWorker, ItemOutcome, WorkerConfig};
use credential_queue::{Error, Result};

struct TestDb {
    pool: DbPool,
    write_pool: WritePool,
    _dir: TempDir,
}

/// Helper to create a file-backed database with migrations applied.
async fn setup_test_db() -> TestDb {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let url = format!(
        "sqlite:{}?mode=rwc",
        dir.path()
            .join("integration.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let write_pool = init_write_pool(&url)
        .await
        .expect("Failed to create write pool");
    run_migrations(&write_pool)
        .await
        .expect("Failed to run migrations");
    let pool = init_pool_with_size(&url, 4)
        .await
        .expect("Failed to create read pool");
    TestDb {
        pool,
        write_pool,
        _dir: dir,
    }
}

fn item(status: &str, cr_dtimes: i64) -> CredentialDbModel {
    let mut item = CredentialDbModel::new("{}");
    item.status_code = status.to_string();
    item.cr_dtimes = cr_dtimes;
    item.upd_dtimes = cr_dtimes;
    item
}

mod database_tests {
    use super::*;

    #[tokio::test]
    async fn test_database_migrations() {
        let db = setup_test_db().await;

        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(&db.pool)
                .await
                .expect("Failed to query tables");
        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();

        assert!(table_names.contains(&"credential_transaction"));
        assert!(table_names.contains(&"credential_transaction_lock"));
        assert!(table_names.contains(&"uin_h"));
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let db = setup_test_db().await;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&db.pool)
            .await
            .expect("Failed to query journal mode");
        assert_eq!(mode, "wal");
    }

    #[tokio::test]
    async fn test_two_claimers_partition_the_backlog() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone());
        for ts in 1..=10 {
            repo.create_credential(&item("NEW", ts)).await.unwrap();
        }

        let a = repo
            .claim_batch("a", &"NEW".into(), 6, ClaimStrategy::SkipLocked)
            .await
            .unwrap();
        let b = repo
            .claim_batch(
                "b",
                &"NEW".into(),
                6,
                ClaimStrategy::lock_wait(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert_eq!((a, b), (6, 4));

        let batch_a = repo.find_by_batch_id("a").await.unwrap();
        let batch_b = repo.find_by_batch_id("b").await.unwrap();
        assert_eq!(
            batch_a.iter().map(|r| r.cr_dtimes).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5, 6]
        );
        assert_eq!(
            batch_b.iter().map(|r| r.cr_dtimes).collect::<Vec<_>>(),
            vec![7, 8, 9, 10]
        );
        assert_eq!(
            repo.claim_batch("c", &"NEW".into(), 6, ClaimStrategy::SkipLocked)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_lock_session_blocks_lock_wait_claims_until_commit() {
        let db = setup_test_db().await;
        let repo = SqlxCredentialRepository::new(db.pool.clone(), db.write_pool.clone())
            .with_lock_settings(LockSettings {
                lock_timeout: Duration::from_millis(100),
                lease: Duration::from_secs(60),
            });
        let row = item("FAILED", 1);
        repo.create_credential(&row).await.unwrap();

        let mut session = repo.begin_lock_session();
        let page = session
            .find_by_status_code_locked("FAILED", PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(page.content.len(), 1);

        let err = repo
            .claim_for_reprocess(
                "re",
                &["FAILED"],
                10,
                ClaimStrategy::lock_wait(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }));

        session.commit().await.unwrap();
        assert_eq!(
            repo.claim_for_reprocess(
                "re",
                &["FAILED"],
                10,
                ClaimStrategy::lock_wait(Duration::from_millis(100)),
            )
            .await
            .unwrap(),
            1
        );
        assert_eq!(
            repo.get_credential(&row.id).await.unwrap().status_code,
            "REPROCESS"
        );
    }

    #[tokio::test]
    async fn test_uin_history() {
        let db = setup_test_db().await;
        let repo = SqlxUinHistoryRepository::new(db.pool.clone(), db.write_pool.clone());
        repo.create_uin_history(&UinHistoryDbModel::new("rid", "hash"))
            .await
            .unwrap();
        assert!(repo.exists_by_reg_id("rid").await.unwrap());
        assert_eq!(
            repo.get_uin_hash_by_rid("rid").await.unwrap().as_deref(),
            Some("hash")
        );
    }
}

mod worker_tests {
    use super::*;

    /// Stores each request as a demographic document, then issues it.
    struct ArchivingProcessor {
        objects: ObjectStoreHelper,
    }

    #[async_trait]
    impl BatchProcessor for ArchivingProcessor {
        fn name(&self) -> &'static str {
            "archiving"
        }

        async fn process(
            &self,
            _batch_id: &str,
            items: Vec<CredentialDbModel>,
        ) -> Result<Vec<ItemOutcome>> {
            let mut outcomes = Vec::with_capacity(items.len());
            for item in items {
                self.objects
                    .put_demographic_object("requests", &item.id, item.request.as_bytes())
                    .await?;
                outcomes.push(ItemOutcome::issued(item.id));
            }
            Ok(outcomes)
        }
    }

    #[tokio::test]
    async fn test_worker_processes_backlog_into_object_store() {
        let db = setup_test_db().await;
        let objects_dir = TempDir::new().unwrap();
        let objects = ObjectStoreHelper::new(
            Arc::new(FsObjectStore::new(objects_dir.path())),
            Arc::new(AesGcmCipher::new([9u8; 32])),
            ObjectStoreSettings::default(),
        );

        let repo = Arc::new(SqlxCredentialRepository::new(
            db.pool.clone(),
            db.write_pool.clone(),
        ));
        let mut ids = Vec::new();
        for ts in 1..=5 {
            let mut row = item("NEW", ts);
            row.request = format!("{{\"n\":{ts}}}");
            repo.create_credential(&row).await.unwrap();
            ids.push(row.id);
        }

        let worker = BatchWorker::new(
            repo.clone(),
            Arc::new(ArchivingProcessor {
                objects: objects.clone(),
            }),
            WorkerConfig {
                page_size: 2,
                ..WorkerConfig::default()
            },
        );

        let mut total = 0;
        loop {
            let report = worker.run_once().await.unwrap();
            if report.claimed == 0 {
                break;
            }
            assert!(report.claimed <= 2);
            total += report.applied;
        }
        assert_eq!(total, 5);
        assert_eq!(repo.count_by_status_code("ISSUED").await.unwrap(), 5);

        let stored = objects
            .get_demographic_object("requests", &ids[0])
            .await
            .unwrap();
        assert_eq!(stored, b"{\"n\":1}");
    }
}
