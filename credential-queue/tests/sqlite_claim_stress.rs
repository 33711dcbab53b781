use dashmap::DashSet;
use rand::random;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;

use credential_queue::database::models::{CredentialDbModel, StatusFilter};
use credential_queue::database::repositories::{
    ClaimStrategy, CredentialRepository, LockSettings, SqlxCredentialRepository,
};
use credential_queue::database::{init_pool_with_size, init_write_pool, run_migrations};

/// Two repositories with their own write pools behave like two processes
/// sharing the database file, so claims really contend for the write lock.
async fn open_repo(db_url: &str) -> Arc<SqlxCredentialRepository> {
    let write_pool = init_write_pool(db_url).await.unwrap();
    let pool = init_pool_with_size(db_url, 8).await.unwrap();
    Arc::new(
        SqlxCredentialRepository::new(pool, write_pool).with_lock_settings(LockSettings {
            lock_timeout: Duration::from_millis(500),
            lease: Duration::from_secs(60),
        }),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn sqlite_claim_stress_no_double_claims_or_lost_items() {
    const ITEMS: usize = 200;
    const WORKERS: usize = 12;
    const PAGE_SIZE: i64 = 7;

    let dir = TempDir::new().unwrap();
    let db_url = format!(
        "sqlite:{}?mode=rwc",
        dir.path()
            .join("stress.db")
            .to_string_lossy()
            .replace('\\', "/")
    );

    let migrator = init_write_pool(&db_url).await.unwrap();
    run_migrations(&migrator).await.unwrap();
    migrator.close().await;

    let first = open_repo(&db_url).await;
    let second = open_repo(&db_url).await;

    for i in 0..ITEMS {
        let mut item = CredentialDbModel::new(format!("{{\"n\":{i}}}"));
        item.cr_dtimes = i as i64;
        first.create_credential(&item).await.unwrap();
    }

    let claimed_ids = Arc::new(DashSet::<String>::new());
    let filter = StatusFilter::from("NEW");

    let mut workers = JoinSet::new();
    for w in 0..WORKERS {
        let repo = if w % 2 == 0 {
            first.clone()
        } else {
            second.clone()
        };
        let strategy = if w % 3 == 0 {
            ClaimStrategy::lock_wait(Duration::from_millis(500))
        } else {
            ClaimStrategy::SkipLocked
        };
        let claimed_ids = claimed_ids.clone();
        let filter = filter.clone();

        workers.spawn(async move {
            loop {
                let batch_id = uuid::Uuid::new_v4().to_string();
                let claimed = match repo.claim_batch(&batch_id, &filter, PAGE_SIZE, strategy).await {
                    Ok(n) => n,
                    Err(e) if e.is_lock_timeout() => {
                        tokio::task::yield_now().await;
                        continue;
                    }
                    Err(e) => panic!("claim failed: {e}"),
                };

                if claimed == 0 {
                    if repo.count_by_status_code("NEW").await.unwrap() == 0 {
                        break;
                    }
                    tokio::task::yield_now().await;
                    continue;
                }
                assert!(claimed <= PAGE_SIZE as u64);

                // Rows can be briefly hidden by another claimer's row lock.
                let mut done = 0u64;
                while done < claimed {
                    let rows = repo.find_by_batch_id(&batch_id).await.unwrap();
                    if rows.is_empty() {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        continue;
                    }
                    for row in rows {
                        assert_eq!(row.batch_id.as_deref(), Some(batch_id.as_str()));
                        let inserted = claimed_ids.insert(row.id.clone());
                        assert!(inserted, "double-claimed item {}", row.id);

                        if random::<u8>() % 3 == 0 {
                            tokio::task::yield_now().await;
                        }
                        let completed = repo
                            .complete_in_batch(&batch_id, &row.id, "ISSUED", None)
                            .await
                            .unwrap();
                        assert!(completed, "item {} left batch {}", row.id, batch_id);
                        done += 1;
                    }
                }
            }
        });
    }

    let joined = tokio::time::timeout(Duration::from_secs(60), async {
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
    })
    .await;
    assert!(joined.is_ok(), "workers timed out (possible deadlock)");

    assert_eq!(claimed_ids.len(), ITEMS, "not all items were claimed");
    assert_eq!(first.count_by_status_code("NEW").await.unwrap(), 0);
    assert_eq!(
        first.count_by_status_code("ISSUED").await.unwrap(),
        ITEMS as u64
    );
    assert_eq!(first.release_batch("any").await.unwrap(), 0);
}
