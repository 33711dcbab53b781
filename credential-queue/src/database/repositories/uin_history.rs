//! UIN history repository.

use async_trait::async_trait;

use crate::Result;
use crate::database::models::UinHistoryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, WritePool};

/// UIN history repository trait.
#[async_trait]
pub trait UinHistoryRepository: Send + Sync {
    async fn create_uin_history(&self, entry: &UinHistoryDbModel) -> Result<()>;
    async fn exists_by_reg_id(&self, reg_id: &str) -> Result<bool>;
    /// UIN hash of the most recent history entry for `reg_id`.
    async fn get_uin_hash_by_rid(&self, reg_id: &str) -> Result<Option<String>>;
}

/// SQLx implementation of UinHistoryRepository.
#[derive(Clone)]
pub struct SqlxUinHistoryRepository {
    pool: DbPool,
    write_pool: WritePool,
}

impl SqlxUinHistoryRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self { pool, write_pool }
    }
}

#[async_trait]
impl UinHistoryRepository for SqlxUinHistoryRepository {
    async fn create_uin_history(&self, entry: &UinHistoryDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_uin_history", || async {
            sqlx::query(
                "INSERT INTO uin_h (reg_id, uin_hash, eff_dtimes, cr_dtimes) VALUES (?, ?, ?, ?)",
            )
            .bind(&entry.reg_id)
            .bind(&entry.uin_hash)
            .bind(entry.eff_dtimes)
            .bind(entry.cr_dtimes)
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn exists_by_reg_id(&self, reg_id: &str) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM uin_h WHERE reg_id = ?)")
                .bind(reg_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists)
    }

    async fn get_uin_hash_by_rid(&self, reg_id: &str) -> Result<Option<String>> {
        let hash = sqlx::query_scalar(
            "SELECT uin_hash FROM uin_h WHERE reg_id = ? ORDER BY eff_dtimes DESC LIMIT 1",
        )
        .bind(reg_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::test_support::setup_test_db;

    #[tokio::test]
    async fn test_uin_history_lookup() {
        let db = setup_test_db().await;
        let repo = SqlxUinHistoryRepository::new(db.pool.clone(), db.write_pool.clone());

        assert!(!repo.exists_by_reg_id("rid-1").await.unwrap());
        assert_eq!(repo.get_uin_hash_by_rid("rid-1").await.unwrap(), None);

        let mut older = UinHistoryDbModel::new("rid-1", "hash-old");
        older.eff_dtimes = 1_000;
        let mut newer = UinHistoryDbModel::new("rid-1", "hash-new");
        newer.eff_dtimes = 2_000;
        repo.create_uin_history(&newer).await.unwrap();
        repo.create_uin_history(&older).await.unwrap();

        assert!(repo.exists_by_reg_id("rid-1").await.unwrap());
        assert!(!repo.exists_by_reg_id("rid-2").await.unwrap());
        assert_eq!(
            repo.get_uin_hash_by_rid("rid-1").await.unwrap().as_deref(),
            Some("hash-new")
        );
    }
}
