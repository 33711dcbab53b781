//! Credential transaction repository: status queries and the batch claim engine.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::lock_session::{LockSession, LockSettings, select_batch_skip_locked};
use super::row_lock::{RowLockOps, acquire_with_deadline, new_lock_owner, release_owner_locks};
use super::{CREDENTIAL_ENTITY, sql_placeholders};
use crate::database::models::{
    CredentialDbModel, CredentialStatus, Page, PageRequest, StatusFilter,
};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::{datetime_to_ms, now_ms};
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// How a claim competes with concurrent claimers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimStrategy {
    /// Skip rows locked by anyone else; never waits.
    #[default]
    SkipLocked,
    /// Lock the oldest eligible rows, waiting at most `timeout` for rows
    /// held elsewhere, then tag them with a compare-and-set update.
    LockWait { timeout: Duration },
}

impl ClaimStrategy {
    pub fn lock_wait(timeout: Duration) -> Self {
        Self::LockWait { timeout }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SkipLocked => "skip_locked",
            Self::LockWait { .. } => "lock_wait",
        }
    }
}

/// Credential repository trait.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn create_credential(&self, credential: &CredentialDbModel) -> Result<()>;
    async fn get_credential(&self, id: &str) -> Result<CredentialDbModel>;
    async fn count_by_status_code(&self, status: &str) -> Result<u64>;

    // Status queries
    async fn find_by_status_code(
        &self,
        status: &str,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>>;
    async fn find_by_status_code_since(
        &self,
        status: &str,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>>;
    async fn find_by_status_codes(
        &self,
        statuses: &[&str],
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>>;
    /// Rows tagged with `batch_id`, oldest first, skipping rows locked elsewhere.
    async fn find_by_batch_id(&self, batch_id: &str) -> Result<Vec<CredentialDbModel>>;

    // Claiming
    /// Tag up to `page_size` unclaimed rows matching `filter`, oldest first.
    /// Returns the number of rows tagged.
    async fn claim_batch(
        &self,
        batch_id: &str,
        filter: &StatusFilter,
        page_size: i64,
        strategy: ClaimStrategy,
    ) -> Result<u64>;
    /// Same as [`claim_batch`](Self::claim_batch), also rewriting the status to `REPROCESS`.
    async fn claim_for_reprocess(
        &self,
        batch_id: &str,
        status_codes: &[&str],
        page_size: i64,
        strategy: ClaimStrategy,
    ) -> Result<u64>;

    // Consumer completion
    /// Set the status of a row and clear its batch tag.
    async fn update_status(&self, id: &str, status: &str, comment: Option<&str>) -> Result<()>;
    /// Like `update_status`, but only while the row is still tagged with
    /// `batch_id`. Returns `false` if the row left the batch.
    async fn complete_in_batch(
        &self,
        batch_id: &str,
        id: &str,
        status: &str,
        comment: Option<&str>,
    ) -> Result<bool>;
    /// Clear the batch tag of every row in the batch.
    async fn release_batch(&self, batch_id: &str) -> Result<u64>;
    async fn purge_expired_locks(&self) -> Result<u64>;
}

/// SQLx implementation of CredentialRepository.
#[derive(Clone)]
pub struct SqlxCredentialRepository {
    pool: DbPool,
    write_pool: WritePool,
    lock_settings: LockSettings,
}

impl SqlxCredentialRepository {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self {
            pool,
            write_pool,
            lock_settings: LockSettings::default(),
        }
    }

    pub fn with_lock_settings(mut self, lock_settings: LockSettings) -> Self {
        self.lock_settings = lock_settings;
        self
    }

    pub fn lock_settings(&self) -> LockSettings {
        self.lock_settings
    }

    /// Open a scope for locked reads.
    pub fn begin_lock_session(&self) -> LockSession {
        LockSession::new(
            self.pool.clone(),
            self.write_pool.clone(),
            self.lock_settings,
        )
    }

    async fn find_page(
        &self,
        filter: &StatusFilter,
        since_ms: Option<i64>,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        if filter.is_empty() {
            return Ok(Page::empty(page));
        }

        let codes = filter.codes();
        let mut conditions = vec![format!("status_code IN ({})", sql_placeholders(codes.len()))];
        if since_ms.is_some() {
            conditions.push("upd_dtimes >= ?".to_string());
        }
        let where_clause = conditions.join(" AND ");

        let count_sql = format!(
            "SELECT COUNT(*) FROM credential_transaction WHERE {}",
            where_clause
        );
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for code in &codes {
            count_query = count_query.bind(*code);
        }
        if let Some(since) = since_ms {
            count_query = count_query.bind(since);
        }
        let total = count_query.fetch_one(&self.pool).await?.max(0) as u64;

        if page.size == 0 {
            return Ok(Page::new(Vec::new(), page, total));
        }

        let sql = format!(
            "SELECT * FROM credential_transaction WHERE {} ORDER BY cr_dtimes, id LIMIT ? OFFSET ?",
            where_clause
        );
        let mut query = sqlx::query_as::<_, CredentialDbModel>(&sql);
        for code in &codes {
            query = query.bind(*code);
        }
        if let Some(since) = since_ms {
            query = query.bind(since);
        }
        let content = query
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(Page::new(content, page, total))
    }

    async fn claim(
        &self,
        op_name: &'static str,
        batch_id: &str,
        filter: &StatusFilter,
        page_size: i64,
        rewrite_status: Option<&str>,
        strategy: ClaimStrategy,
    ) -> Result<u64> {
        if batch_id.is_empty() {
            return Err(Error::validation("batch id must not be empty"));
        }
        if page_size <= 0 || filter.is_empty() {
            return Ok(0);
        }

        let claimed = match strategy {
            ClaimStrategy::SkipLocked => {
                self.claim_skip_locked(op_name, batch_id, filter, page_size, rewrite_status)
                    .await?
            }
            ClaimStrategy::LockWait { timeout } => {
                self.claim_lock_wait(
                    op_name,
                    batch_id,
                    filter,
                    page_size,
                    rewrite_status,
                    timeout,
                )
                .await?
            }
        };

        debug!(
            batch_id = %batch_id,
            strategy = strategy.name(),
            requested = page_size,
            claimed,
            "{} finished",
            op_name
        );
        Ok(claimed)
    }

    /// Select and tag in one statement inside one `BEGIN IMMEDIATE` transaction.
    async fn claim_skip_locked(
        &self,
        op_name: &'static str,
        batch_id: &str,
        filter: &StatusFilter,
        page_size: i64,
        rewrite_status: Option<&str>,
    ) -> Result<u64> {
        let codes = filter.codes();
        let set_clause = if rewrite_status.is_some() {
            "status_code = ?, batch_id = ?, upd_dtimes = ?"
        } else {
            "batch_id = ?, upd_dtimes = ?"
        };
        let sql = format!(
            r#"
            UPDATE credential_transaction
            SET {}
            WHERE batch_id IS NULL
              AND id IN (
                  SELECT ct.id FROM credential_transaction ct
                  WHERE ct.status_code IN ({})
                    AND ct.batch_id IS NULL
                    AND NOT EXISTS (
                        SELECT 1 FROM credential_transaction_lock l
                        WHERE l.credential_id = ct.id AND l.expires_at > ?
                    )
                  ORDER BY ct.cr_dtimes, ct.id
                  LIMIT ?
              )
            RETURNING id
            "#,
            set_clause,
            sql_placeholders(codes.len())
        );

        retry_on_sqlite_busy(op_name, || async {
            let now = now_ms();
            let mut tx = begin_immediate(&self.write_pool).await?;

            let mut query = sqlx::query_scalar::<_, String>(&sql);
            if let Some(status) = rewrite_status {
                query = query.bind(status);
            }
            query = query.bind(batch_id).bind(now);
            for code in &codes {
                query = query.bind(*code);
            }
            let ids = query.bind(now).bind(page_size).fetch_all(&mut *tx).await?;

            tx.commit().await?;
            Ok(ids.len() as u64)
        })
        .await
    }

    /// Lock the candidate page with a bounded wait, then compare-and-set each row.
    async fn claim_lock_wait(
        &self,
        op_name: &'static str,
        batch_id: &str,
        filter: &StatusFilter,
        page_size: i64,
        rewrite_status: Option<&str>,
        timeout: Duration,
    ) -> Result<u64> {
        let codes = filter.codes();
        let placeholders = sql_placeholders(codes.len());

        let candidates_sql = format!(
            r#"
            SELECT id FROM credential_transaction
            WHERE status_code IN ({})
              AND batch_id IS NULL
            ORDER BY cr_dtimes, id
            LIMIT ?
            "#,
            placeholders
        );
        let mut candidates_query = sqlx::query_scalar::<_, String>(&candidates_sql);
        for code in &codes {
            candidates_query = candidates_query.bind(*code);
        }
        let candidates = candidates_query
            .bind(page_size)
            .fetch_all(&self.pool)
            .await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let owner = new_lock_owner();
        acquire_with_deadline(
            &self.write_pool,
            &candidates,
            &owner,
            self.lock_settings.lease,
            timeout,
        )
        .await?;

        let set_clause = if rewrite_status.is_some() {
            "status_code = ?, batch_id = ?, upd_dtimes = ?"
        } else {
            "batch_id = ?, upd_dtimes = ?"
        };
        let cas_sql = format!(
            r#"
            UPDATE credential_transaction
            SET {}
            WHERE id = ?
              AND batch_id IS NULL
              AND status_code IN ({})
            "#,
            set_clause, placeholders
        );

        let tagged = retry_on_sqlite_busy(op_name, || async {
            let now = now_ms();
            let mut tx = begin_immediate(&self.write_pool).await?;
            let mut tagged = 0u64;
            for id in &candidates {
                let mut query = sqlx::query(&cas_sql);
                if let Some(status) = rewrite_status {
                    query = query.bind(status);
                }
                query = query.bind(batch_id).bind(now).bind(id);
                for code in &codes {
                    query = query.bind(*code);
                }
                // Zero rows means another claimer won this row; skip it.
                match query.execute(&mut *tx).await {
                    Ok(result) => tagged += result.rows_affected(),
                    Err(e) => {
                        if let Err(rollback_err) = tx.rollback().await {
                            warn!(error = %rollback_err, "Failed to roll back claim");
                        }
                        return Err(e.into());
                    }
                }
            }
            tx.commit().await?;
            Ok(tagged)
        })
        .await;

        if let Err(e) = release_owner_locks(&self.write_pool, &owner).await {
            warn!(owner = %owner, error = %e, "Failed to release claim locks; leases will expire");
        }

        tagged
    }
}

#[async_trait]
impl CredentialRepository for SqlxCredentialRepository {
    async fn create_credential(&self, credential: &CredentialDbModel) -> Result<()> {
        retry_on_sqlite_busy("create_credential", || async {
            sqlx::query(
                r#"
                INSERT INTO credential_transaction
                    (id, request, status_code, status_comment, batch_id, cr_dtimes, upd_dtimes)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&credential.id)
            .bind(&credential.request)
            .bind(&credential.status_code)
            .bind(&credential.status_comment)
            .bind(&credential.batch_id)
            .bind(credential.cr_dtimes)
            .bind(credential.upd_dtimes)
            .execute(&self.write_pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_credential(&self, id: &str) -> Result<CredentialDbModel> {
        sqlx::query_as::<_, CredentialDbModel>("SELECT * FROM credential_transaction WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(CREDENTIAL_ENTITY, id))
    }

    async fn count_by_status_code(&self, status: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM credential_transaction WHERE status_code = ?")
                .bind(status)
                .fetch_one(&self.pool)
                .await?;
        Ok(count.max(0) as u64)
    }

    async fn find_by_status_code(
        &self,
        status: &str,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        self.find_page(&StatusFilter::from(status), None, page)
            .await
    }

    async fn find_by_status_code_since(
        &self,
        status: &str,
        since: DateTime<Utc>,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        self.find_page(
            &StatusFilter::from(status),
            Some(datetime_to_ms(since)),
            page,
        )
        .await
    }

    async fn find_by_status_codes(
        &self,
        statuses: &[&str],
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        self.find_page(&StatusFilter::any(statuses.iter().copied()), None, page)
            .await
    }

    async fn find_by_batch_id(&self, batch_id: &str) -> Result<Vec<CredentialDbModel>> {
        let mut conn = self.pool.acquire().await?;
        select_batch_skip_locked(&mut conn, batch_id, None).await
    }

    async fn claim_batch(
        &self,
        batch_id: &str,
        filter: &StatusFilter,
        page_size: i64,
        strategy: ClaimStrategy,
    ) -> Result<u64> {
        self.claim("claim_batch", batch_id, filter, page_size, None, strategy)
            .await
    }

    async fn claim_for_reprocess(
        &self,
        batch_id: &str,
        status_codes: &[&str],
        page_size: i64,
        strategy: ClaimStrategy,
    ) -> Result<u64> {
        self.claim(
            "claim_for_reprocess",
            batch_id,
            &StatusFilter::any(status_codes.iter().copied()),
            page_size,
            Some(CredentialStatus::Reprocess.as_str()),
            strategy,
        )
        .await
    }

    async fn update_status(&self, id: &str, status: &str, comment: Option<&str>) -> Result<()> {
        let updated = retry_on_sqlite_busy("update_status", || async {
            let result = sqlx::query(
                r#"
                UPDATE credential_transaction
                SET status_code = ?, status_comment = ?, batch_id = NULL, upd_dtimes = ?
                WHERE id = ?
                "#,
            )
            .bind(status)
            .bind(comment)
            .bind(now_ms())
            .bind(id)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::not_found(CREDENTIAL_ENTITY, id));
        }
        Ok(())
    }

    async fn complete_in_batch(
        &self,
        batch_id: &str,
        id: &str,
        status: &str,
        comment: Option<&str>,
    ) -> Result<bool> {
        if batch_id.is_empty() {
            return Err(Error::validation("batch id must not be empty"));
        }
        let updated = retry_on_sqlite_busy("complete_in_batch", || async {
            let result = sqlx::query(
                r#"
                UPDATE credential_transaction
                SET status_code = ?, status_comment = ?, batch_id = NULL, upd_dtimes = ?
                WHERE id = ? AND batch_id = ?
                "#,
            )
            .bind(status)
            .bind(comment)
            .bind(now_ms())
            .bind(id)
            .bind(batch_id)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;
        Ok(updated == 1)
    }

    async fn release_batch(&self, batch_id: &str) -> Result<u64> {
        retry_on_sqlite_busy("release_batch", || async {
            let result = sqlx::query(
                "UPDATE credential_transaction SET batch_id = NULL, upd_dtimes = ? WHERE batch_id = ?",
            )
            .bind(now_ms())
            .bind(batch_id)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn purge_expired_locks(&self) -> Result<u64> {
        retry_on_sqlite_busy("purge_expired_locks", || async {
            let mut conn = self.write_pool.acquire().await?;
            RowLockOps::purge_expired(&mut conn).await
        })
        .await
    }
}
