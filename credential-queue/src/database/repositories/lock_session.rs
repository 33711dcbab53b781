//! Lock sessions: the scope for which locked reads hold their row locks.
//!
//! A [`LockSession`] plays the role of the enclosing transaction of a
//! `SELECT ... FOR UPDATE`: every row returned by a locked read stays
//! exclusively locked by the session until [`LockSession::commit`] (or until
//! the lease expires if the session is dropped without a runtime to clean up).

use std::collections::HashSet;
use std::time::Duration;

use sqlx::SqliteConnection;
use tracing::{debug, warn};

use super::row_lock::{
    RowLockOps, acquire_with_deadline, new_lock_owner, release_locks, release_owner_locks,
};
use super::{CREDENTIAL_ENTITY, sql_placeholders};
use crate::database::models::{CredentialDbModel, Page, PageRequest, StatusFilter};
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::time::now_ms;
use crate::database::{DbPool, WritePool, begin_immediate};
use crate::{Error, Result};

/// Default bounded wait of locked reads.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

/// Default lifetime of a row lock lease.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(5 * 60);

/// Lock timing shared by lock sessions and lock-wait claims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// How long a locked read waits for a held row before `LockTimeout`.
    pub lock_timeout: Duration,
    /// How long an acquired lock survives without being released.
    pub lease: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lease: DEFAULT_LOCK_LEASE,
        }
    }
}

/// Scope of exclusive row locks on `credential_transaction`.
pub struct LockSession {
    pool: DbPool,
    write_pool: WritePool,
    owner: String,
    settings: LockSettings,
    held: HashSet<String>,
    finished: bool,
}

impl LockSession {
    pub fn new(pool: DbPool, write_pool: WritePool, settings: LockSettings) -> Self {
        Self {
            pool,
            write_pool,
            owner: new_lock_owner(),
            settings,
            held: HashSet::new(),
            finished: false,
        }
    }

    /// Lock-owner token of this session.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    /// Whether this session locked the row.
    pub fn holds(&self, credential_id: &str) -> bool {
        self.held.contains(credential_id)
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }

    /// Rows with `status`, each exclusively locked for this session.
    ///
    /// Fails with `LockTimeout` if a row stays locked by someone else for
    /// longer than the configured lock timeout.
    pub async fn find_by_status_code_locked(
        &mut self,
        status: &str,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        self.find_locked(&StatusFilter::from(status), page).await
    }

    /// Rows whose status is in `statuses`, each exclusively locked for this session.
    pub async fn find_by_status_codes_locked(
        &mut self,
        statuses: &[&str],
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        self.find_locked(&StatusFilter::any(statuses.iter().copied()), page)
            .await
    }

    async fn find_locked(
        &mut self,
        filter: &StatusFilter,
        page: PageRequest,
    ) -> Result<Page<CredentialDbModel>> {
        if filter.is_empty() {
            return Ok(Page::empty(page));
        }

        let codes = filter.codes();
        let placeholders = sql_placeholders(codes.len());

        let count_sql = format!(
            "SELECT COUNT(*) FROM credential_transaction WHERE status_code IN ({})",
            placeholders
        );
        let mut count_query = sqlx::query_scalar::<_, i64>(&count_sql);
        for code in &codes {
            count_query = count_query.bind(*code);
        }
        let total = count_query.fetch_one(&self.pool).await?.max(0) as u64;

        if page.size == 0 {
            return Ok(Page::new(Vec::new(), page, total));
        }

        let ids_sql = format!(
            r#"
            SELECT id FROM credential_transaction
            WHERE status_code IN ({})
            ORDER BY cr_dtimes, id
            LIMIT ? OFFSET ?
            "#,
            placeholders
        );
        let mut ids_query = sqlx::query_scalar::<_, String>(&ids_sql);
        for code in &codes {
            ids_query = ids_query.bind(*code);
        }
        let candidates = ids_query
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        let newly_locked: Vec<String> = candidates
            .iter()
            .filter(|id| !self.held.contains(*id))
            .cloned()
            .collect();

        acquire_with_deadline(
            &self.write_pool,
            &newly_locked,
            &self.owner,
            self.settings.lease,
            self.settings.lock_timeout,
        )
        .await?;
        self.held.extend(newly_locked.iter().cloned());

        // Rows may have changed while we waited for their locks.
        let rows = self.fetch_by_ids(&candidates).await?;
        let matching: Vec<CredentialDbModel> = rows
            .into_iter()
            .filter(|row| codes.contains(&row.status_code.as_str()))
            .collect();

        let stale: Vec<String> = newly_locked
            .into_iter()
            .filter(|id| !matching.iter().any(|row| &row.id == id))
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "Unlocking rows that changed while waiting");
            release_locks(&self.write_pool, &stale, &self.owner).await?;
            for id in &stale {
                self.held.remove(id);
            }
        }

        Ok(Page::new(matching, page, total))
    }

    async fn fetch_by_ids(&self, ids: &[String]) -> Result<Vec<CredentialDbModel>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT * FROM credential_transaction WHERE id IN ({}) ORDER BY cr_dtimes, id",
            sql_placeholders(ids.len())
        );
        let mut query = sqlx::query_as::<_, CredentialDbModel>(&sql);
        for id in ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    /// Rows tagged with `batch_id`, oldest first, skipping rows locked by
    /// anyone else. Returned rows are locked for this session.
    pub async fn find_by_batch_id(&mut self, batch_id: &str) -> Result<Vec<CredentialDbModel>> {
        let owner = self.owner.clone();
        let lease = self.settings.lease;

        let rows = retry_on_sqlite_busy("lock_session_find_by_batch_id", || async {
            let mut tx = begin_immediate(&self.write_pool).await?;
            let rows = select_batch_skip_locked(&mut tx, batch_id, Some(&owner)).await?;
            for row in &rows {
                if !RowLockOps::try_acquire(&mut tx, &row.id, &owner, lease).await? {
                    // Cannot happen under BEGIN IMMEDIATE; the select filtered live locks.
                    return Err(Error::Database(format!(
                        "row {} was locked concurrently inside a write transaction",
                        row.id
                    )));
                }
            }
            tx.commit().await?;
            Ok(rows)
        })
        .await?;

        self.held.extend(rows.iter().map(|row| row.id.clone()));
        Ok(rows)
    }

    /// Set the status of a row this session holds, clearing its batch tag.
    pub async fn update_status(
        &mut self,
        id: &str,
        status: &str,
        comment: Option<&str>,
    ) -> Result<()> {
        let owner = self.owner.clone();
        let updated = retry_on_sqlite_busy("lock_session_update_status", || async {
            let now = now_ms();
            let result = sqlx::query(
                r#"
                UPDATE credential_transaction
                SET status_code = ?, status_comment = ?, batch_id = NULL, upd_dtimes = ?
                WHERE id = ?
                  AND EXISTS (
                      SELECT 1 FROM credential_transaction_lock l
                      WHERE l.credential_id = credential_transaction.id
                        AND l.owner = ?
                        AND l.expires_at > ?
                  )
                "#,
            )
            .bind(status)
            .bind(comment)
            .bind(now)
            .bind(id)
            .bind(&owner)
            .bind(now)
            .execute(&self.write_pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 1 {
            return Ok(());
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM credential_transaction WHERE id = ?)")
                .bind(id)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Err(Error::lock_not_held(CREDENTIAL_ENTITY, id))
        } else {
            Err(Error::not_found(CREDENTIAL_ENTITY, id))
        }
    }

    /// Release every lock held by this session.
    pub async fn commit(mut self) -> Result<u64> {
        let released = release_owner_locks(&self.write_pool, &self.owner).await?;
        self.held.clear();
        self.finished = true;
        debug!(owner = %self.owner, released, "Lock session committed");
        Ok(released)
    }
}

impl Drop for LockSession {
    fn drop(&mut self) {
        if self.finished || self.held.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(
                owner = %self.owner,
                "Lock session dropped outside a runtime; locks expire with their lease"
            );
            return;
        };
        let write_pool = self.write_pool.clone();
        let owner = std::mem::take(&mut self.owner);
        handle.spawn(async move {
            if let Err(e) = release_owner_locks(&write_pool, &owner).await {
                warn!(owner = %owner, error = %e, "Failed to release locks of dropped session");
            }
        });
    }
}

/// Rows of a batch that no other live lock holder owns, oldest first.
///
/// `own_owner` rows locked by that owner are not considered locked.
pub(crate) async fn select_batch_skip_locked(
    conn: &mut SqliteConnection,
    batch_id: &str,
    own_owner: Option<&str>,
) -> Result<Vec<CredentialDbModel>> {
    let rows = sqlx::query_as::<_, CredentialDbModel>(
        r#"
        SELECT ct.* FROM credential_transaction ct
        WHERE ct.batch_id = ?
          AND NOT EXISTS (
              SELECT 1 FROM credential_transaction_lock l
              WHERE l.credential_id = ct.id
                AND l.expires_at > ?
                AND (? IS NULL OR l.owner <> ?)
          )
        ORDER BY ct.cr_dtimes, ct.id
        "#,
    )
    .bind(batch_id)
    .bind(now_ms())
    .bind(own_owner)
    .bind(own_owner)
    .fetch_all(conn)
    .await?;
    Ok(rows)
}
