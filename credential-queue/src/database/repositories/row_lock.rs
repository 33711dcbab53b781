//! Row-level lock leases for `credential_transaction`.
//!
//! SQLite only has a database-wide write lock, so exclusive row locks are
//! kept as lease rows in `credential_transaction_lock`. Taking a lock is a
//! single upsert that only succeeds when the row is free, already held by the
//! same owner, or held by an expired lease. These methods run on any
//! connection or transaction and do NOT commit.

use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection};
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};

use super::{CREDENTIAL_ENTITY, sql_placeholders};
use crate::database::{DEFAULT_BUSY_TIMEOUT_MS, WritePool};
use crate::database::models::RowLockDbModel;
use crate::database::retry::{is_sqlite_busy_error, retry_on_sqlite_busy};
use crate::database::time::now_ms;
use crate::{Error, Result};

const LOCK_POLL_MIN: Duration = Duration::from_millis(5);
const LOCK_POLL_MAX: Duration = Duration::from_millis(100);
const ROLLBACK_WAIT: Duration = Duration::from_millis(100);

/// New random lock-owner token.
pub fn new_lock_owner() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Lock operations on an existing connection.
pub struct RowLockOps;

impl RowLockOps {
    /// Take or renew the lock on one row. Returns `true` if `owner` holds it afterwards.
    pub async fn try_acquire(
        conn: &mut SqliteConnection,
        credential_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<bool> {
        let now = now_ms();
        let expires_at = now.saturating_add(lease.as_millis() as i64);

        let result = sqlx::query(
            r#"
            INSERT INTO credential_transaction_lock (credential_id, owner, acquired_at, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (credential_id) DO UPDATE SET
                owner = excluded.owner,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE credential_transaction_lock.owner = excluded.owner
               OR credential_transaction_lock.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(credential_id)
        .bind(owner)
        .bind(now)
        .bind(expires_at)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Release the given rows if `owner` holds them.
    pub async fn release(
        conn: &mut SqliteConnection,
        credential_ids: &[String],
        owner: &str,
    ) -> Result<u64> {
        if credential_ids.is_empty() {
            return Ok(0);
        }

        let sql = format!(
            "DELETE FROM credential_transaction_lock WHERE owner = ? AND credential_id IN ({})",
            sql_placeholders(credential_ids.len())
        );
        let mut query = sqlx::query(&sql).bind(owner);
        for id in credential_ids {
            query = query.bind(id);
        }
        let result = query.execute(conn).await?;
        Ok(result.rows_affected())
    }

    /// Release every lock held by `owner`.
    pub async fn release_owner(conn: &mut SqliteConnection, owner: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credential_transaction_lock WHERE owner = ?")
            .bind(owner)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// The live lock on a row, if any.
    pub async fn live_lock(
        conn: &mut SqliteConnection,
        credential_id: &str,
    ) -> Result<Option<RowLockDbModel>> {
        let lock = sqlx::query_as::<_, RowLockDbModel>(
            "SELECT * FROM credential_transaction_lock WHERE credential_id = ? AND expires_at > ?",
        )
        .bind(credential_id)
        .bind(now_ms())
        .fetch_optional(conn)
        .await?;
        Ok(lock)
    }

    /// Delete leases that have already expired.
    pub async fn purge_expired(conn: &mut SqliteConnection) -> Result<u64> {
        let result = sqlx::query("DELETE FROM credential_transaction_lock WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }
}

/// Release `credential_ids` held by `owner` through the write pool.
pub(crate) async fn release_locks(
    write_pool: &WritePool,
    credential_ids: &[String],
    owner: &str,
) -> Result<u64> {
    retry_on_sqlite_busy("release_row_locks", || async {
        let mut conn = write_pool.acquire().await?;
        RowLockOps::release(&mut conn, credential_ids, owner).await
    })
    .await
}

/// Release everything held by `owner` through the write pool.
pub(crate) async fn release_owner_locks(write_pool: &WritePool, owner: &str) -> Result<u64> {
    retry_on_sqlite_busy("release_owner_locks", || async {
        let mut conn = write_pool.acquire().await?;
        RowLockOps::release_owner(&mut conn, owner).await
    })
    .await
}

/// Lock every row in `credential_ids` for `owner`, waiting at most `timeout`.
///
/// Each attempt is its own short write, so the SQLite write lock is never
/// held while waiting. The wait covers both lease rows held by other owners
/// and the store's own write lock: an attempt never waits on the write pool
/// or on `SQLITE_BUSY` past the deadline. On timeout or error, locks taken by
/// this call are released and the call fails; `LockTimeout` is never retried
/// here.
pub(crate) async fn acquire_with_deadline(
    write_pool: &WritePool,
    credential_ids: &[String],
    owner: &str,
    lease: Duration,
    timeout: Duration,
) -> Result<()> {
    let started = Instant::now();
    let deadline = started + timeout;
    let mut acquired: Vec<String> = Vec::with_capacity(credential_ids.len());

    for id in credential_ids {
        let mut poll = LOCK_POLL_MIN;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match try_acquire_within(write_pool, id, owner, lease, remaining).await {
                Ok(true) => {
                    acquired.push(id.clone());
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    rollback_acquired(write_pool, &acquired, owner).await;
                    return Err(e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                rollback_acquired(write_pool, &acquired, owner).await;
                debug!(
                    credential_id = %id,
                    waited = ?started.elapsed(),
                    "Row lock wait timed out"
                );
                return Err(Error::lock_timeout(CREDENTIAL_ENTITY, started.elapsed()));
            }

            trace!(credential_id = %id, "Row lock busy, polling");
            sleep(poll.min(deadline - now)).await;
            poll = (poll * 2).min(LOCK_POLL_MAX);
        }
    }

    Ok(())
}

/// One lock attempt that gives up once `remaining` has passed.
async fn try_acquire_within(
    write_pool: &WritePool,
    credential_id: &str,
    owner: &str,
    lease: Duration,
    remaining: Duration,
) -> Result<bool> {
    let Some(mut conn) = acquire_bounded(write_pool, remaining).await? else {
        return Ok(false);
    };
    let attempt = RowLockOps::try_acquire(&mut conn, credential_id, owner, lease).await;
    restore_busy_timeout(&mut conn).await;

    match attempt {
        Err(e) if is_sqlite_busy_error(&e) => Ok(false),
        other => other,
    }
}

/// A write connection whose waits end after `wait`, or `None` if the pool
/// stayed busy that long.
///
/// Waiting for the pool is cut off by a tokio timeout. Waiting for the SQLite
/// write lock is cut off by lowering the connection's busy timeout, so a busy
/// store fails the next statement with `SQLITE_BUSY` instead of blocking.
async fn acquire_bounded(
    write_pool: &WritePool,
    wait: Duration,
) -> Result<Option<PoolConnection<Sqlite>>> {
    let mut conn = match tokio::time::timeout(wait, write_pool.acquire()).await {
        Ok(conn) => conn?,
        Err(_) => return Ok(None),
    };
    let busy_ms = wait.as_millis().clamp(1, DEFAULT_BUSY_TIMEOUT_MS as u128);
    sqlx::query(&format!("PRAGMA busy_timeout = {busy_ms}"))
        .execute(&mut *conn)
        .await?;
    Ok(Some(conn))
}

async fn restore_busy_timeout(conn: &mut PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query(&format!("PRAGMA busy_timeout = {DEFAULT_BUSY_TIMEOUT_MS}"))
        .execute(&mut **conn)
        .await
    {
        warn!(error = %e, "Failed to restore busy timeout; dropping connection");
        conn.close_on_drop();
    }
}

/// Release locks taken by a failed wait, giving the store at most
/// `ROLLBACK_WAIT` so a busy store cannot stretch the caller's deadline.
async fn rollback_acquired(write_pool: &WritePool, acquired: &[String], owner: &str) {
    if acquired.is_empty() {
        return;
    }
    let released = match acquire_bounded(write_pool, ROLLBACK_WAIT).await {
        Ok(Some(mut conn)) => {
            let released = RowLockOps::release(&mut conn, acquired, owner).await;
            restore_busy_timeout(&mut conn).await;
            released.map(|_| ())
        }
        Ok(None) => Err(Error::lock_timeout(CREDENTIAL_ENTITY, ROLLBACK_WAIT)),
        Err(e) => Err(e),
    };
    if let Err(e) = released {
        // Leases expire on their own; a failed release only delays them.
        warn!(owner = %owner, count = acquired.len(), error = %e, "Failed to release row locks");
    }
}
