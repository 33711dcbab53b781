//! Row-lock lease model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Exclusive lock on one `credential_transaction` row.
///
/// A lock is live while `expires_at` is in the future; an expired lock is
/// treated as absent and may be taken over by any owner.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct RowLockDbModel {
    pub credential_id: String,
    /// Lock-session token of the holder
    pub owner: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl RowLockDbModel {
    pub fn is_live_at(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}
