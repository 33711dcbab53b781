//! UIN history model.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One `uin_h` row: the UIN hash a registration id resolved to.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct UinHistoryDbModel {
    pub reg_id: String,
    pub uin_hash: String,
    /// Effective time, epoch millis (UTC)
    pub eff_dtimes: i64,
    pub cr_dtimes: i64,
}

impl UinHistoryDbModel {
    pub fn new(reg_id: impl Into<String>, uin_hash: impl Into<String>) -> Self {
        let now = crate::database::time::now_ms();
        Self {
            reg_id: reg_id.into(),
            uin_hash: uin_hash.into(),
            eff_dtimes: now,
            cr_dtimes: now,
        }
    }
}
