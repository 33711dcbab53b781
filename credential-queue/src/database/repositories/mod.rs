//! Repository layer for database access.
//!
//! Repositories hide all SQL behind traits so that the worker and tests can
//! depend on behaviour instead of on sqlx.

pub mod credential;
pub mod lock_session;
pub mod row_lock;
pub mod uin_history;

pub use credential::*;
pub use lock_session::*;
pub use row_lock::*;
pub use uin_history::*;

/// Entity name used in errors raised for `credential_transaction` rows.
pub(crate) const CREDENTIAL_ENTITY: &str = "CredentialTransaction";

/// `?, ?, ?` for an `IN (...)` list of `n` bound values.
pub(crate) fn sql_placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}
