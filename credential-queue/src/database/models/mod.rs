//! Database models for credential-queue.
//!
//! These models map directly to the database schema.

pub mod credential;
pub mod page;
pub mod row_lock;
pub mod uin_history;

pub use credential::*;
pub use page::*;
pub use row_lock::*;
pub use uin_history::*;
