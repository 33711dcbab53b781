//! credential-queue library crate.
//!
//! A durable SQLite work queue of credential requests: status queries,
//! concurrent batch claiming with row locks, the reprocess transition, a
//! batch worker and encrypted object storage for identity documents.

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod object_store;
pub mod utils;
pub mod worker;

pub use error::{Error, Result};
