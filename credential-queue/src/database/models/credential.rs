//! Credential transaction models.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::database::time::{ms_to_datetime, now_ms};

/// One queued credential request (`credential_transaction` row).
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct CredentialDbModel {
    pub id: String,
    /// JSON blob of the credential request, opaque to the queue
    pub request: String,
    /// Status: NEW, ISSUED, FAILED, REPROCESS, STALE or an outer-system code
    pub status_code: String,
    pub status_comment: Option<String>,
    /// Tag of the batch that claimed this row; `None` means unclaimed
    pub batch_id: Option<String>,
    /// Creation time, epoch millis (UTC)
    pub cr_dtimes: i64,
    /// Last mutation time, epoch millis (UTC)
    pub upd_dtimes: i64,
}

impl CredentialDbModel {
    pub fn new(request: impl Into<String>) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.into(),
            status_code: CredentialStatus::New.as_str().to_string(),
            status_comment: None,
            batch_id: None,
            cr_dtimes: now,
            upd_dtimes: now,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.batch_id.is_some()
    }

    pub fn status(&self) -> Option<CredentialStatus> {
        CredentialStatus::parse(&self.status_code)
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        ms_to_datetime(self.cr_dtimes)
    }

    pub fn updated_at(&self) -> chrono::DateTime<chrono::Utc> {
        ms_to_datetime(self.upd_dtimes)
    }
}

/// Well-known credential status codes.
///
/// The column is free text; the outer system may store codes not listed here.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialStatus {
    /// Waiting to be claimed for issuance.
    New,
    /// Credential generated and handed off.
    Issued,
    /// Issuance failed.
    Failed,
    /// Recovered by a reprocess claim and waiting to be issued again.
    Reprocess,
    /// Stuck in processing for too long.
    Stale,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Issued => "ISSUED",
            Self::Failed => "FAILED",
            Self::Reprocess => "REPROCESS",
            Self::Stale => "STALE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "ISSUED" => Some(Self::Issued),
            "FAILED" => Some(Self::Failed),
            "REPROCESS" => Some(Self::Reprocess),
            "STALE" => Some(Self::Stale),
            _ => None,
        }
    }

    /// Statuses that are waiting for issuance.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::New | Self::Reprocess)
    }
}

/// Status predicate of a claim or query: one code or a set of codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
    One(String),
    Any(Vec<String>),
}

impl StatusFilter {
    pub fn any<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Any(codes.into_iter().map(Into::into).collect())
    }

    pub fn codes(&self) -> Vec<&str> {
        match self {
            Self::One(code) => vec![code.as_str()],
            Self::Any(codes) => codes.iter().map(String::as_str).collect(),
        }
    }

    /// An empty set matches nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Any(codes) if codes.is_empty())
    }
}

impl From<&str> for StatusFilter {
    fn from(code: &str) -> Self {
        Self::One(code.to_string())
    }
}

impl From<String> for StatusFilter {
    fn from(code: String) -> Self {
        Self::One(code)
    }
}

impl From<CredentialStatus> for StatusFilter {
    fn from(status: CredentialStatus) -> Self {
        Self::One(status.as_str().to_string())
    }
}

impl From<&[CredentialStatus]> for StatusFilter {
    fn from(statuses: &[CredentialStatus]) -> Self {
        Self::any(statuses.iter().map(CredentialStatus::as_str))
    }
}

impl From<Vec<String>> for StatusFilter {
    fn from(codes: Vec<String>) -> Self {
        Self::Any(codes)
    }
}
