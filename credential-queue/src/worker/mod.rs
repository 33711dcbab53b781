//! Batch worker: claims pending credential requests and hands them to a processor.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::database::models::{CredentialDbModel, CredentialStatus, StatusFilter};
use crate::database::repositories::{ClaimStrategy, CredentialRepository};

/// Batch reads per cycle before leaving still-locked items tagged.
const BATCH_READ_ROUNDS: usize = 3;
const BATCH_READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Final status the processor decided for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub id: String,
    pub status: String,
    pub comment: Option<String>,
}

impl ItemOutcome {
    pub fn new(id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: status.into(),
            comment: None,
        }
    }

    pub fn issued(id: impl Into<String>) -> Self {
        Self::new(id, CredentialStatus::Issued.as_str())
    }

    pub fn failed(id: impl Into<String>, comment: impl Into<String>) -> Self {
        Self::new(id, CredentialStatus::Failed.as_str()).with_comment(comment)
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Consumer of claimed batches.
#[async_trait]
pub trait BatchProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// Process a claimed batch. Items without an outcome stay tagged with
    /// `batch_id`; an error releases the whole batch.
    async fn process(
        &self,
        batch_id: &str,
        items: Vec<CredentialDbModel>,
    ) -> Result<Vec<ItemOutcome>>;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub page_size: i64,
    /// Idle sleep when nothing was claimed.
    pub poll_interval: Duration,
    pub strategy: ClaimStrategy,
    pub claim_filter: StatusFilter,
    /// Statuses moved back to `REPROCESS` by the sweep; empty disables it.
    pub reprocess_statuses: Vec<String>,
    pub reprocess_interval: Duration,
    /// First backoff after a failed cycle, doubled per consecutive failure.
    pub error_backoff: Duration,
    pub max_error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            poll_interval: Duration::from_secs(1),
            strategy: ClaimStrategy::SkipLocked,
            claim_filter: StatusFilter::from(
                &[CredentialStatus::New, CredentialStatus::Reprocess][..],
            ),
            reprocess_statuses: Vec::new(),
            reprocess_interval: Duration::from_secs(300),
            error_backoff: Duration::from_millis(500),
            max_error_backoff: Duration::from_secs(30),
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub batch_id: Option<String>,
    pub claimed: u64,
    pub applied: u64,
    pub reprocessed: u64,
}

pub struct BatchWorker {
    repo: Arc<dyn CredentialRepository>,
    processor: Arc<dyn BatchProcessor>,
    config: WorkerConfig,
    last_sweep: parking_lot::Mutex<Option<Instant>>,
}

impl BatchWorker {
    pub fn new(
        repo: Arc<dyn CredentialRepository>,
        processor: Arc<dyn BatchProcessor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            repo,
            processor,
            config,
            last_sweep: parking_lot::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run cycles until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            processor = self.processor.name(),
            strategy = self.config.strategy.name(),
            page_size = self.config.page_size,
            "Batch worker started"
        );

        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let delay = match self.run_once().await {
                Ok(report) => {
                    failures = 0;
                    if report.claimed == 0 {
                        Some(self.config.poll_interval)
                    } else {
                        None
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    if e.is_lock_timeout() {
                        warn!(error = %e, "Claim cycle hit a lock timeout, backing off");
                    } else {
                        error!(error = %e, "Claim cycle failed, backing off");
                    }
                    Some(error_backoff(&self.config, failures))
                }
            };

            if let Some(delay) = delay {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        info!(processor = self.processor.name(), "Batch worker stopped");
    }

    /// One claim/process/apply cycle, preceded by the reprocess sweep when due.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        if self.sweep_due() {
            report.reprocessed = self.reprocess_sweep().await?;
            *self.last_sweep.lock() = Some(Instant::now());
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let claimed = self
            .repo
            .claim_batch(
                &batch_id,
                &self.config.claim_filter,
                self.config.page_size,
                self.config.strategy,
            )
            .await?;
        report.claimed = claimed;
        if claimed == 0 {
            let purged = self.repo.purge_expired_locks().await?;
            if purged > 0 {
                debug!(purged, "Purged expired row locks");
            }
            return Ok(report);
        }
        report.batch_id = Some(batch_id.clone());

        // Rows briefly locked by a concurrent claimer are skipped by the batch
        // read; pick them up on a later round.
        let mut seen = HashSet::new();
        for round in 0..BATCH_READ_ROUNDS {
            let items: Vec<CredentialDbModel> = self
                .repo
                .find_by_batch_id(&batch_id)
                .await?
                .into_iter()
                .filter(|item| seen.insert(item.id.clone()))
                .collect();

            if !items.is_empty() {
                debug!(batch_id = %batch_id, round, visible = items.len(), "Processing batch items");
                report.applied += self.process_items(&batch_id, items).await?;
            }
            if seen.len() as u64 >= claimed {
                break;
            }
            tokio::time::sleep(BATCH_READ_RETRY_DELAY).await;
        }
        if (seen.len() as u64) < claimed {
            warn!(
                batch_id = %batch_id,
                claimed,
                seen = seen.len(),
                "Some claimed items stayed locked elsewhere and remain tagged"
            );
        }

        info!(
            batch_id = %batch_id,
            claimed,
            applied = report.applied,
            "Batch processed by {}",
            self.processor.name()
        );
        Ok(report)
    }

    /// Hand items to the processor and apply its outcomes. Returns how many were applied.
    ///
    /// Only outcomes for items of this batch are applied, and only while the
    /// row still carries `batch_id`.
    async fn process_items(&self, batch_id: &str, items: Vec<CredentialDbModel>) -> Result<u64> {
        let handed: HashSet<String> = items.iter().map(|item| item.id.clone()).collect();
        let outcomes = match self.processor.process(batch_id, items).await {
            Ok(outcomes) => outcomes,
            Err(e) => {
                let released = self.repo.release_batch(batch_id).await?;
                warn!(batch_id = %batch_id, released, error = %e, "Processor failed, batch released");
                return Err(e);
            }
        };

        let mut applied = 0;
        for outcome in &outcomes {
            if !handed.contains(&outcome.id) {
                warn!(batch_id = %batch_id, id = %outcome.id, "Ignoring outcome for an item outside the batch");
                continue;
            }
            match self
                .repo
                .complete_in_batch(
                    batch_id,
                    &outcome.id,
                    &outcome.status,
                    outcome.comment.as_deref(),
                )
                .await
            {
                Ok(true) => applied += 1,
                Ok(false) => {
                    warn!(batch_id = %batch_id, id = %outcome.id, "Item left the batch before its outcome was applied")
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, id = %outcome.id, error = %e, "Failed to apply outcome")
                }
            }
        }
        Ok(applied)
    }

    fn sweep_due(&self) -> bool {
        if self.config.reprocess_statuses.is_empty() {
            return false;
        }
        match *self.last_sweep.lock() {
            Some(at) => at.elapsed() >= self.config.reprocess_interval,
            None => true,
        }
    }

    /// Move failed or stale items back into the pending pipeline as `REPROCESS`.
    async fn reprocess_sweep(&self) -> Result<u64> {
        let tag = uuid::Uuid::new_v4().to_string();
        let statuses: Vec<&str> = self
            .config
            .reprocess_statuses
            .iter()
            .map(String::as_str)
            .collect();
        let moved = self
            .repo
            .claim_for_reprocess(&tag, &statuses, self.config.page_size, self.config.strategy)
            .await?;
        if moved > 0 {
            self.repo.release_batch(&tag).await?;
            info!(moved, "Reprocess sweep requeued items");
        }
        Ok(moved)
    }
}

fn error_backoff(config: &WorkerConfig, failures: u32) -> Duration {
    let factor = 1u32 << failures.saturating_sub(1).min(16);
    config
        .error_backoff
        .saturating_mul(factor)
        .min(config.max_error_backoff)
}
