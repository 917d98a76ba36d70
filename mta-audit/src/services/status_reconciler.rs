//! Status reconciler
//!
//! Folds audit results into transaction rows. The audit track is always
//! written; the business track only when the organization permits it. Each
//! write is one guarded statement, so replaying a result is a no-op and a
//! failed write leaves the transaction Queued for a later run.

use serde::Serialize;
use sqlx::SqlitePool;

use crate::db::transactions;
use crate::models::{AuditOutcome, AuditResult, PageTally};
use crate::utils::db_retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};

/// A transaction whose verdict could not be persisted
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileFailure {
    pub transaction_id: i64,
    pub error: String,
}

/// Outcome of reconciling one page
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Rows that received a verdict
    pub updated: usize,
    /// Rows no longer Queued in this batch (already reconciled)
    pub unchanged: usize,
    pub failures: Vec<ReconcileFailure>,
    /// Aggregate to add to the batch row
    pub tally: PageTally,
}

#[derive(Clone)]
pub struct StatusReconciler {
    db: SqlitePool,
}

impl StatusReconciler {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Apply every result to its transaction; errors are collected, not raised
    pub async fn reconcile(
        &self,
        batch_id: i64,
        results: &[AuditResult],
        allow_business_status_update: bool,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for result in results {
            report.tally.usage += result.usage;

            let written = retry_on_lock("apply_verdict", DEFAULT_MAX_LOCK_WAIT_MS, || {
                transactions::apply_verdict(&self.db, batch_id, result, allow_business_status_update)
            })
            .await;

            match written {
                Ok(true) => {
                    report.updated += 1;
                    report.tally.processed += 1;
                    match result.outcome {
                        AuditOutcome::Approved => report.tally.approved += 1,
                        AuditOutcome::Rejected => report.tally.rejected += 1,
                    }
                    if result.is_degraded() {
                        report.tally.degraded += 1;
                    }
                }
                Ok(false) => {
                    tracing::debug!(
                        batch_id,
                        transaction_id = result.transaction_id,
                        "Transaction no longer queued in batch, verdict skipped"
                    );
                    report.unchanged += 1;
                }
                Err(e) => {
                    tracing::error!(
                        batch_id,
                        transaction_id = result.transaction_id,
                        error = %e,
                        "Failed to persist audit verdict"
                    );
                    report.failures.push(ReconcileFailure {
                        transaction_id: result.transaction_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::debug!(
            batch_id,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failures.len(),
            "Page reconciled"
        );
        report
    }
}
