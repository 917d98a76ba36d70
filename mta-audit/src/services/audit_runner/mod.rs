//! Audit runner
//!
//! Drains InProgress batches page by page within a wall-clock budget. Per
//! batch: Idle → Draining → Completed | Failed. A batch whose budget runs out
//! stays InProgress and resumes on the next pass.
//!
//! Passes are serialized by a run lock. Scheduled passes skip when another
//! pass holds it; drain and on-demand calls wait for it.

pub mod scheduler;

pub use scheduler::AuditScheduler;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use mta_common::config::AuditConfig;
use mta_common::Result;

use crate::db::{batches, organizations, transactions, RuleRepository};
use crate::models::{AuditBatch, AuditResult, BatchHandle, BatchStatus, BatchTrigger, PageTally, RuleSet};
use crate::services::batch_enqueuer::BatchEnqueuer;
use crate::services::evaluation_engine::{EvaluationEngine, DEFAULT_MAX_CONCURRENCY};
use crate::services::status_reconciler::{ReconcileFailure, StatusReconciler};
use crate::services::transaction_assembler::TransactionAssembler;

pub const DEFAULT_PAGE_SIZE: u32 = 200;
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(240);

#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub max_concurrency: usize,
    pub page_size: u32,
    /// Wall-clock budget for one pass
    pub time_budget: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
            time_budget: DEFAULT_TIME_BUDGET,
        }
    }
}

impl RunnerSettings {
    pub fn from_config(config: &AuditConfig) -> Self {
        Self {
            max_concurrency: config.max_concurrency.max(1),
            page_size: config.page_size.max(1),
            time_budget: Duration::from_secs(config.time_budget_secs),
        }
    }
}

/// Why a batch was left InProgress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    BudgetExhausted,
    /// Some verdicts could not be persisted; those transactions are still Queued
    Unreconciled,
    StorageError,
}

/// What one pass did to one batch
#[derive(Debug, Clone, Serialize)]
pub struct BatchRunReport {
    pub batch_id: i64,
    pub organization_id: i64,
    pub status: BatchStatus,
    pub pages: u32,
    pub tally: PageTally,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ReconcileFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<AuditResult>,
}

impl BatchRunReport {
    fn new(batch: &AuditBatch) -> Self {
        Self {
            batch_id: batch.id,
            organization_id: batch.organization_id,
            status: batch.status,
            pages: 0,
            tally: PageTally::default(),
            failures: Vec::new(),
            stopped: None,
            error: None,
            results: Vec::new(),
        }
    }
}

/// Summary of one runner pass
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Another pass held the run lock
    pub skipped: bool,
    pub budget_exhausted: bool,
    pub batches: Vec<BatchRunReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl RunSummary {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            started_at: now,
            finished_at: now,
            skipped: false,
            budget_exhausted: false,
            batches: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn processed(&self) -> i64 {
        self.batches.iter().map(|b| b.tally.processed).sum()
    }
}

/// Result of an on-demand enqueue + drain
#[derive(Debug, Clone, Serialize)]
pub struct OnDemandRun {
    pub handle: BatchHandle,
    pub report: Option<BatchRunReport>,
    /// History row after the drain
    pub batch: Option<AuditBatch>,
}

/// Bookkeeping state of a single drain
enum Drain {
    Continue,
    Stop(StopReason),
}

pub struct AuditRunner {
    db: SqlitePool,
    rules: Arc<dyn RuleRepository>,
    assembler: TransactionAssembler,
    engine: EvaluationEngine,
    reconciler: StatusReconciler,
    enqueuer: BatchEnqueuer,
    settings: RunnerSettings,
    run_lock: Arc<Mutex<()>>,
}

impl AuditRunner {
    pub fn new(
        db: SqlitePool,
        rules: Arc<dyn RuleRepository>,
        assembler: TransactionAssembler,
        engine: EvaluationEngine,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            reconciler: StatusReconciler::new(db.clone()),
            enqueuer: BatchEnqueuer::new(db.clone()),
            db,
            rules,
            assembler,
            engine,
            settings,
            run_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn enqueuer(&self) -> &BatchEnqueuer {
        &self.enqueuer
    }

    pub fn is_configured(&self) -> bool {
        self.engine.is_configured()
    }

    /// Whether a pass currently holds the run lock
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Periodic pass: bind orphaned cohorts, then drain every InProgress batch
    ///
    /// Never fails; problems are logged and listed in the summary.
    pub async fn run_scheduled(&self) -> RunSummary {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::info!("Audit pass already running, scheduled pass skipped");
            let mut summary = RunSummary::begin();
            summary.skipped = true;
            return summary;
        };
        let deadline = Instant::now() + self.settings.time_budget;
        self.pass(None, true, deadline).await
    }

    /// Drain existing InProgress batches without enqueuing new work
    pub async fn drain(&self, organization_id: Option<i64>) -> RunSummary {
        let _guard = self.run_lock.lock().await;
        let deadline = Instant::now() + self.settings.time_budget;
        self.pass(organization_id, false, deadline).await
    }

    /// Enqueue and drain one organization's transactions, collecting results
    pub async fn run_on_demand(&self, organization_id: i64, ids: Option<&[i64]>) -> Result<OnDemandRun> {
        let _guard = self.run_lock.lock().await;
        let deadline = Instant::now() + self.settings.time_budget;

        let handle = self
            .enqueuer
            .enqueue_with_trigger(organization_id, ids, BatchTrigger::OnDemand)
            .await?;
        let Some(batch_id) = handle.batch_id else {
            return Ok(OnDemandRun {
                handle,
                report: None,
                batch: None,
            });
        };

        let batch = batches::get_batch(&self.db, batch_id)
            .await?
            .ok_or_else(|| mta_common::Error::NotFound(format!("audit batch {}", batch_id)))?;
        let report = self.drain_batch(&batch, deadline, true).await;
        let batch = batches::get_batch(&self.db, batch_id).await?;

        Ok(OnDemandRun {
            handle,
            report: Some(report),
            batch,
        })
    }

    async fn pass(&self, organization_id: Option<i64>, bind_orphans: bool, deadline: Instant) -> RunSummary {
        let mut summary = RunSummary::begin();

        if Instant::now() >= deadline {
            summary.budget_exhausted = true;
            tracing::info!("Audit budget exhausted before pass started");
            return self.finish(summary);
        }

        if bind_orphans {
            self.bind_orphaned_cohorts(organization_id, &mut summary).await;
        }

        let pending = match batches::in_progress_batches(&self.db, organization_id).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list in-progress batches");
                summary.errors.push(format!("listing in-progress batches: {}", e));
                return self.finish(summary);
            }
        };

        for batch in &pending {
            let report = self.drain_batch(batch, deadline, false).await;
            let exhausted = report.stopped == Some(StopReason::BudgetExhausted);
            if let Some(error) = &report.error {
                summary.errors.push(format!("batch {}: {}", batch.id, error));
            }
            summary.batches.push(report);
            if exhausted {
                summary.budget_exhausted = true;
                break;
            }
        }

        self.finish(summary)
    }

    fn finish(&self, mut summary: RunSummary) -> RunSummary {
        summary.finished_at = Utc::now();
        tracing::info!(
            batches = summary.batches.len(),
            processed = summary.processed(),
            budget_exhausted = summary.budget_exhausted,
            errors = summary.errors.len(),
            "Audit pass finished"
        );
        summary
    }

    /// Wrap Queued transactions left by failed batches into fresh batches
    ///
    /// Organizations that would fail again immediately (no credential or no
    /// active rules) are skipped until their configuration changes.
    async fn bind_orphaned_cohorts(&self, organization_id: Option<i64>, summary: &mut RunSummary) {
        let orgs = match transactions::organizations_with_orphaned_queue(&self.db).await {
            Ok(orgs) => orgs,
            Err(e) => {
                tracing::error!(error = %e, "Failed to look up orphaned queued transactions");
                summary.errors.push(format!("orphan lookup: {}", e));
                return;
            }
        };

        let in_scope = |org: &i64| organization_id.map_or(true, |scope| scope == *org);
        for org in orgs.into_iter().filter(in_scope) {
            if !self.engine.is_configured() {
                tracing::warn!(
                    organization_id = org,
                    "Orphaned queue left unbound: inference credential not configured"
                );
                continue;
            }
            match self.rules.list_active_rules(org).await {
                Ok(rules) if rules.is_empty() => {
                    tracing::warn!(organization_id = org, "Orphaned queue left unbound: no active audit rules");
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(organization_id = org, error = %e, "Orphaned queue left unbound: rule lookup failed");
                    continue;
                }
            }

            if let Err(e) = self.enqueuer.bind_orphans(org).await {
                tracing::error!(organization_id = org, error = %e, "Failed to bind orphaned queue");
                summary.errors.push(format!("organization {}: binding orphaned queue: {}", org, e));
            }
        }
    }

    async fn drain_batch(&self, batch: &AuditBatch, deadline: Instant, collect_results: bool) -> BatchRunReport {
        let mut report = BatchRunReport::new(batch);

        if Instant::now() >= deadline {
            report.stopped = Some(StopReason::BudgetExhausted);
            return report;
        }

        if !self.engine.is_configured() {
            return self
                .fail_batch(report, "inference credential not configured".to_string())
                .await;
        }

        let rules = match self.rules.list_active_rules(batch.organization_id).await {
            Ok(rules) if rules.is_empty() => {
                return self
                    .fail_batch(report, "no active audit rules for organization".to_string())
                    .await;
            }
            Ok(rules) => rules,
            Err(e) => return self.fail_batch(report, format!("rule lookup failed: {}", e)).await,
        };

        let allow_business_status_update =
            match organizations::allows_business_status_update(&self.db, batch.organization_id).await {
                Ok(allow) => allow,
                Err(e) => {
                    return self
                        .fail_batch(report, format!("organization lookup failed: {}", e))
                        .await
                }
            };

        tracing::info!(
            batch_id = batch.id,
            organization_id = batch.organization_id,
            rules = rules.len(),
            allow_business_status_update,
            "Draining audit batch"
        );

        let mut cursor = 0;
        loop {
            let step = self
                .drain_page(
                    batch.id,
                    &mut cursor,
                    &rules,
                    allow_business_status_update,
                    deadline,
                    collect_results,
                    &mut report,
                )
                .await;
            match step {
                Some(Drain::Continue) => continue,
                Some(Drain::Stop(reason)) => {
                    report.stopped = Some(reason);
                    return report;
                }
                None => break,
            }
        }

        let remaining = match transactions::count_queued_in_batch(&self.db, batch.id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                report.error = Some(format!("counting queued transactions: {}", e));
                report.stopped = Some(StopReason::StorageError);
                return report;
            }
        };

        if remaining > 0 {
            tracing::warn!(
                batch_id = batch.id,
                remaining,
                "Batch left in progress with unreconciled transactions"
            );
            report.stopped = Some(StopReason::Unreconciled);
            return report;
        }

        if report.pages == 0 {
            let audited = match transactions::count_audited_in_batch(&self.db, batch.id).await {
                Ok(audited) => audited,
                Err(e) => {
                    report.error = Some(format!("counting audited transactions: {}", e));
                    report.stopped = Some(StopReason::StorageError);
                    return report;
                }
            };
            if audited == 0 {
                return self
                    .fail_batch(report, "batch has no queued transactions".to_string())
                    .await;
            }
        }

        match batches::finalize(&self.db, batch.id, BatchStatus::Completed, None).await {
            Ok(_) => report.status = BatchStatus::Completed,
            Err(e) => {
                tracing::error!(batch_id = batch.id, error = %e, "Failed to complete batch");
                report.error = Some(format!("finalizing batch: {}", e));
                report.stopped = Some(StopReason::StorageError);
            }
        }
        report
    }

    /// Process the next page; `None` once no Queued transactions are left
    #[allow(clippy::too_many_arguments)]
    async fn drain_page(
        &self,
        batch_id: i64,
        cursor: &mut i64,
        rules: &RuleSet,
        allow_business_status_update: bool,
        deadline: Instant,
        collect_results: bool,
        report: &mut BatchRunReport,
    ) -> Option<Drain> {
        if Instant::now() >= deadline {
            tracing::info!(batch_id, pages = report.pages, "Audit budget exhausted, batch stays in progress");
            return Some(Drain::Stop(StopReason::BudgetExhausted));
        }

        let page = match transactions::fetch_queued_page(&self.db, batch_id, *cursor, self.settings.page_size).await {
            Ok(page) => page,
            Err(e) => {
                tracing::error!(batch_id, error = %e, "Failed to fetch queued page");
                report.error = Some(format!("fetching queued page: {}", e));
                return Some(Drain::Stop(StopReason::StorageError));
            }
        };
        let last_id = page.last()?.id;
        *cursor = last_id;

        let payloads = self.assembler.assemble(&page).await;
        let results = self
            .engine
            .evaluate_batch(payloads, rules, self.settings.max_concurrency)
            .await;
        let reconciled = self
            .reconciler
            .reconcile(batch_id, &results, allow_business_status_update)
            .await;

        if let Err(e) = batches::record_page(&self.db, batch_id, &reconciled.tally).await {
            tracing::error!(batch_id, error = %e, "Failed to record page aggregate, counts are rebuilt when the batch finalizes");
            report.error = Some(format!("recording page aggregate: {}", e));
        }

        report.pages += 1;
        report.tally += reconciled.tally;
        report.failures.extend(reconciled.failures);
        if collect_results {
            report.results.extend(results);
        }

        tracing::info!(
            batch_id,
            page = report.pages,
            size = page.len(),
            processed = reconciled.tally.processed,
            rejected = reconciled.tally.rejected,
            degraded = reconciled.tally.degraded,
            "Audit page processed"
        );
        Some(Drain::Continue)
    }

    async fn fail_batch(&self, mut report: BatchRunReport, message: String) -> BatchRunReport {
        tracing::warn!(
            batch_id = report.batch_id,
            organization_id = report.organization_id,
            reason = %message,
            "Audit batch failed"
        );

        match batches::finalize(&self.db, report.batch_id, BatchStatus::Failed, Some(&message)).await {
            Ok(_) => report.status = BatchStatus::Failed,
            Err(e) => {
                tracing::error!(batch_id = report.batch_id, error = %e, "Failed to mark batch failed");
                report.stopped = Some(StopReason::StorageError);
            }
        }

        if report.status == BatchStatus::Failed {
            match transactions::unbind_queued(&self.db, report.batch_id).await {
                Ok(released) if released > 0 => tracing::info!(
                    batch_id = report.batch_id,
                    released,
                    "Queued transactions released from failed batch"
                ),
                Ok(_) => {}
                Err(e) => tracing::error!(
                    batch_id = report.batch_id,
                    error = %e,
                    "Failed to release queued transactions"
                ),
            }
        }

        report.error = Some(message);
        report
    }
}
