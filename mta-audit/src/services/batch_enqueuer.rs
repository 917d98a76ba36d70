//! Batch enqueuer
//!
//! Claims a cohort of transactions into a new InProgress batch. The claim
//! and the history row are written in one database transaction: either the
//! cohort is Queued and bound to the batch, or nothing changed.

use sqlx::SqlitePool;

use mta_common::{Error, Result};

use crate::db::transactions::{self, ClaimScope};
use crate::db::{batches, organizations};
use crate::models::{BatchHandle, BatchTrigger};

#[derive(Clone)]
pub struct BatchEnqueuer {
    db: SqlitePool,
}

impl BatchEnqueuer {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    /// Queue the organization's NotAudited transactions, optionally only `ids`
    pub async fn enqueue(&self, organization_id: i64, ids: Option<&[i64]>) -> Result<BatchHandle> {
        self.enqueue_with_trigger(organization_id, ids, BatchTrigger::Enqueue)
            .await
    }

    pub(crate) async fn enqueue_with_trigger(
        &self,
        organization_id: i64,
        ids: Option<&[i64]>,
        trigger: BatchTrigger,
    ) -> Result<BatchHandle> {
        self.claim(organization_id, ClaimScope::NotAudited, ids, trigger)
            .await
    }

    /// Queue already-audited transactions again
    pub async fn requeue(&self, organization_id: i64, ids: &[i64]) -> Result<BatchHandle> {
        if ids.is_empty() {
            return Err(Error::InvalidInput(
                "requeue requires at least one transaction id".to_string(),
            ));
        }
        self.claim(organization_id, ClaimScope::Audited, Some(ids), BatchTrigger::Requeue)
            .await
    }

    /// Bind Queued transactions left without an active batch into a new one
    pub async fn bind_orphans(&self, organization_id: i64) -> Result<BatchHandle> {
        self.claim(organization_id, ClaimScope::Orphaned, None, BatchTrigger::Scheduled)
            .await
    }

    async fn claim(
        &self,
        organization_id: i64,
        scope: ClaimScope,
        ids: Option<&[i64]>,
        trigger: BatchTrigger,
    ) -> Result<BatchHandle> {
        if !organizations::organization_exists(&self.db, organization_id).await? {
            return Err(Error::NotFound(format!("organization {}", organization_id)));
        }
        if matches!(ids, Some(list) if list.is_empty()) {
            return Ok(BatchHandle::empty(organization_id));
        }

        let mut tx = self.db.begin().await?;
        let batch_id = batches::open_batch(&mut *tx, organization_id, trigger).await?;
        let claimed =
            transactions::claim_for_batch(&mut *tx, organization_id, batch_id, scope, ids).await?;

        if claimed.is_empty() {
            tx.rollback().await?;
            tracing::debug!(organization_id, scope = ?scope, "Nothing to enqueue");
            return Ok(BatchHandle::empty(organization_id));
        }

        batches::attach_cohort(&mut *tx, batch_id, &claimed).await?;
        tx.commit().await?;

        tracing::info!(
            organization_id,
            batch_id,
            queued = claimed.len(),
            trigger = trigger.as_str(),
            "Audit batch enqueued"
        );

        Ok(BatchHandle {
            organization_id,
            batch_id: Some(batch_id),
            queued_count: claimed.len(),
            transaction_ids: claimed,
        })
    }
}
