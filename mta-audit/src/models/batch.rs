//! Audit batch history
//!
//! One row per batch, InProgress until the runner finalizes it as Completed
//! or Failed. Terminal rows are never written again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::str::FromStr;

use mta_common::Error;

use super::audit_result::Usage;

/// Batch lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    InProgress,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::InProgress => "IN_PROGRESS",
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BatchStatus::Completed | BatchStatus::Failed)
    }
}

impl FromStr for BatchStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(BatchStatus::InProgress),
            "COMPLETED" => Ok(BatchStatus::Completed),
            "FAILED" => Ok(BatchStatus::Failed),
            other => Err(Error::Internal(format!("Unknown batch status: {}", other))),
        }
    }
}

/// What opened the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchTrigger {
    /// Explicit enqueue call
    Enqueue,
    /// Explicit re-enqueue of already audited transactions
    Requeue,
    /// Synchronous on-demand run
    OnDemand,
    /// Runner binding an orphaned queued cohort
    Scheduled,
}

impl BatchTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchTrigger::Enqueue => "enqueue",
            BatchTrigger::Requeue => "requeue",
            BatchTrigger::OnDemand => "on_demand",
            BatchTrigger::Scheduled => "scheduled",
        }
    }
}

impl FromStr for BatchTrigger {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enqueue" => Ok(BatchTrigger::Enqueue),
            "requeue" => Ok(BatchTrigger::Requeue),
            "on_demand" => Ok(BatchTrigger::OnDemand),
            "scheduled" => Ok(BatchTrigger::Scheduled),
            other => Err(Error::Internal(format!("Unknown batch trigger: {}", other))),
        }
    }
}

/// Aggregate counters of a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub total: i64,
    /// Transactions whose verdict was written
    pub processed: i64,
    pub approved: i64,
    pub rejected: i64,
    /// Evaluations that fell back to the failure policy
    pub degraded: i64,
}

/// Persisted batch history row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditBatch {
    pub id: i64,
    pub organization_id: i64,
    pub transaction_ids: Vec<i64>,
    pub status: BatchStatus,
    pub trigger: BatchTrigger,
    pub counts: BatchCounts,
    pub usage: Usage,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Returned by the enqueuer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHandle {
    pub organization_id: i64,
    /// None when nothing was selected
    pub batch_id: Option<i64>,
    pub queued_count: usize,
    pub transaction_ids: Vec<i64>,
}

impl BatchHandle {
    pub fn empty(organization_id: i64) -> Self {
        Self {
            organization_id,
            batch_id: None,
            queued_count: 0,
            transaction_ids: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queued_count == 0
    }
}

/// Aggregate of one processed page, added to the batch row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PageTally {
    pub processed: i64,
    pub approved: i64,
    pub rejected: i64,
    pub degraded: i64,
    pub usage: Usage,
}

impl AddAssign for PageTally {
    fn add_assign(&mut self, rhs: Self) {
        self.processed += rhs.processed;
        self.approved += rhs.approved;
        self.rejected += rhs.rejected;
        self.degraded += rhs.degraded;
        self.usage += rhs.usage;
    }
}
