//! Domain models for the audit service

pub mod audit_result;
pub mod batch;
pub mod rule;
pub mod transaction;

pub use audit_result::{AuditNote, AuditOutcome, AuditResult, DegradedReason, Severity, Usage, Violation};
pub use batch::{AuditBatch, BatchCounts, BatchHandle, BatchStatus, BatchTrigger, PageTally};
pub use rule::{ActionKind, AuditRule, Comparator, RuleAction, RuleCondition, RuleSet, Threshold};
pub use transaction::{Attachment, AuditStatus, BusinessStatus, LineItem, Transaction};
