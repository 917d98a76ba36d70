//! Transient per-transaction evaluation output
//!
//! Audit results are never persisted directly. The reconciler folds them
//! into transaction columns and the runner folds them into batch counters.

use chrono::{DateTime, Utc};
use mta_common::config::FailurePolicy;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use thiserror::Error;

use super::transaction::{AuditStatus, BusinessStatus};

/// Longest raw response retained in an audit note
const MAX_RETAINED_RAW_CHARS: usize = 2000;

/// Inference usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_units: i64,
    pub output_units: i64,
    pub total_units: i64,
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_units += rhs.input_units;
        self.output_units += rhs.output_units;
        self.total_units += rhs.total_units;
    }
}

/// Verdict of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Approved,
    Rejected,
}

impl AuditOutcome {
    pub fn audit_status(&self) -> AuditStatus {
        match self {
            AuditOutcome::Approved => AuditStatus::Approved,
            AuditOutcome::Rejected => AuditStatus::Rejected,
        }
    }

    pub fn business_status(&self) -> BusinessStatus {
        match self {
            AuditOutcome::Approved => BusinessStatus::Approved,
            AuditOutcome::Rejected => BusinessStatus::Rejected,
        }
    }

    /// Outcome assigned to an evaluation that could not complete
    pub fn fallback(policy: FailurePolicy) -> Self {
        match policy {
            FailurePolicy::FailOpen => AuditOutcome::Approved,
            FailurePolicy::FailClosed => AuditOutcome::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Reject,
    Warning,
}

/// A resolved rule violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub rule_id: i64,
    pub rule_code: String,
    pub rule_name: String,
    pub message: String,
    pub severity: Severity,
}

/// Why an evaluation task fell back to the failure policy
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DegradedReason {
    #[error("request composition failed: {0}")]
    Composition(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error("response rejected: {error}")]
    Parse { error: String, raw: String },

    #[error("evaluation task aborted: {0}")]
    TaskAborted(String),
}

/// Per-transaction audit output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditResult {
    pub transaction_id: i64,
    pub outcome: AuditOutcome,
    pub violations: Vec<Violation>,
    pub usage: Usage,
    /// Populated when the evaluation failed and the failure policy applied
    pub error: Option<String>,
    /// Raw model text, kept only when it could not be parsed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

/// Compact structured note stored on the transaction
#[derive(Debug, Serialize, Deserialize)]
pub struct AuditNote {
    pub v: u8,
    pub o: AuditOutcome,
    pub r: Vec<NoteEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
    pub u: Usage,
    pub at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NoteEntry {
    pub i: i64,
    pub c: String,
    pub m: String,
    pub s: Severity,
}

impl AuditResult {
    /// Result built from resolved violations
    pub fn evaluated(transaction_id: i64, violations: Vec<Violation>, usage: Usage) -> Self {
        let outcome = if violations.iter().any(|v| v.severity == Severity::Reject) {
            AuditOutcome::Rejected
        } else {
            AuditOutcome::Approved
        };
        Self {
            transaction_id,
            outcome,
            violations,
            usage,
            error: None,
            raw_response: None,
            evaluated_at: Utc::now(),
        }
    }

    /// Fallback result for a failed evaluation: no violations, zero usage
    pub fn degraded(transaction_id: i64, reason: DegradedReason, policy: FailurePolicy) -> Self {
        let raw_response = match &reason {
            DegradedReason::Parse { raw, .. } => Some(truncate_chars(raw, MAX_RETAINED_RAW_CHARS)),
            _ => None,
        };
        Self {
            transaction_id,
            outcome: AuditOutcome::fallback(policy),
            violations: Vec::new(),
            usage: Usage::default(),
            error: Some(reason.to_string()),
            raw_response,
            evaluated_at: Utc::now(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    pub fn reject_triggers(&self) -> Vec<String> {
        self.triggers(Severity::Reject)
    }

    pub fn warning_triggers(&self) -> Vec<String> {
        self.triggers(Severity::Warning)
    }

    fn triggers(&self, severity: Severity) -> Vec<String> {
        self.violations
            .iter()
            .filter(|v| v.severity == severity)
            .map(|v| v.rule_code.clone())
            .collect()
    }

    pub fn note(&self) -> AuditNote {
        AuditNote {
            v: 1,
            o: self.outcome,
            r: self
                .violations
                .iter()
                .map(|v| NoteEntry {
                    i: v.rule_id,
                    c: v.rule_code.clone(),
                    m: v.message.clone(),
                    s: v.severity,
                })
                .collect(),
            e: self.error.clone(),
            u: self.usage,
            at: self.evaluated_at,
            raw: self.raw_response.clone(),
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn violation(rule_id: i64, severity: Severity) -> Violation {
        Violation {
            rule_id,
            rule_code: format!("R-{}", rule_id),
            rule_name: "rule".to_string(),
            message: "fired".to_string(),
            severity,
        }
    }

    #[test]
    fn test_outcome_rejected_only_with_reject_violation() {
        let warn_only = AuditResult::evaluated(1, vec![violation(1, Severity::Warning)], Usage::default());
        assert_eq!(warn_only.outcome, AuditOutcome::Approved);

        let rejected = AuditResult::evaluated(
            1,
            vec![violation(1, Severity::Warning), violation(2, Severity::Reject)],
            Usage::default(),
        );
        assert_eq!(rejected.outcome, AuditOutcome::Rejected);
        assert_eq!(rejected.reject_triggers(), vec!["R-2".to_string()]);
        assert_eq!(rejected.warning_triggers(), vec!["R-1".to_string()]);
    }

    #[test]
    fn test_degraded_fail_open_has_zero_usage() {
        let result = AuditResult::degraded(
            5,
            DegradedReason::Inference("timeout".to_string()),
            FailurePolicy::FailOpen,
        );
        assert_eq!(result.outcome, AuditOutcome::Approved);
        assert!(result.violations.is_empty());
        assert_eq!(result.usage, Usage::default());
        assert!(result.error.as_deref().unwrap().contains("timeout"));
        assert!(result.raw_response.is_none());
    }

    #[test]
    fn test_degraded_fail_closed_rejects() {
        let result = AuditResult::degraded(
            5,
            DegradedReason::TaskAborted("panic".to_string()),
            FailurePolicy::FailClosed,
        );
        assert_eq!(result.outcome, AuditOutcome::Rejected);
    }

    #[test]
    fn test_parse_failure_retains_truncated_raw_text() {
        let raw = "x".repeat(MAX_RETAINED_RAW_CHARS + 50);
        let result = AuditResult::degraded(
            5,
            DegradedReason::Parse {
                error: "no JSON object".to_string(),
                raw,
            },
            FailurePolicy::FailOpen,
        );
        assert_eq!(result.raw_response.unwrap().len(), MAX_RETAINED_RAW_CHARS);
    }

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total += Usage { input_units: 10, output_units: 4, total_units: 14 };
        total += Usage { input_units: 1, output_units: 1, total_units: 2 };
        assert_eq!(total, Usage { input_units: 11, output_units: 5, total_units: 16 });
    }

    #[test]
    fn test_note_uses_compact_keys() {
        let result = AuditResult::evaluated(1, vec![violation(3, Severity::Reject)], Usage::default());
        let json = serde_json::to_value(result.note()).unwrap();
        assert_eq!(json["v"], 1);
        assert_eq!(json["o"], "REJECTED");
        assert_eq!(json["r"][0]["i"], 3);
        assert_eq!(json["r"][0]["s"], "reject");
        assert!(json.get("e").is_none());
    }
}
