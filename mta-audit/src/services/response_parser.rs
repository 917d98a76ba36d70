//! Response parser and rule resolver
//!
//! Accepts the versioned compact response
//! `{"v":1,"t":<transaction id>,"r":[{"i":<rule id>,"m":"<reason>"}]}` and its
//! long-form aliases. The document is validated before it is interpreted;
//! anything that fails either step becomes a degraded result.

use mta_common::config::FailurePolicy;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;

use crate::models::{AuditResult, DegradedReason, RuleSet, Severity, Usage, Violation};

/// Response schema version this parser understands
pub const RESPONSE_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Deserialize)]
struct CompactResponse {
    #[serde(default, alias = "schema_version")]
    v: Option<Value>,
    #[serde(default, alias = "transaction_id")]
    t: Option<Value>,
    #[serde(alias = "violations")]
    r: Vec<CompactEntry>,
}

#[derive(Debug, Deserialize)]
struct CompactEntry {
    #[serde(alias = "rule_id")]
    i: Value,
    #[serde(default, alias = "message")]
    m: Option<String>,
}

/// Parse a raw model response into an audit result; never fails
pub fn parse(
    raw: &str,
    expected_transaction_id: i64,
    rules: &RuleSet,
    usage: Usage,
    policy: FailurePolicy,
) -> AuditResult {
    try_parse(raw, expected_transaction_id, rules, usage).unwrap_or_else(|reason| {
        tracing::warn!(
            transaction_id = expected_transaction_id,
            reason = %reason,
            "Audit response rejected, applying failure policy"
        );
        AuditResult::degraded(expected_transaction_id, reason, policy)
    })
}

/// Parse, validate and resolve a raw model response
pub fn try_parse(
    raw: &str,
    expected_transaction_id: i64,
    rules: &RuleSet,
    usage: Usage,
) -> Result<AuditResult, DegradedReason> {
    let rejected = |error: String| DegradedReason::Parse {
        error,
        raw: raw.to_string(),
    };

    let object = extract_json_object(raw).ok_or_else(|| rejected("no JSON object in response".to_string()))?;
    let response: CompactResponse =
        serde_json::from_str(object).map_err(|e| rejected(format!("invalid response document: {}", e)))?;

    if let Some(version) = &response.v {
        match as_id(version) {
            Some(v) if v == RESPONSE_SCHEMA_VERSION as i64 => {}
            _ => return Err(rejected(format!("unsupported schema version {}", version))),
        }
    }

    if let Some(txn) = &response.t {
        match as_id(txn) {
            Some(id) if id == expected_transaction_id => {}
            _ => {
                return Err(rejected(format!(
                    "response is for transaction {}, expected {}",
                    txn, expected_transaction_id
                )))
            }
        }
    }

    let violations = resolve(response.r, expected_transaction_id, rules);
    Ok(AuditResult::evaluated(expected_transaction_id, violations, usage))
}

fn resolve(entries: Vec<CompactEntry>, transaction_id: i64, rules: &RuleSet) -> Vec<Violation> {
    let mut seen = HashSet::new();
    let mut violations = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(rule) = as_id(&entry.i).and_then(|id| rules.get(id)) else {
            tracing::warn!(
                transaction_id,
                rule_ref = %entry.i,
                "Response references unknown rule, entry skipped"
            );
            continue;
        };
        if !seen.insert(rule.id) {
            tracing::debug!(transaction_id, rule_id = rule.id, "Duplicate rule entry ignored");
            continue;
        }

        let message = entry
            .m
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| rule.name.clone());

        violations.push(Violation {
            rule_id: rule.id,
            rule_code: rule.rule_code.clone(),
            rule_name: rule.name.clone(),
            message,
            severity: if rule.is_reject() {
                Severity::Reject
            } else {
                Severity::Warning
            },
        });
    }

    violations
}

/// Numeric id from a JSON number or numeric string
fn as_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Locate the JSON object inside fences or surrounding prose
fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ActionKind, AuditOutcome, AuditRule, RuleAction, RuleCondition};

    fn rule(id: i64, reject: bool) -> AuditRule {
        AuditRule {
            id,
            organization_id: 1,
            rule_code: format!("R-{}", id),
            name: format!("Rule {}", id),
            rule_type: "general".to_string(),
            condition: RuleCondition::Described {
                text: "weights must be consistent".to_string(),
            },
            thresholds: Vec::new(),
            metrics: Vec::new(),
            actions: vec![RuleAction {
                kind: if reject { ActionKind::Reject } else { ActionKind::Flag },
                message: None,
            }],
        }
    }

    fn rules() -> RuleSet {
        RuleSet::new(1, vec![rule(10, true), rule(11, false)])
    }

    #[test]
    fn test_compact_response_with_reject_rule() {
        let raw = r#"{"v":1,"t":5,"r":[{"i":10,"m":"net weight off by 4%"}]}"#;
        let result = try_parse(raw, 5, &rules(), Usage::default()).unwrap();
        assert_eq!(result.outcome, AuditOutcome::Rejected);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].rule_code, "R-10");
        assert_eq!(result.violations[0].message, "net weight off by 4%");
    }

    #[test]
    fn test_warning_only_is_approved() {
        let raw = r#"{"v":1,"t":5,"r":[{"i":11}]}"#;
        let result = try_parse(raw, 5, &rules(), Usage::default()).unwrap();
        assert_eq!(result.outcome, AuditOutcome::Approved);
        assert_eq!(result.warning_triggers(), vec!["R-11".to_string()]);
        assert_eq!(result.violations[0].message, "Rule 11");
    }

    #[test]
    fn test_long_form_aliases_and_fences() {
        let raw = "Here is the audit:\n```json\n{\"schema_version\":1,\"transaction_id\":\"5\",\
                   \"violations\":[{\"rule_id\":\"10\",\"message\":\"x\"}]}\n```";
        let result = try_parse(raw, 5, &rules(), Usage::default()).unwrap();
        assert_eq!(result.outcome, AuditOutcome::Rejected);
    }

    #[test]
    fn test_unknown_and_duplicate_rules_skipped() {
        let raw = r#"{"v":1,"r":[{"i":99},{"i":11,"m":"first"},{"i":11,"m":"second"}]}"#;
        let result = try_parse(raw, 5, &rules(), Usage::default()).unwrap();
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].message, "first");
        assert_eq!(result.outcome, AuditOutcome::Approved);
    }

    #[test]
    fn test_transaction_mismatch_is_rejected() {
        let raw = r#"{"v":1,"t":6,"r":[]}"#;
        let err = try_parse(raw, 5, &rules(), Usage::default()).unwrap_err();
        assert!(matches!(err, DegradedReason::Parse { .. }));
    }

    #[test]
    fn test_unsupported_version_is_rejected() {
        let raw = r#"{"v":2,"t":5,"r":[]}"#;
        assert!(try_parse(raw, 5, &rules(), Usage::default()).is_err());
    }

    #[test]
    fn test_garbage_degrades_with_raw_text() {
        let usage = Usage { input_units: 5, output_units: 1, total_units: 6 };
        let result = parse("I cannot help with that", 5, &rules(), usage, FailurePolicy::FailOpen);
        assert!(result.is_degraded());
        assert_eq!(result.outcome, AuditOutcome::Approved);
        assert_eq!(result.usage, Usage::default());
        assert_eq!(result.raw_response.as_deref(), Some("I cannot help with that"));
    }

    #[test]
    fn test_missing_violation_list_is_rejected() {
        let raw = r#"{"v":1,"t":5}"#;
        assert!(try_parse(raw, 5, &rules(), Usage::default()).is_err());
    }

    #[test]
    fn test_usage_carried_on_success() {
        let usage = Usage { input_units: 100, output_units: 10, total_units: 110 };
        let result = try_parse(r#"{"v":1,"t":5,"r":[]}"#, 5, &rules(), usage).unwrap();
        assert_eq!(result.usage, usage);
        assert!(!result.is_degraded());
    }
}
