//! Rule repository
//!
//! Reads the active rules of one organization. Rules are never shared across
//! organizations. JSON columns are validated into typed rules here; a row
//! that fails validation is skipped and logged so one bad rule cannot block
//! the rest.

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use mta_common::Result;

use crate::models::{AuditRule, RuleSet};

/// Read access to organization-scoped audit rules
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Active rules of `organization_id`, ordered by id
    ///
    /// An empty set is a valid answer, distinct from a storage error.
    async fn list_active_rules(&self, organization_id: i64) -> Result<RuleSet>;
}

/// SQLite-backed rule repository
#[derive(Clone)]
pub struct SqliteRuleRepository {
    db: SqlitePool,
}

impl SqliteRuleRepository {
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RuleRepository for SqliteRuleRepository {
    async fn list_active_rules(&self, organization_id: i64) -> Result<RuleSet> {
        let rows = sqlx::query(
            r#"
            SELECT id, organization_id, rule_code, name, rule_type,
                   condition, thresholds, metrics, actions
            FROM audit_rules
            WHERE organization_id = ? AND active = 1
            ORDER BY id
            "#,
        )
        .bind(organization_id)
        .fetch_all(&self.db)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match parse_rule(row) {
                Ok(rule) => rules.push(rule),
                Err(reason) => {
                    let rule_id: i64 = row.get("id");
                    tracing::warn!(
                        organization_id,
                        rule_id,
                        reason = %reason,
                        "Skipping invalid audit rule"
                    );
                }
            }
        }

        tracing::debug!(
            organization_id,
            active_rules = rules.len(),
            skipped = rows.len() - rules.len(),
            "Loaded active audit rules"
        );

        Ok(RuleSet::new(organization_id, rules))
    }
}

fn parse_rule(row: &SqliteRow) -> std::result::Result<AuditRule, String> {
    let condition: String = row.get("condition");
    let thresholds: String = row.get("thresholds");
    let metrics: String = row.get("metrics");
    let actions: String = row.get("actions");

    let rule = AuditRule {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        rule_code: row.get("rule_code"),
        name: row.get("name"),
        rule_type: row.get("rule_type"),
        condition: serde_json::from_str(&condition).map_err(|e| format!("condition: {}", e))?,
        thresholds: serde_json::from_str(&thresholds).map_err(|e| format!("thresholds: {}", e))?,
        metrics: serde_json::from_str(&metrics).map_err(|e| format!("metrics: {}", e))?,
        actions: serde_json::from_str(&actions).map_err(|e| format!("actions: {}", e))?,
    };
    rule.validate()?;
    Ok(rule)
}
