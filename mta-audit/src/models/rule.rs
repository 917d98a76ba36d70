//! Organization-scoped audit rules
//!
//! Condition, threshold and action columns are stored as JSON and validated
//! into these typed shapes once, when the rule repository reads them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Comparison operator used by conditions and thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Lt,
    Lte,
    Gt,
    Gte,
    Eq,
    Ne,
}

impl Comparator {
    pub fn symbol(&self) -> &'static str {
        match self {
            Comparator::Lt => "<",
            Comparator::Lte => "<=",
            Comparator::Gt => ">",
            Comparator::Gte => ">=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

/// Machine-checkable rule condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleCondition {
    /// `field <comparator> value`
    Comparison {
        field: String,
        comparator: Comparator,
        value: f64,
    },
    /// `field` must lie within `[min, max]`; either bound may be open
    Range {
        field: String,
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// `field` must equal one of `allowed`
    FieldEquals { field: String, allowed: Vec<String> },
    /// Every listed field must be present and non-empty
    RequiredFields { fields: Vec<String> },
    /// Natural-language condition evaluated by the inference service
    Described { text: String },
}

impl RuleCondition {
    /// Structural validation performed at read time
    pub fn validate(&self) -> Result<(), String> {
        match self {
            RuleCondition::Comparison { field, value, .. } => {
                require_name(field, "comparison field")?;
                if !value.is_finite() {
                    return Err("comparison value must be finite".to_string());
                }
            }
            RuleCondition::Range { field, min, max } => {
                require_name(field, "range field")?;
                match (min, max) {
                    (None, None) => return Err("range needs at least one bound".to_string()),
                    (Some(lo), Some(hi)) if lo > hi => {
                        return Err(format!("range min {} exceeds max {}", lo, hi));
                    }
                    _ => {}
                }
            }
            RuleCondition::FieldEquals { field, allowed } => {
                require_name(field, "field_equals field")?;
                if allowed.is_empty() {
                    return Err("field_equals needs at least one allowed value".to_string());
                }
            }
            RuleCondition::RequiredFields { fields } => {
                if fields.is_empty() {
                    return Err("required_fields needs at least one field".to_string());
                }
                for field in fields {
                    require_name(field, "required field")?;
                }
            }
            RuleCondition::Described { text } => require_name(text, "condition text")?,
        }
        Ok(())
    }
}

impl fmt::Display for RuleCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleCondition::Comparison {
                field,
                comparator,
                value,
            } => write!(f, "{} {} {}", field, comparator.symbol(), value),
            RuleCondition::Range { field, min, max } => match (min, max) {
                (Some(lo), Some(hi)) => write!(f, "{} in [{}, {}]", field, lo, hi),
                (Some(lo), None) => write!(f, "{} >= {}", field, lo),
                (None, Some(hi)) => write!(f, "{} <= {}", field, hi),
                (None, None) => write!(f, "{} unbounded", field),
            },
            RuleCondition::FieldEquals { field, allowed } => {
                write!(f, "{} in {{{}}}", field, allowed.join(", "))
            }
            RuleCondition::RequiredFields { fields } => {
                write!(f, "required: {}", fields.join(", "))
            }
            RuleCondition::Described { text } => f.write_str(text),
        }
    }
}

/// Numeric threshold attached to a rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub comparator: Comparator,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Threshold {
    pub fn validate(&self) -> Result<(), String> {
        require_name(&self.metric, "threshold metric")?;
        if !self.value.is_finite() {
            return Err(format!("threshold '{}' value must be finite", self.metric));
        }
        Ok(())
    }
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.metric, self.comparator.symbol(), self.value)?;
        if let Some(unit) = &self.unit {
            write!(f, " {}", unit)?;
        }
        Ok(())
    }
}

/// What happens when a rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Reject,
    Flag,
    Notify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleAction {
    pub kind: ActionKind,
    #[serde(default)]
    pub message: Option<String>,
}

/// An active audit rule belonging to one organization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRule {
    /// Numeric id used in the compact request/response protocol
    pub id: i64,
    pub organization_id: i64,
    /// Stable identifier recorded in trigger lists
    pub rule_code: String,
    pub name: String,
    pub rule_type: String,
    pub condition: RuleCondition,
    pub thresholds: Vec<Threshold>,
    pub metrics: Vec<String>,
    pub actions: Vec<RuleAction>,
}

impl AuditRule {
    /// A rule is reject-tagged iff any of its actions rejects
    pub fn is_reject(&self) -> bool {
        self.actions.iter().any(|a| a.kind == ActionKind::Reject)
    }

    pub fn validate(&self) -> Result<(), String> {
        require_name(&self.rule_code, "rule code")?;
        self.condition.validate()?;
        for threshold in &self.thresholds {
            threshold.validate()?;
        }
        Ok(())
    }
}

/// Compact rule entry sent to the inference service
#[derive(Debug, Serialize)]
struct CompactRule<'a> {
    i: i64,
    n: &'a str,
    c: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    t: Vec<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    m: &'a [String],
}

/// Read-only rule set for one organization, shared across worker tasks
#[derive(Debug, Clone)]
pub struct RuleSet {
    organization_id: i64,
    rules: Arc<Vec<AuditRule>>,
    index: Arc<HashMap<i64, usize>>,
}

impl RuleSet {
    pub fn new(organization_id: i64, rules: Vec<AuditRule>) -> Self {
        let index = rules
            .iter()
            .enumerate()
            .map(|(pos, rule)| (rule.id, pos))
            .collect();
        Self {
            organization_id,
            rules: Arc::new(rules),
            index: Arc::new(index),
        }
    }

    pub fn organization_id(&self) -> i64 {
        self.organization_id
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve a numeric rule id
    pub fn get(&self, rule_id: i64) -> Option<&AuditRule> {
        self.index.get(&rule_id).map(|&pos| &self.rules[pos])
    }

    /// Render the id-keyed listing embedded in every inference request
    pub fn compact_listing(&self) -> Result<String, serde_json::Error> {
        let entries: Vec<CompactRule<'_>> = self
            .rules
            .iter()
            .map(|rule| CompactRule {
                i: rule.id,
                n: &rule.name,
                c: rule.condition.to_string(),
                t: rule.thresholds.iter().map(ToString::to_string).collect(),
                m: &rule.metrics,
            })
            .collect();
        serde_json::to_string(&entries)
    }
}

fn require_name(value: &str, what: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("{} must not be empty", what))
    } else {
        Ok(())
    }
}
