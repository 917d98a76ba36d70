//! Material transfer transactions and their sub-records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use mta_common::Error;

/// Outcome of automated rule evaluation for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    NotAudited,
    Queued,
    Approved,
    Rejected,
}

impl AuditStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditStatus::NotAudited => "NOT_AUDITED",
            AuditStatus::Queued => "QUEUED",
            AuditStatus::Approved => "APPROVED",
            AuditStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for AuditStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NOT_AUDITED" => Ok(AuditStatus::NotAudited),
            "QUEUED" => Ok(AuditStatus::Queued),
            "APPROVED" => Ok(AuditStatus::Approved),
            "REJECTED" => Ok(AuditStatus::Rejected),
            other => Err(Error::Internal(format!("Unknown audit status: {}", other))),
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational workflow status, owned by the approval workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusinessStatus {
    Pending,
    Approved,
    Rejected,
}

impl BusinessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BusinessStatus::Pending => "PENDING",
            BusinessStatus::Approved => "APPROVED",
            BusinessStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for BusinessStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BusinessStatus::Pending),
            "APPROVED" => Ok(BusinessStatus::Approved),
            "REJECTED" => Ok(BusinessStatus::Rejected),
            other => Err(Error::Internal(format!("Unknown business status: {}", other))),
        }
    }
}

/// A logged material transfer event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub organization_id: i64,
    pub reference_no: String,
    pub material_type: Option<String>,
    pub source_site: Option<String>,
    pub destination_site: Option<String>,
    pub vehicle_no: Option<String>,
    pub gross_weight: Option<f64>,
    pub tare_weight: Option<f64>,
    pub net_weight: Option<f64>,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    /// None when the stored value could not be read
    pub recorded_at: Option<DateTime<Utc>>,
    pub audit_status: AuditStatus,
    pub business_status: BusinessStatus,
    /// Stable rule codes of reject-tagged rules that fired
    pub reject_triggers: Vec<String>,
    /// Stable rule codes of non-reject rules that fired
    pub warning_triggers: Vec<String>,
    /// Last structured audit response (opaque JSON)
    pub audit_note: Option<String>,
    /// Batch the transaction is currently queued in
    pub batch_id: Option<i64>,
    pub audited_at: Option<DateTime<Utc>>,
}

/// One line of a transaction's cargo manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub transaction_id: i64,
    pub position: i64,
    pub description: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub weight: Option<f64>,
}

/// Stored binary object attached to a transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub transaction_id: i64,
    pub object_key: String,
    pub content_type: String,
    pub kind: String,
}

impl Attachment {
    /// Only images are handed to the inference service
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}
