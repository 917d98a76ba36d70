//! Transaction assembler
//!
//! Builds one self-contained audit payload per transaction: the scalar
//! fields, its line items and signed references to its image attachments.
//! Nothing is mutated, and missing sub-data never blocks a payload: a failed
//! sub-query or signature leaves that part empty.

use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::transactions;
use crate::models::{Attachment, LineItem, Transaction};
use crate::services::object_signer::{ObjectRef, ObjectUrlSigner};

/// Transaction fields the inference service sees
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadFields {
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
    pub recorded_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PayloadLineItem {
    pub description: String,
    pub quantity: Option<f64>,
    pub unit: Option<String>,
    pub weight: Option<f64>,
}

/// Self-contained input for one evaluation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditPayload {
    pub transaction_id: i64,
    pub organization_id: i64,
    pub fields: PayloadFields,
    pub line_items: Vec<PayloadLineItem>,
    /// Attachment kinds in the same order as `object_refs`
    pub attachment_kinds: Vec<String>,
    #[serde(skip)]
    pub object_refs: Vec<ObjectRef>,
}

/// Body text sent alongside the object references
#[derive(Serialize)]
struct PayloadText<'a> {
    t: i64,
    fields: &'a PayloadFields,
    #[serde(skip_serializing_if = "<[PayloadLineItem]>::is_empty")]
    line_items: &'a [PayloadLineItem],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    images: &'a [String],
}

impl AuditPayload {
    /// Compact JSON text of the payload for the inference request
    pub fn to_request_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&PayloadText {
            t: self.transaction_id,
            fields: &self.fields,
            line_items: &self.line_items,
            images: &self.attachment_kinds,
        })
    }
}

/// Builds audit payloads for a page of transactions
#[derive(Clone)]
pub struct TransactionAssembler {
    db: SqlitePool,
    signer: Arc<dyn ObjectUrlSigner>,
}

impl TransactionAssembler {
    pub fn new(db: SqlitePool, signer: Arc<dyn ObjectUrlSigner>) -> Self {
        Self { db, signer }
    }

    /// Assemble payloads in input order; never fails
    pub async fn assemble(&self, transactions: &[Transaction]) -> Vec<AuditPayload> {
        let ids: Vec<i64> = transactions.iter().map(|t| t.id).collect();

        let line_items = match transactions::load_line_items(&self.db, &ids).await {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(
                    transactions = ids.len(),
                    error = %e,
                    "Line item lookup failed, assembling payloads without line items"
                );
                Vec::new()
            }
        };

        let attachments = match transactions::load_attachments(&self.db, &ids).await {
            Ok(attachments) => attachments,
            Err(e) => {
                tracing::warn!(
                    transactions = ids.len(),
                    error = %e,
                    "Attachment lookup failed, assembling payloads without images"
                );
                Vec::new()
            }
        };

        build_payloads(transactions, line_items, attachments, self.signer.as_ref())
    }
}

/// Group sub-records by transaction and build payloads
pub fn build_payloads(
    transactions: &[Transaction],
    line_items: Vec<LineItem>,
    attachments: Vec<Attachment>,
    signer: &dyn ObjectUrlSigner,
) -> Vec<AuditPayload> {
    let mut items_by_txn: HashMap<i64, Vec<PayloadLineItem>> = HashMap::new();
    for item in line_items {
        items_by_txn
            .entry(item.transaction_id)
            .or_default()
            .push(PayloadLineItem {
                description: item.description,
                quantity: item.quantity,
                unit: item.unit,
                weight: item.weight,
            });
    }

    let mut images_by_txn: HashMap<i64, Vec<(String, ObjectRef)>> = HashMap::new();
    for attachment in attachments.into_iter().filter(Attachment::is_image) {
        match signer.sign(&attachment.object_key, &attachment.content_type) {
            Ok(reference) => images_by_txn
                .entry(attachment.transaction_id)
                .or_default()
                .push((attachment.kind, reference)),
            Err(e) => tracing::warn!(
                transaction_id = attachment.transaction_id,
                object_key = %attachment.object_key,
                error = %e,
                "Could not issue object reference, attachment omitted"
            ),
        }
    }

    transactions
        .iter()
        .map(|txn| {
            let (attachment_kinds, object_refs) =
                images_by_txn.remove(&txn.id).unwrap_or_default().into_iter().unzip();
            AuditPayload {
                transaction_id: txn.id,
                organization_id: txn.organization_id,
                fields: PayloadFields {
                    reference_no: txn.reference_no.clone(),
                    material_type: txn.material_type.clone(),
                    source_site: txn.source_site.clone(),
                    destination_site: txn.destination_site.clone(),
                    vehicle_no: txn.vehicle_no.clone(),
                    gross_weight: txn.gross_weight,
                    tare_weight: txn.tare_weight,
                    net_weight: txn.net_weight,
                    quantity: txn.quantity,
                    unit: txn.unit.clone(),
                    recorded_at: txn.recorded_at.map(|at| at.to_rfc3339()),
                },
                line_items: items_by_txn.remove(&txn.id).unwrap_or_default(),
                attachment_kinds,
                object_refs,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuditStatus, BusinessStatus};
    use crate::services::object_signer::HmacUrlSigner;
    use chrono::Utc;

    fn txn(id: i64, net_weight: Option<f64>) -> Transaction {
        Transaction {
            id,
            organization_id: 1,
            reference_no: format!("WB-{}", id),
            material_type: Some("scrap steel".to_string()),
            source_site: Some("Yard A".to_string()),
            destination_site: Some("Mill".to_string()),
            vehicle_no: None,
            gross_weight: Some(30000.0),
            tare_weight: Some(12000.0),
            net_weight,
            quantity: None,
            unit: Some("kg".to_string()),
            recorded_at: Some(Utc::now()),
            audit_status: AuditStatus::Queued,
            business_status: BusinessStatus::Pending,
            reject_triggers: Vec::new(),
            warning_triggers: Vec::new(),
            audit_note: None,
            batch_id: Some(1),
            audited_at: None,
        }
    }

    fn attachment(transaction_id: i64, key: &str, content_type: &str) -> Attachment {
        Attachment {
            transaction_id,
            object_key: key.to_string(),
            content_type: content_type.to_string(),
            kind: "photo".to_string(),
        }
    }

    #[test]
    fn test_payloads_keep_input_order_and_group_sub_records() {
        let signer = HmacUrlSigner::new("https://objects.example", Some("k".to_string()), 60);
        let items = vec![LineItem {
            transaction_id: 2,
            position: 0,
            description: "bundle".to_string(),
            quantity: Some(3.0),
            unit: Some("pcs".to_string()),
            weight: Some(900.0),
        }];
        let attachments = vec![
            attachment(2, "photos/2.jpg", "image/jpeg"),
            attachment(2, "docs/2.pdf", "application/pdf"),
        ];

        let payloads = build_payloads(&[txn(2, Some(18000.0)), txn(1, None)], items, attachments, &signer);

        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[0].transaction_id, 2);
        assert_eq!(payloads[0].line_items.len(), 1);
        assert_eq!(payloads[0].object_refs.len(), 1, "only images become references");
        assert_eq!(payloads[1].transaction_id, 1);
        assert!(payloads[1].line_items.is_empty());
        assert!(payloads[1].fields.net_weight.is_none());
    }

    #[test]
    fn test_signing_failure_leaves_payload_without_images() {
        let signer = HmacUrlSigner::new("https://objects.example", None, 60);
        let payloads = build_payloads(
            &[txn(1, Some(1.0))],
            Vec::new(),
            vec![attachment(1, "photos/1.jpg", "image/jpeg")],
            &signer,
        );
        assert_eq!(payloads.len(), 1);
        assert!(payloads[0].object_refs.is_empty());
    }

    #[test]
    fn test_request_text_is_compact_json() {
        let signer = HmacUrlSigner::new("https://objects.example", Some("k".to_string()), 60);
        let payloads = build_payloads(&[txn(9, None)], Vec::new(), Vec::new(), &signer);
        let text = payloads[0].to_request_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["t"], 9);
        assert_eq!(value["fields"]["reference_no"], "WB-9");
        assert!(value["fields"]["net_weight"].is_null());
        assert!(value.get("line_items").is_none());
    }
}
