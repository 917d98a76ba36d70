//! Transaction queries
//!
//! Every write here touches exactly one row per statement, or claims a
//! cohort with a single `UPDATE … RETURNING` so a transaction can never be
//! claimed into two batches.

use sqlx::sqlite::SqliteRow;
use sqlx::{Decode, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool, Type};

use mta_common::{time, Result};

use crate::models::{Attachment, AuditResult, AuditStatus, BusinessStatus, LineItem, Transaction};

const TRANSACTION_COLUMNS: &str = "id, organization_id, reference_no, material_type, source_site, \
     destination_site, vehicle_no, gross_weight, tare_weight, net_weight, quantity, unit, \
     recorded_at, audit_status, business_status, reject_triggers, warning_triggers, audit_note, \
     batch_id, audited_at";

/// Which transactions a claim may pick up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// Never audited
    NotAudited,
    /// Already Approved or Rejected (explicit re-enqueue)
    Audited,
    /// Queued but not bound to an in-progress batch
    Orphaned,
}

/// Flip a cohort to Queued and bind it to `batch_id`
///
/// Returns the claimed ids in ascending order.
pub async fn claim_for_batch(
    conn: &mut SqliteConnection,
    organization_id: i64,
    batch_id: i64,
    scope: ClaimScope,
    only_ids: Option<&[i64]>,
) -> Result<Vec<i64>> {
    let mut builder: QueryBuilder<Sqlite> =
        QueryBuilder::new("UPDATE transactions SET audit_status = 'QUEUED', batch_id = ");
    builder.push_bind(batch_id);
    builder.push(" WHERE organization_id = ");
    builder.push_bind(organization_id);

    match scope {
        ClaimScope::NotAudited => {
            builder.push(" AND audit_status = 'NOT_AUDITED'");
        }
        ClaimScope::Audited => {
            builder.push(" AND audit_status IN ('APPROVED', 'REJECTED')");
        }
        ClaimScope::Orphaned => {
            builder.push(
                " AND audit_status = 'QUEUED' AND (batch_id IS NULL OR batch_id NOT IN \
                 (SELECT id FROM audit_batches WHERE status = 'IN_PROGRESS'))",
            );
        }
    }

    if let Some(ids) = only_ids {
        builder.push(" AND id IN (");
        let mut separated = builder.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");
    }
    builder.push(" RETURNING id");

    let mut claimed: Vec<i64> = builder
        .build_query_scalar()
        .fetch_all(&mut *conn)
        .await?;
    claimed.sort_unstable();
    Ok(claimed)
}

/// Next page of Queued transactions in a batch, keyset-paginated by id
pub async fn fetch_queued_page(
    pool: &SqlitePool,
    batch_id: i64,
    after_id: i64,
    limit: u32,
) -> Result<Vec<Transaction>> {
    let sql = format!(
        "SELECT {} FROM transactions
         WHERE batch_id = ? AND audit_status = 'QUEUED' AND id > ?
         ORDER BY id
         LIMIT ?",
        TRANSACTION_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(batch_id)
        .bind(after_id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_transaction).collect()
}

/// Transactions of a batch still waiting for a verdict
pub async fn count_queued_in_batch(pool: &SqlitePool, batch_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions WHERE batch_id = ? AND audit_status = 'QUEUED'",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Transactions of a batch that already carry a verdict
pub async fn count_audited_in_batch(pool: &SqlitePool, batch_id: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transactions
         WHERE batch_id = ? AND audit_status IN ('APPROVED', 'REJECTED')",
    )
    .bind(batch_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Detach still-queued transactions from a failed batch
///
/// They stay Queued and become an orphaned cohort for a later run.
pub async fn unbind_queued(pool: &SqlitePool, batch_id: i64) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE transactions SET batch_id = NULL WHERE batch_id = ? AND audit_status = 'QUEUED'",
    )
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Organizations holding queued transactions outside any in-progress batch
pub async fn organizations_with_orphaned_queue(pool: &SqlitePool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar(
        "SELECT DISTINCT organization_id FROM transactions
         WHERE audit_status = 'QUEUED' AND (batch_id IS NULL OR batch_id NOT IN
             (SELECT id FROM audit_batches WHERE status = 'IN_PROGRESS'))
         ORDER BY organization_id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Write a verdict to one queued transaction
///
/// The row is only touched while it is still Queued in `batch_id`, so
/// replaying the same result is a no-op. Returns whether the row changed.
pub async fn apply_verdict(
    pool: &SqlitePool,
    batch_id: i64,
    result: &AuditResult,
    allow_business_status_update: bool,
) -> Result<bool> {
    let audit_status = result.outcome.audit_status();
    let reject_triggers = serde_json::to_string(&result.reject_triggers())?;
    let warning_triggers = serde_json::to_string(&result.warning_triggers())?;
    let audit_note = serde_json::to_string(&result.note())?;
    let audited_at = time::to_db(result.evaluated_at);

    let sql = if allow_business_status_update {
        "UPDATE transactions
         SET audit_status = ?, reject_triggers = ?, warning_triggers = ?, audit_note = ?,
             audited_at = ?, business_status = ?
         WHERE id = ? AND batch_id = ? AND audit_status = 'QUEUED'"
    } else {
        "UPDATE transactions
         SET audit_status = ?, reject_triggers = ?, warning_triggers = ?, audit_note = ?,
             audited_at = ?
         WHERE id = ? AND batch_id = ? AND audit_status = 'QUEUED'"
    };

    let mut query = sqlx::query(sql)
        .bind(audit_status.as_str())
        .bind(reject_triggers)
        .bind(warning_triggers)
        .bind(audit_note)
        .bind(audited_at);
    if allow_business_status_update {
        query = query.bind(result.outcome.business_status().as_str());
    }
    let outcome = query
        .bind(result.transaction_id)
        .bind(batch_id)
        .execute(pool)
        .await?;

    Ok(outcome.rows_affected() == 1)
}

/// Load a single transaction
pub async fn get_transaction(pool: &SqlitePool, id: i64) -> Result<Option<Transaction>> {
    let sql = format!("SELECT {} FROM transactions WHERE id = ?", TRANSACTION_COLUMNS);
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_transaction).transpose()
}

/// Line items for a set of transactions, ordered by transaction then position
pub async fn load_line_items(pool: &SqlitePool, transaction_ids: &[i64]) -> Result<Vec<LineItem>> {
    if transaction_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT transaction_id, position, description, quantity, unit, weight
         FROM transaction_line_items WHERE transaction_id IN (",
    );
    push_id_list(&mut builder, transaction_ids);
    builder.push(" ORDER BY transaction_id, position, id");

    let rows = builder.build().fetch_all(pool).await?;
    let items = rows
        .iter()
        .map(|row| LineItem {
            transaction_id: row.get("transaction_id"),
            position: row.get("position"),
            description: row.get("description"),
            quantity: row.get("quantity"),
            unit: row.get("unit"),
            weight: row.get("weight"),
        })
        .collect();
    Ok(items)
}

/// Attachments for a set of transactions
pub async fn load_attachments(pool: &SqlitePool, transaction_ids: &[i64]) -> Result<Vec<Attachment>> {
    if transaction_ids.is_empty() {
        return Ok(Vec::new());
    }
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT transaction_id, object_key, content_type, kind
         FROM transaction_attachments WHERE transaction_id IN (",
    );
    push_id_list(&mut builder, transaction_ids);
    builder.push(" ORDER BY transaction_id, id");

    let rows = builder.build().fetch_all(pool).await?;
    let attachments = rows
        .iter()
        .map(|row| Attachment {
            transaction_id: row.get("transaction_id"),
            object_key: row.get("object_key"),
            content_type: row.get("content_type"),
            kind: row.get("kind"),
        })
        .collect();
    Ok(attachments)
}

fn push_id_list(builder: &mut QueryBuilder<Sqlite>, ids: &[i64]) {
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

/// Decode a transaction row
///
/// Only the key columns are required. Any other column that cannot be read
/// is logged and left empty so the transaction still gets audited.
fn row_to_transaction(row: &SqliteRow) -> Result<Transaction> {
    let id: i64 = row.try_get("id")?;
    let organization_id: i64 = row.try_get("organization_id")?;

    let recorded_at = column::<String>(row, id, "recorded_at").and_then(|raw| {
        time::from_db(&raw)
            .map_err(|e| warn_unreadable(id, "recorded_at", &e))
            .ok()
    });
    let audit_status = column::<String>(row, id, "audit_status")
        .and_then(|raw| raw.parse::<AuditStatus>().map_err(|e| warn_unreadable(id, "audit_status", &e)).ok())
        .unwrap_or(AuditStatus::Queued);
    let business_status = column::<String>(row, id, "business_status")
        .and_then(|raw| raw.parse::<BusinessStatus>().map_err(|e| warn_unreadable(id, "business_status", &e)).ok())
        .unwrap_or(BusinessStatus::Pending);
    let audited_at = column::<Option<String>>(row, id, "audited_at")
        .flatten()
        .and_then(|raw| time::from_db(&raw).map_err(|e| warn_unreadable(id, "audited_at", &e)).ok());

    Ok(Transaction {
        id,
        organization_id,
        reference_no: column::<String>(row, id, "reference_no").unwrap_or_default(),
        material_type: column::<Option<String>>(row, id, "material_type").flatten(),
        source_site: column::<Option<String>>(row, id, "source_site").flatten(),
        destination_site: column::<Option<String>>(row, id, "destination_site").flatten(),
        vehicle_no: column::<Option<String>>(row, id, "vehicle_no").flatten(),
        gross_weight: column::<Option<f64>>(row, id, "gross_weight").flatten(),
        tare_weight: column::<Option<f64>>(row, id, "tare_weight").flatten(),
        net_weight: column::<Option<f64>>(row, id, "net_weight").flatten(),
        quantity: column::<Option<f64>>(row, id, "quantity").flatten(),
        unit: column::<Option<String>>(row, id, "unit").flatten(),
        recorded_at,
        audit_status,
        business_status,
        reject_triggers: trigger_list(row, id, "reject_triggers"),
        warning_triggers: trigger_list(row, id, "warning_triggers"),
        audit_note: column::<Option<String>>(row, id, "audit_note").flatten(),
        batch_id: column::<Option<i64>>(row, id, "batch_id").flatten(),
        audited_at,
    })
}

fn column<'r, T>(row: &'r SqliteRow, id: i64, name: &str) -> Option<T>
where
    T: Decode<'r, Sqlite> + Type<Sqlite>,
{
    row.try_get::<T, _>(name)
        .map_err(|e| warn_unreadable(id, name, &e))
        .ok()
}

fn trigger_list(row: &SqliteRow, id: i64, name: &str) -> Vec<String> {
    column::<Option<String>>(row, id, name)
        .flatten()
        .and_then(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| warn_unreadable(id, name, &e))
                .ok()
        })
        .unwrap_or_default()
}

fn warn_unreadable(transaction_id: i64, column: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(
        transaction_id,
        column,
        error = %error,
        "Unreadable transaction column, left empty"
    );
}
