//! Batch history recorder
//!
//! Append-only history of every audit batch. A row is created InProgress,
//! accumulates page aggregates through additive increments, and is
//! finalized exactly once. Every write is guarded by
//! `status = 'IN_PROGRESS'`, so a terminal row can never change again.

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use mta_common::{time, Result};

use crate::models::{AuditBatch, BatchCounts, BatchStatus, BatchTrigger, PageTally, Usage};

const BATCH_COLUMNS: &str = "id, organization_id, transaction_ids, status, trigger_source, \
     total_count, processed_count, approved_count, rejected_count, degraded_count, \
     input_units, output_units, total_units, started_at, completed_at, error_message";

/// Open an InProgress batch row with an empty cohort
///
/// Runs inside the caller's transaction; the cohort is attached with
/// [`attach_cohort`] once it has been claimed.
pub async fn open_batch(
    conn: &mut SqliteConnection,
    organization_id: i64,
    trigger: BatchTrigger,
) -> Result<i64> {
    let started_at = time::to_db(time::now());
    let result = sqlx::query(
        "INSERT INTO audit_batches (organization_id, status, trigger_source, started_at)
         VALUES (?, 'IN_PROGRESS', ?, ?)",
    )
    .bind(organization_id)
    .bind(trigger.as_str())
    .bind(started_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Record the claimed transaction ids and total on a freshly opened batch
pub async fn attach_cohort(
    conn: &mut SqliteConnection,
    batch_id: i64,
    transaction_ids: &[i64],
) -> Result<()> {
    let ids_json = serde_json::to_string(transaction_ids)?;
    sqlx::query(
        "UPDATE audit_batches SET transaction_ids = ?, total_count = ?
         WHERE id = ? AND status = 'IN_PROGRESS'",
    )
    .bind(ids_json)
    .bind(transaction_ids.len() as i64)
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Add one page's aggregate to the batch counters
///
/// Returns false if the batch is no longer InProgress.
pub async fn record_page(pool: &SqlitePool, batch_id: i64, tally: &PageTally) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE audit_batches SET
            processed_count = processed_count + ?,
            approved_count = approved_count + ?,
            rejected_count = rejected_count + ?,
            degraded_count = degraded_count + ?,
            input_units = input_units + ?,
            output_units = output_units + ?,
            total_units = total_units + ?
        WHERE id = ? AND status = 'IN_PROGRESS'
        "#,
    )
    .bind(tally.processed)
    .bind(tally.approved)
    .bind(tally.rejected)
    .bind(tally.degraded)
    .bind(tally.usage.input_units)
    .bind(tally.usage.output_units)
    .bind(tally.usage.total_units)
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a batch to a terminal state
///
/// Counters and usage are rebuilt from the verdicts stored on the batch's
/// transactions in the same statement, so a page aggregate that was never
/// recorded cannot leave a terminal row with wrong counts. Returns false if
/// the batch was already terminal (the row is untouched).
pub async fn finalize(
    pool: &SqlitePool,
    batch_id: i64,
    status: BatchStatus,
    error_message: Option<&str>,
) -> Result<bool> {
    debug_assert!(status.is_terminal(), "finalize requires a terminal status");
    let completed_at = time::to_db(time::now());
    let result = sqlx::query(
        r#"
        UPDATE audit_batches SET
            status = ?,
            completed_at = ?,
            error_message = ?,
            processed_count = v.processed,
            approved_count = v.approved,
            rejected_count = v.rejected,
            degraded_count = v.degraded,
            input_units = v.input_units,
            output_units = v.output_units,
            total_units = v.total_units
        FROM (
            SELECT
                COUNT(*) AS processed,
                COALESCE(SUM(audit_status = 'APPROVED'), 0) AS approved,
                COALESCE(SUM(audit_status = 'REJECTED'), 0) AS rejected,
                COALESCE(SUM(json_extract(audit_note, '$.e') IS NOT NULL), 0) AS degraded,
                COALESCE(SUM(json_extract(audit_note, '$.u.input_units')), 0) AS input_units,
                COALESCE(SUM(json_extract(audit_note, '$.u.output_units')), 0) AS output_units,
                COALESCE(SUM(json_extract(audit_note, '$.u.total_units')), 0) AS total_units
            FROM transactions
            WHERE batch_id = ? AND audit_status IN ('APPROVED', 'REJECTED')
        ) AS v
        WHERE audit_batches.id = ? AND audit_batches.status = 'IN_PROGRESS'
        "#,
    )
    .bind(status.as_str())
    .bind(completed_at)
    .bind(error_message)
    .bind(batch_id)
    .bind(batch_id)
    .execute(pool)
    .await?;

    let finalized = result.rows_affected() == 1;
    if finalized {
        tracing::info!(
            batch_id,
            status = status.as_str(),
            error = error_message.unwrap_or(""),
            "Audit batch finalized"
        );
    } else {
        tracing::warn!(batch_id, "Batch already terminal, finalize ignored");
    }
    Ok(finalized)
}

/// Load one batch
pub async fn get_batch(pool: &SqlitePool, batch_id: i64) -> Result<Option<AuditBatch>> {
    let sql = format!("SELECT {} FROM audit_batches WHERE id = ?", BATCH_COLUMNS);
    let row = sqlx::query(&sql).bind(batch_id).fetch_optional(pool).await?;
    row.as_ref().map(row_to_batch).transpose()
}

/// Most recent batches first, optionally scoped to one organization
pub async fn list_batches(
    pool: &SqlitePool,
    organization_id: Option<i64>,
    limit: u32,
) -> Result<Vec<AuditBatch>> {
    let sql = format!(
        "SELECT {} FROM audit_batches
         WHERE (?1 IS NULL OR organization_id = ?1)
         ORDER BY id DESC
         LIMIT ?2",
        BATCH_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(organization_id)
        .bind(i64::from(limit))
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_batch).collect()
}

/// InProgress batches, oldest first, optionally scoped to one organization
pub async fn in_progress_batches(
    pool: &SqlitePool,
    organization_id: Option<i64>,
) -> Result<Vec<AuditBatch>> {
    let sql = format!(
        "SELECT {} FROM audit_batches
         WHERE status = 'IN_PROGRESS' AND (?1 IS NULL OR organization_id = ?1)
         ORDER BY organization_id, id",
        BATCH_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(organization_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(row_to_batch).collect()
}

fn row_to_batch(row: &SqliteRow) -> Result<AuditBatch> {
    let transaction_ids: String = row.get("transaction_ids");
    let status: String = row.get("status");
    let trigger: String = row.get("trigger_source");
    let started_at: String = row.get("started_at");

    Ok(AuditBatch {
        id: row.get("id"),
        organization_id: row.get("organization_id"),
        transaction_ids: serde_json::from_str(&transaction_ids)?,
        status: status.parse::<BatchStatus>()?,
        trigger: trigger.parse::<BatchTrigger>()?,
        counts: BatchCounts {
            total: row.get("total_count"),
            processed: row.get("processed_count"),
            approved: row.get("approved_count"),
            rejected: row.get("rejected_count"),
            degraded: row.get("degraded_count"),
        },
        usage: Usage {
            input_units: row.get("input_units"),
            output_units: row.get("output_units"),
            total_units: row.get("total_units"),
        },
        started_at: time::from_db(&started_at)?,
        completed_at: time::from_db_opt(row.get("completed_at"))?,
        error_message: row.get("error_message"),
    })
}
