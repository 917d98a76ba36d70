//! Database initialization
//!
//! Opens (or creates) the SQLite database and bootstraps every table the
//! audit service reads or writes. All statements are idempotent.

use crate::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::path::Path;
use tracing::info;

/// Open the database file, creating it and its schema if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    let pool = SqlitePoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .connect(&db_url)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    // WAL allows concurrent readers alongside the single writer
    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA busy_timeout = 5000")
        .execute(&pool)
        .await?;

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query("PRAGMA foreign_keys = ON")
        .execute(pool)
        .await?;

    create_organizations_table(pool).await?;
    create_audit_batches_table(pool).await?;
    create_transactions_table(pool).await?;
    create_line_items_table(pool).await?;
    create_attachments_table(pool).await?;
    create_audit_rules_table(pool).await?;

    info!("Database schema initialized");
    Ok(())
}

async fn create_organizations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS organizations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            allow_business_status_update INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_audit_batches_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_batches (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id INTEGER NOT NULL REFERENCES organizations(id),
            transaction_ids TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'IN_PROGRESS'
                CHECK (status IN ('IN_PROGRESS', 'COMPLETED', 'FAILED')),
            trigger_source TEXT NOT NULL DEFAULT 'enqueue',
            total_count INTEGER NOT NULL DEFAULT 0,
            processed_count INTEGER NOT NULL DEFAULT 0,
            approved_count INTEGER NOT NULL DEFAULT 0,
            rejected_count INTEGER NOT NULL DEFAULT 0,
            degraded_count INTEGER NOT NULL DEFAULT 0,
            input_units INTEGER NOT NULL DEFAULT 0,
            output_units INTEGER NOT NULL DEFAULT 0,
            total_units INTEGER NOT NULL DEFAULT 0,
            started_at TEXT NOT NULL,
            completed_at TEXT,
            error_message TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_batches_org_status ON audit_batches(organization_id, status)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_transactions_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY,
            organization_id INTEGER NOT NULL REFERENCES organizations(id),
            reference_no TEXT NOT NULL,
            material_type TEXT,
            source_site TEXT,
            destination_site TEXT,
            vehicle_no TEXT,
            gross_weight REAL,
            tare_weight REAL,
            net_weight REAL,
            quantity REAL,
            unit TEXT,
            recorded_at TEXT NOT NULL,
            audit_status TEXT NOT NULL DEFAULT 'NOT_AUDITED'
                CHECK (audit_status IN ('NOT_AUDITED', 'QUEUED', 'APPROVED', 'REJECTED')),
            business_status TEXT NOT NULL DEFAULT 'PENDING'
                CHECK (business_status IN ('PENDING', 'APPROVED', 'REJECTED')),
            reject_triggers TEXT NOT NULL DEFAULT '[]',
            warning_triggers TEXT NOT NULL DEFAULT '[]',
            audit_note TEXT,
            batch_id INTEGER REFERENCES audit_batches(id),
            audited_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_transactions_org_audit ON transactions(organization_id, audit_status)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_transactions_batch ON transactions(batch_id)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn create_line_items_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transaction_line_items (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            position INTEGER NOT NULL DEFAULT 0,
            description TEXT NOT NULL DEFAULT '',
            quantity REAL,
            unit TEXT,
            weight REAL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_line_items_txn ON transaction_line_items(transaction_id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_attachments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transaction_attachments (
            id INTEGER PRIMARY KEY,
            transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            object_key TEXT NOT NULL,
            content_type TEXT NOT NULL,
            kind TEXT NOT NULL DEFAULT 'photo'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attachments_txn ON transaction_attachments(transaction_id)",
    )
    .execute(pool)
    .await?;
    Ok(())
}

async fn create_audit_rules_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS audit_rules (
            id INTEGER PRIMARY KEY,
            organization_id INTEGER NOT NULL REFERENCES organizations(id),
            rule_code TEXT NOT NULL,
            name TEXT NOT NULL,
            rule_type TEXT NOT NULL DEFAULT 'general',
            condition TEXT NOT NULL,
            thresholds TEXT NOT NULL DEFAULT '[]',
            metrics TEXT NOT NULL DEFAULT '[]',
            actions TEXT NOT NULL DEFAULT '[]',
            active INTEGER NOT NULL DEFAULT 1,
            UNIQUE (organization_id, rule_code)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_audit_rules_org_active ON audit_rules(organization_id, active)",
    )
    .execute(pool)
    .await?;
    Ok(())
}
