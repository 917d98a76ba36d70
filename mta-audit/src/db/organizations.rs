//! Organization permission lookups

use sqlx::SqlitePool;

use mta_common::{Error, Result};

/// Whether audit verdicts may also set the organization's business status
pub async fn allows_business_status_update(pool: &SqlitePool, organization_id: i64) -> Result<bool> {
    let flag: Option<i64> =
        sqlx::query_scalar("SELECT allow_business_status_update FROM organizations WHERE id = ?")
            .bind(organization_id)
            .fetch_optional(pool)
            .await?;

    flag.map(|value| value != 0)
        .ok_or_else(|| Error::NotFound(format!("Organization not found: {}", organization_id)))
}

/// True when the organization exists
pub async fn organization_exists(pool: &SqlitePool, organization_id: i64) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT id FROM organizations WHERE id = ?")
        .bind(organization_id)
        .fetch_optional(pool)
        .await?;
    Ok(found.is_some())
}
