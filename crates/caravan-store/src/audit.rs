//! # Conflict Audit Log
//!
//! Append-only record of every resolver invocation. Rows are inserted once
//! and never mutated; resolved conflicts are archived here, not deleted.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use caravan_core::types::{ConflictAudit, ConflictRule, Resolution};

use crate::error::{StoreError, StoreResult};

/// Repository for the `conflict_audit` table.
#[derive(Debug, Clone)]
pub struct ConflictAuditLog {
    pool: SqlitePool,
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: String,
    operation_id: String,
    entity_key: String,
    rule: String,
    resolution: String,
    local_value: String,
    remote_value: String,
    resolved_value: Option<String>,
    audited_at: DateTime<Utc>,
}

impl AuditRow {
    fn into_audit(self) -> StoreResult<ConflictAudit> {
        let rule: ConflictRule = serde_json::from_value(serde_json::Value::String(self.rule))?;
        let resolution: Resolution =
            serde_json::from_value(serde_json::Value::String(self.resolution))?;
        Ok(ConflictAudit {
            id: self.id,
            operation_id: self.operation_id,
            entity_key: self.entity_key,
            rule,
            resolution,
            local_value: self.local_value,
            remote_value: self.remote_value,
            resolved_value: self.resolved_value,
            audited_at: self.audited_at,
        })
    }
}

impl ConflictAuditLog {
    /// Creates a new ConflictAuditLog.
    pub fn new(pool: SqlitePool) -> Self {
        ConflictAuditLog { pool }
    }

    /// Appends one audit record. Append-only: there is no update path.
    pub async fn append(&self, audit: &ConflictAudit) -> StoreResult<()> {
        let rule = enum_tag(&audit.rule)?;
        let resolution = enum_tag(&audit.resolution)?;

        sqlx::query(
            "INSERT INTO conflict_audit \
             (id, operation_id, entity_key, rule, resolution, \
              local_value, remote_value, resolved_value, audited_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(&audit.id)
        .bind(&audit.operation_id)
        .bind(&audit.entity_key)
        .bind(&rule)
        .bind(&resolution)
        .bind(&audit.local_value)
        .bind(&audit.remote_value)
        .bind(&audit.resolved_value)
        .bind(audit.audited_at)
        .execute(&self.pool)
        .await?;

        debug!(
            operation_id = %audit.operation_id,
            rule = %audit.rule,
            resolution = %audit.resolution,
            "Conflict audit appended"
        );
        Ok(())
    }

    /// Audit trail for one operation, oldest first.
    pub async fn for_operation(&self, operation_id: &str) -> StoreResult<Vec<ConflictAudit>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            "SELECT id, operation_id, entity_key, rule, resolution, \
             local_value, remote_value, resolved_value, audited_at \
             FROM conflict_audit WHERE operation_id = ?1 ORDER BY audited_at ASC, id ASC",
        )
        .bind(operation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AuditRow::into_audit).collect()
    }

    /// Total number of audit rows (diagnostics).
    pub async fn count(&self) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM conflict_audit")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Persists enum variants with their serde (snake_case) tags so the table
/// matches what the event stream shows the host.
fn enum_tag<T: serde::Serialize>(value: &T) -> StoreResult<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(tag) => Ok(tag),
        other => Err(StoreError::Serialization(format!(
            "expected string tag, got {other}"
        ))),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Store, StoreConfig};

    fn audit(id: &str, operation_id: &str) -> ConflictAudit {
        ConflictAudit {
            id: id.into(),
            operation_id: operation_id.into(),
            entity_key: "progress/u1".into(),
            rule: ConflictRule::RolePrecedence,
            resolution: Resolution::KeepLocal,
            local_value: "local".into(),
            remote_value: "remote".into(),
            resolved_value: Some("local".into()),
            audited_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let log = ConflictAuditLog::new(store.pool().clone());

        log.append(&audit("a-1", "op-1")).await.unwrap();
        log.append(&audit("a-2", "op-1")).await.unwrap();
        log.append(&audit("a-3", "op-2")).await.unwrap();

        let trail = log.for_operation("op-1").await.unwrap();
        assert_eq!(trail.len(), 2);
        assert_eq!(trail[0].rule, ConflictRule::RolePrecedence);
        assert_eq!(trail[0].resolution, Resolution::KeepLocal);
        assert_eq!(log.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        // Append-only also means immutable: a second insert under the same
        // id fails instead of overwriting history.
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let log = ConflictAuditLog::new(store.pool().clone());

        log.append(&audit("a-1", "op-1")).await.unwrap();
        assert!(log.append(&audit("a-1", "op-1")).await.is_err());
    }
}
