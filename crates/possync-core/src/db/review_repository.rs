//! Manual review queue repository

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::models::{ManualReview, OperationId, RecordKey, TenantId, Version};

pub trait ReviewRepository {
    /// Queue a review. Returns `false` when the same conflict is already queued.
    fn record(&self, review: &ManualReview) -> Result<bool>;

    fn get(&self, id: i64) -> Result<Option<ManualReview>>;

    /// Reviews of a tenant, newest first
    fn list(&self, tenant: &TenantId, open_only: bool, limit: usize) -> Result<Vec<ManualReview>>;

    /// Close a review; fails if it does not exist or is already closed
    fn mark_resolved(&self, id: i64, now_ms: i64) -> Result<ManualReview>;

    /// Number of open reviews for one record
    fn open_count(&self, key: &RecordKey) -> Result<usize>;
}

pub struct SqliteReviewRepository<'a> {
    conn: &'a Connection,
}

const REVIEW_COLUMNS: &str = "id, tenant_id, entity_type, entity_id, field, local_version,
     remote_version, local_value, remote_value, operation_id, detected_at, resolved_at";

fn optional_json(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| {
        serde_json::from_str(&raw).map_err(|error| {
            rusqlite::Error::FromSqlConversionFailure(
                index,
                rusqlite::types::Type::Text,
                Box::new(error),
            )
        })
    })
    .transpose()
}

impl<'a> SqliteReviewRepository<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn parse_review(row: &rusqlite::Row<'_>) -> rusqlite::Result<ManualReview> {
        let operation_id: Option<String> = row.get(9)?;
        let operation_id = operation_id
            .map(|raw| {
                raw.parse::<OperationId>().map_err(|error| {
                    rusqlite::Error::FromSqlConversionFailure(
                        9,
                        rusqlite::types::Type::Text,
                        Box::new(error),
                    )
                })
            })
            .transpose()?;

        Ok(ManualReview {
            id: row.get(0)?,
            key: RecordKey {
                tenant_id: TenantId::from_storage(row.get(1)?),
                entity_type: row.get(2)?,
                entity_id: row.get(3)?,
            },
            field: row.get(4)?,
            local_version: Version(row.get(5)?),
            remote_version: Version(row.get(6)?),
            local_value: optional_json(row, 7)?,
            remote_value: optional_json(row, 8)?,
            operation_id,
            detected_at: row.get(10)?,
            resolved_at: row.get(11)?,
        })
    }
}

impl ReviewRepository for SqliteReviewRepository<'_> {
    fn record(&self, review: &ManualReview) -> Result<bool> {
        let local_value = review
            .local_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let remote_value = review
            .remote_value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO manual_reviews (tenant_id, entity_type, entity_id, field,
                                                   local_version, remote_version, local_value,
                                                   remote_value, operation_id, detected_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                review.key.tenant_id.as_str(),
                review.key.entity_type,
                review.key.entity_id,
                review.field,
                review.local_version.0,
                review.remote_version.0,
                local_value,
                remote_value,
                review.operation_id.map(|id| id.as_str()),
                review.detected_at,
            ],
        )?;

        if inserted > 0 {
            tracing::warn!(
                "Queued manual review for {} field {} ({} vs {})",
                review.key,
                review.field,
                review.local_version,
                review.remote_version
            );
        }
        Ok(inserted > 0)
    }

    fn get(&self, id: i64) -> Result<Option<ManualReview>> {
        let review = self
            .conn
            .query_row(
                &format!("SELECT {REVIEW_COLUMNS} FROM manual_reviews WHERE id = ?"),
                params![id],
                Self::parse_review,
            )
            .optional()?;
        Ok(review)
    }

    fn list(&self, tenant: &TenantId, open_only: bool, limit: usize) -> Result<Vec<ManualReview>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS} FROM manual_reviews
             WHERE tenant_id = ? AND (? = 0 OR resolved_at IS NULL)
             ORDER BY detected_at DESC, id DESC
             LIMIT ?"
        ))?;
        let reviews = stmt
            .query_map(
                params![tenant.as_str(), open_only, limit as i64],
                Self::parse_review,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(reviews)
    }

    fn mark_resolved(&self, id: i64, now_ms: i64) -> Result<ManualReview> {
        let rows = self.conn.execute(
            "UPDATE manual_reviews SET resolved_at = ? WHERE id = ? AND resolved_at IS NULL",
            params![now_ms, id],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!("open review {id}")));
        }
        self.get(id)?
            .ok_or_else(|| Error::NotFound(format!("review {id}")))
    }

    fn open_count(&self, key: &RecordKey) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM manual_reviews
             WHERE tenant_id = ? AND entity_type = ? AND entity_id = ? AND resolved_at IS NULL",
            params![key.tenant_id.as_str(), key.entity_type, key.entity_id],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
