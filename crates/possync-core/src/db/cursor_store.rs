//! Per-device pull cursors

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::{DeviceId, SyncCursor, TenantId};

pub trait CursorStore {
    /// Last cursor stored for the device, or the initial cursor
    fn get(&self, tenant: &TenantId, device: &DeviceId) -> Result<SyncCursor>;

    /// Persist a new cursor after a fully applied pull
    fn advance(&self, tenant: &TenantId, device: &DeviceId, cursor: &SyncCursor) -> Result<()>;
}

pub struct SqliteCursorStore<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCursorStore<'a> {
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CursorStore for SqliteCursorStore<'_> {
    fn get(&self, tenant: &TenantId, device: &DeviceId) -> Result<SyncCursor> {
        let cursor: Option<String> = self
            .conn
            .query_row(
                "SELECT cursor FROM sync_cursors WHERE tenant_id = ? AND device_id = ?",
                params![tenant.as_str(), device.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(cursor.map_or_else(SyncCursor::initial, SyncCursor::new))
    }

    fn advance(&self, tenant: &TenantId, device: &DeviceId, cursor: &SyncCursor) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_cursors (tenant_id, device_id, cursor, advanced_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(tenant_id, device_id) DO UPDATE SET
                cursor = excluded.cursor,
                advanced_at = excluded.advanced_at",
            params![
                tenant.as_str(),
                device.as_str(),
                cursor.as_str(),
                chrono::Utc::now().timestamp_millis()
            ],
        )?;
        tracing::debug!("Advanced cursor for {tenant}/{device} to {cursor}");
        Ok(())
    }
}
