//! Database connection management

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, TransactionBehavior};

use super::migrations;
use crate::error::{Error, Result};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Local `SQLite` database shared by the record store, operation log and cursors.
///
/// Writes go through a single connection behind a mutex. File databases also
/// keep a read-only connection so lookups, dirty scans and listings don't
/// queue behind a sync transaction; in WAL mode that reader sees the last
/// committed state. In-memory databases have one connection for both.
///
/// Connection locks are only ever held for one statement or one short
/// transaction, never across an `.await`.
pub struct Database {
    conn: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&path)?;

        let mut database = Self {
            conn: Mutex::new(conn),
            reader: None,
            path: Some(path.clone()),
        };
        database.configure()?;
        database.migrate()?;

        // opened after migrating so the reader never sees a half-built schema
        let reader = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;
        database.reader = Some(Mutex::new(reader));
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;

        let database = Self {
            conn: Mutex::new(conn),
            reader: None,
            path: None,
        };
        database.configure()?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for durable writes
    fn configure(&self) -> Result<()> {
        let conn = self.lock()?;
        if self.path.is_some() {
            // WAL is unavailable for in-memory databases
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
            tracing::debug!("SQLite journal mode: {mode}");
        }
        // Every committed put must survive a crash mid-sync
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        let conn = self.lock()?;
        migrations::run(&conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        lock_connection(&self.conn)
    }

    /// Run `f` with exclusive access to the write connection.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` on the read-only connection, falling back to the write
    /// connection for in-memory databases.
    ///
    /// Must not be called from inside [`Database::transaction`] on an
    /// in-memory database.
    pub fn with_reader<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = match &self.reader {
            Some(reader) => lock_connection(reader)?,
            None => self.lock()?,
        };
        f(&conn)
    }

    /// Run `f` inside an immediate transaction, committing only if it succeeds.
    pub fn transaction<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    /// Whether reads use their own connection
    pub const fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Filesystem path of the database, `None` when in memory
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Move a corrupted database file aside and remove its WAL/SHM sidecars.
    ///
    /// Returns the quarantine path. This is an explicit repair action; the sync
    /// core never calls it on its own.
    pub fn quarantine_corrupted_files(db_path: &Path) -> Result<Option<PathBuf>> {
        let mut backup = None;
        if db_path.exists() {
            let timestamp = chrono::Utc::now().timestamp_millis();
            let base_name = db_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("possync.db");
            let backup_path = db_path.with_file_name(format!("{base_name}.corrupt-{timestamp}"));

            std::fs::rename(db_path, &backup_path)?;
            tracing::warn!(
                "Moved corrupted local DB file from {} to {}",
                db_path.display(),
                backup_path.display()
            );
            backup = Some(backup_path);
        }

        let Some(parent) = db_path.parent() else {
            return Ok(backup);
        };
        let Some(base_name) = db_path.file_name().and_then(|name| name.to_str()) else {
            return Ok(backup);
        };
        let sidecar_prefix = format!("{base_name}-");

        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        for entry in std::fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if file_name.starts_with(&sidecar_prefix) {
                let path = entry.path();
                std::fs::remove_file(&path)?;
                tracing::warn!("Removed stale sidecar file {}", path.display());
            }
        }

        Ok(backup)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| Error::Database("connection lock poisoned".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        let one: i64 = db
            .with_connection(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.transaction(|conn| {
            conn.execute(
                "INSERT INTO sync_cursors (tenant_id, device_id, cursor, advanced_at)
                 VALUES ('t', 'd', '9', 0)",
                [],
            )?;
            Err(Error::InvalidInput("abort".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn quarantine_moves_db_and_removes_sidecars() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("possync.db");
        let wal_path = dir.path().join("possync.db-wal");
        let shm_path = dir.path().join("possync.db-shm");

        std::fs::write(&db_path, b"bad-db").unwrap();
        std::fs::write(&wal_path, b"wal").unwrap();
        std::fs::write(&shm_path, b"shm").unwrap();

        let backup = Database::quarantine_corrupted_files(&db_path).unwrap().unwrap();

        assert!(!db_path.exists());
        assert!(!wal_path.exists());
        assert!(!shm_path.exists());
        assert!(backup.exists());
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("possync.db.corrupt-"));
    }

    #[test]
    fn reads_proceed_while_a_write_transaction_is_open() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("possync.db")).unwrap();
        assert!(db.has_reader());

        let count_cursors = |conn: &Connection| -> Result<i64> {
            Ok(conn.query_row("SELECT COUNT(*) FROM sync_cursors", [], |row| row.get(0))?)
        };

        let seen_mid_write = db
            .transaction(|conn| {
                conn.execute(
                    "INSERT INTO sync_cursors (tenant_id, device_id, cursor, advanced_at)
                     VALUES ('t', 'd', '9', 0)",
                    [],
                )?;
                // the writer is still locked here; only a separate reader can answer
                db.with_reader(count_cursors)
            })
            .unwrap();
        assert_eq!(seen_mid_write, 0);
        assert_eq!(db.with_reader(count_cursors).unwrap(), 1);

        let write = db.with_reader(|conn| {
            conn.execute("DELETE FROM sync_cursors", [])?;
            Ok(())
        });
        assert!(write.is_err());
    }

    #[test]
    fn in_memory_reads_share_the_writer() {
        let db = Database::open_in_memory().unwrap();
        assert!(!db.has_reader());
        let one: i64 = db
            .with_reader(|conn| Ok(conn.query_row("SELECT 1", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn reopening_a_file_database_keeps_schema() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("possync.db");
        drop(Database::open(&db_path).unwrap());
        let db = Database::open(&db_path).unwrap();
        assert_eq!(db.path(), Some(db_path.as_path()));
    }
}
