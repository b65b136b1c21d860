//! SQLite-backed signature catalog.
//!
//! One database holds the malware hash tables consulted by the scanner, the
//! whitelist, the quarantine bookkeeping, and a small `db_info` key-value
//! table for engine configuration. The scanner only ever reads; the
//! quarantine manager writes through its own `Catalog` handle.

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

use crate::digest::DigestAlgorithm;
use crate::Result;

/// How long a statement waits on a locked database before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One row of the `quarantine_files` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub id: i64,
    pub original_path: String,
    pub stored_filename: String,
    /// Directory the stored file lives in (not including the filename).
    pub stored_path: String,
    pub stored_size: u64,
    pub quarantined_at: String,
    /// Digest of the stored (obfuscated) file.
    pub original_hash: String,
    pub hash_type: String,
    pub deleted: bool,
    pub restored: bool,
    pub restored_at: Option<String>,
    pub restored_path: Option<String>,
}

/// Handle over the catalog database.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    /// Open or create the catalog at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    /// In-memory catalog for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let catalog = Self {
            conn: Mutex::new(conn),
        };
        catalog.migrate()?;
        Ok(catalog)
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS db_info (
                key TEXT PRIMARY KEY,
                value TEXT
            );

            CREATE TABLE IF NOT EXISTS sig_md5 (
                hash TEXT PRIMARY KEY,
                malware_name TEXT
            );
            CREATE TABLE IF NOT EXISTS sig_sha1 (
                hash TEXT PRIMARY KEY,
                malware_name TEXT
            );
            CREATE TABLE IF NOT EXISTS sig_sha256 (
                hash TEXT PRIMARY KEY,
                malware_name TEXT
            );

            CREATE TABLE IF NOT EXISTS whitelist (
                hash TEXT,
                hash_type TEXT,
                note TEXT,
                UNIQUE(hash, hash_type)
            );

            CREATE TABLE IF NOT EXISTS quarantine_files (
                id INTEGER PRIMARY KEY,
                original_path TEXT,
                stored_filename TEXT UNIQUE,
                stored_path TEXT,
                stored_size INTEGER,
                quarantined_at TEXT DEFAULT (datetime('now')),
                original_hash TEXT,
                hash_type TEXT,
                deleted INTEGER DEFAULT 0,
                restored INTEGER DEFAULT 0,
                restored_at TEXT,
                restored_path TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_quarantine_age
                ON quarantine_files(quarantined_at) WHERE deleted = 0;
            "#,
        )?;
        debug!("catalog schema ready");
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned catalog mutex means a panic mid-query; the connection
        // itself is still usable for read paths.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── signature tables ────────────────────────────────────────────────

    /// Look up a hex digest in the signature table for its algorithm.
    /// Returns the catalog-side malware name on a hit.
    pub fn lookup_signature(
        &self,
        algorithm: DigestAlgorithm,
        hash: &str,
    ) -> Result<Option<String>> {
        let sql = match algorithm {
            DigestAlgorithm::Md5 => "SELECT malware_name FROM sig_md5 WHERE hash = ?1 LIMIT 1",
            DigestAlgorithm::Sha1 => "SELECT malware_name FROM sig_sha1 WHERE hash = ?1 LIMIT 1",
            DigestAlgorithm::Sha256 => "SELECT malware_name FROM sig_sha256 WHERE hash = ?1 LIMIT 1",
        };
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let name = stmt
            .query_row(params![hash], |row| {
                row.get::<_, Option<String>>(0)
                    .map(|n| n.unwrap_or_default())
            })
            .optional()?;
        Ok(name)
    }

    /// Seed a signature row. Used by catalog updaters and tests.
    pub fn insert_signature(
        &self,
        algorithm: DigestAlgorithm,
        hash: &str,
        malware_name: &str,
    ) -> Result<()> {
        let sql = match algorithm {
            DigestAlgorithm::Md5 => {
                "INSERT OR REPLACE INTO sig_md5 (hash, malware_name) VALUES (?1, ?2)"
            }
            DigestAlgorithm::Sha1 => {
                "INSERT OR REPLACE INTO sig_sha1 (hash, malware_name) VALUES (?1, ?2)"
            }
            DigestAlgorithm::Sha256 => {
                "INSERT OR REPLACE INTO sig_sha256 (hash, malware_name) VALUES (?1, ?2)"
            }
        };
        self.lock().execute(sql, params![hash, malware_name])?;
        Ok(())
    }

    // ── whitelist ───────────────────────────────────────────────────────

    /// Whether `(hash, algorithm)` is whitelisted.
    pub fn is_whitelisted(&self, hash: &str, algorithm: DigestAlgorithm) -> Result<bool> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT 1 FROM whitelist WHERE hash = ?1 AND hash_type = ?2 LIMIT 1",
        )?;
        let hit = stmt
            .query_row(params![hash, algorithm.lower()], |_| Ok(()))
            .optional()?;
        Ok(hit.is_some())
    }

    /// Insert or replace a whitelist entry. Idempotent on `(hash, hash_type)`.
    pub fn insert_whitelist(
        &self,
        hash: &str,
        algorithm: DigestAlgorithm,
        note: &str,
    ) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO whitelist (hash, hash_type, note) VALUES (?1, ?2, ?3)",
            params![hash, algorithm.lower(), note],
        )?;
        Ok(())
    }

    // ── db_info key-value config ────────────────────────────────────────

    pub fn info_value(&self, key: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT value FROM db_info WHERE key = ?1 LIMIT 1")?;
        let value = stmt
            .query_row(params![key], |row| row.get::<_, Option<String>>(0))
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_info_value(&self, key: &str, value: &str) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO db_info (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a `db_info` value as u64, falling back to `default` when the key
    /// is missing or unparsable.
    pub fn info_u64(&self, key: &str, default: u64) -> u64 {
        match self.info_value(key) {
            Ok(Some(v)) => v.trim().parse().unwrap_or(default),
            _ => default,
        }
    }

    // ── quarantine bookkeeping ──────────────────────────────────────────

    /// Insert a quarantine row and bump the cached `quarantine_total_size`
    /// counter in the same transaction. Returns the new record id.
    pub fn record_quarantine(
        &self,
        original_path: &str,
        stored_filename: &str,
        stored_path: &str,
        stored_size: u64,
        original_hash: &str,
    ) -> Result<i64> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO quarantine_files
                 (original_path, stored_filename, stored_path, stored_size,
                  quarantined_at, original_hash, hash_type, deleted, restored)
             VALUES (?1, ?2, ?3, ?4, datetime('now'), ?5, 'sha256', 0, 0)",
            params![
                original_path,
                stored_filename,
                stored_path,
                stored_size,
                original_hash
            ],
        )?;
        let id = tx.last_insert_rowid();
        bump_total_size(&tx, stored_size as i64)?;
        tx.commit()?;
        Ok(id)
    }

    /// Delete a quarantine row and decrement the size counter transactionally.
    pub fn delete_quarantine_record(&self, id: i64, stored_size: u64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM quarantine_files WHERE id = ?1", params![id])?;
        bump_total_size(&tx, -(stored_size as i64))?;
        tx.commit()?;
        Ok(())
    }

    /// Mark a record restored and release its bytes from the size counter.
    pub fn mark_restored(&self, id: i64, restored_path: &str, stored_size: u64) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE quarantine_files
                SET restored = 1, restored_at = datetime('now'), restored_path = ?1
              WHERE id = ?2",
            params![restored_path, id],
        )?;
        bump_total_size(&tx, -(stored_size as i64))?;
        tx.commit()?;
        Ok(())
    }

    /// Find a record by exact stored filename or by `stored_path/stored_filename`.
    pub fn find_quarantine_record(&self, name_or_path: &str) -> Result<Option<QuarantineRecord>> {
        let search_name = Path::new(name_or_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name_or_path.to_string());

        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, original_path, stored_filename, stored_path, stored_size,
                    quarantined_at, original_hash, hash_type, deleted, restored,
                    restored_at, restored_path
               FROM quarantine_files
              WHERE stored_filename = ?1
                 OR (stored_path || '/' || stored_filename) = ?2
              LIMIT 1",
        )?;
        let record = stmt
            .query_row(params![search_name, name_or_path], row_to_record)
            .optional()?;
        Ok(record)
    }

    /// Records still occupying repository space, oldest first.
    pub fn active_records_oldest_first(&self) -> Result<Vec<QuarantineRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, original_path, stored_filename, stored_path, stored_size,
                    quarantined_at, original_hash, hash_type, deleted, restored,
                    restored_at, restored_path
               FROM quarantine_files
              WHERE deleted = 0 AND restored = 0
              ORDER BY quarantined_at ASC, id ASC",
        )?;
        let rows = stmt.query_map([], row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Sum of stored sizes across records still on disk. Used as the
    /// fallback when the `db_info` counter is absent, and by tests to check
    /// the counter against the ground truth.
    pub fn active_total_size(&self) -> Result<u64> {
        let conn = self.lock();
        let total: i64 = conn.query_row(
            "SELECT COALESCE(SUM(stored_size), 0) FROM quarantine_files
              WHERE deleted = 0 AND restored = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(total.max(0) as u64)
    }
}

fn bump_total_size(tx: &rusqlite::Transaction<'_>, delta: i64) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO db_info (key, value)
         VALUES ('quarantine_total_size', MAX(0, ?1))
         ON CONFLICT(key) DO UPDATE
             SET value = MAX(0, CAST(value AS INTEGER) + ?1)",
        params![delta],
    )?;
    Ok(())
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<QuarantineRecord> {
    Ok(QuarantineRecord {
        id: row.get(0)?,
        original_path: row.get(1)?,
        stored_filename: row.get(2)?,
        stored_path: row.get(3)?,
        stored_size: row.get::<_, i64>(4)?.max(0) as u64,
        quarantined_at: row.get(5)?,
        original_hash: row.get::<_, Option<String>>(6)?.unwrap_or_default(),
        hash_type: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        deleted: row.get::<_, i64>(8)? != 0,
        restored: row.get::<_, i64>(9)? != 0,
        restored_at: row.get(10)?,
        restored_path: row.get(11)?,
    })
}
