//! Local repository cache
//!
//! SQLite-backed record of verified downloads, one entry per
//! (repository id, coordinate). Entries are written only after a
//! transfer passed checksum verification, in a single UPSERT, so a
//! cache entry always points at a file that was good at write time.
//! WAL mode, auto-recovery on corruption.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::coordinate::Coordinate;
use crate::error::{CoreError, Result};
use crate::repository::UpdatePolicy;

/// One verified download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub repository_id: String,
    pub coordinate: String,
    pub path: PathBuf,
    /// `<algorithm>:<hex>` of the verified bytes, when one was available
    pub checksum: Option<String>,
    pub last_verified: DateTime<Utc>,
}

/// SQLite cache of verified transfers, shared by all connectors of a
/// session.
pub struct LocalCache {
    conn: Mutex<Connection>,
}

impl LocalCache {
    /// Open or create the cache at the default user location.
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    /// Open or create the cache at a specific path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let result = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        );

        let conn = match result {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!("transfer cache corrupted, recreating: {}", e);
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                Connection::open(path)?
            }
        };

        let cache = Self {
            conn: Mutex::new(conn),
        };
        cache.init()?;
        Ok(cache)
    }

    /// In-memory cache, for tests and throwaway sessions.
    pub fn open_memory() -> Result<Self> {
        let cache = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        cache.init()?;
        Ok(cache)
    }

    /// Default cache location under the user cache directory.
    pub fn default_path() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir().ok_or_else(|| CoreError::Cache {
            message: "Could not determine cache directory".to_string(),
        })?;
        Ok(cache_dir.join("lodestone").join("transfers.db"))
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock();
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS transfers (
                repository_id TEXT NOT NULL,
                coordinate TEXT NOT NULL,
                path TEXT NOT NULL,
                checksum TEXT,
                last_verified INTEGER NOT NULL,
                PRIMARY KEY (repository_id, coordinate)
            );
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a verified download. Last writer wins; only called after
    /// checksum verification passed.
    pub fn record(
        &self,
        repository_id: &str,
        coordinate: &Coordinate,
        path: &Path,
        checksum: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            r#"
            INSERT INTO transfers (repository_id, coordinate, path, checksum, last_verified)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (repository_id, coordinate) DO UPDATE SET
                path = excluded.path,
                checksum = excluded.checksum,
                last_verified = excluded.last_verified
            "#,
            params![
                repository_id,
                coordinate.to_string(),
                path.display().to_string(),
                checksum,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    /// Look up the entry for a coordinate, if one was ever verified.
    pub fn lookup(&self, repository_id: &str, coordinate: &Coordinate) -> Result<Option<CacheEntry>> {
        let conn = self.lock();
        let entry = conn
            .query_row(
                r#"
                SELECT path, checksum, last_verified FROM transfers
                WHERE repository_id = ?1 AND coordinate = ?2
                "#,
                params![repository_id, coordinate.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(entry.map(|(path, checksum, timestamp)| CacheEntry {
            repository_id: repository_id.to_string(),
            coordinate: coordinate.to_string(),
            path: PathBuf::from(path),
            checksum,
            last_verified: Utc.timestamp_opt(timestamp, 0)
                .single()
                .unwrap_or_else(Utc::now),
        }))
    }

    /// Whether an entry satisfies the repository's update policy without
    /// re-checking the remote. `Daily` compares UTC calendar days.
    pub fn is_up_to_date(entry: &CacheEntry, policy: UpdatePolicy) -> bool {
        match policy {
            UpdatePolicy::Always => false,
            UpdatePolicy::Never => true,
            UpdatePolicy::Daily => entry.last_verified.date_naive() == Utc::now().date_naive(),
        }
    }
}
