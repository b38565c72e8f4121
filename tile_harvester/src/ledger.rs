//! Crash-safe progress ledger: a SQLite-backed record of which tiles have
//! already been processed, so a killed or interrupted run can resume
//! without re-fetching work it already finished.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{HarvestError, Result};

/// Bumped whenever the on-disk schema changes incompatibly. A ledger
/// written by a newer binary than the one opening it is a fatal error.
pub const SCHEMA_VERSION: i64 = 1;

/// Cap on the in-memory membership front. Past this, `contains` can
/// false-negative and callers fall back to [`Ledger::contains_in_db`].
const MAX_IN_MEMORY_TILES: usize = 1_000_000;

const LOAD_PAGE_SIZE: i64 = 10_000;

/// Tile writes per committed transaction. A `mark` call that crosses this
/// threshold commits the open transaction and starts a fresh one; crashing
/// mid-batch loses only the uncommitted tail, which gets re-fetched (and
/// re-marked, idempotently) on restart.
const FLUSH_EVERY: u32 = 200;

/// The ledger's single open write transaction, if any, plus how many rows
/// have been inserted into it since the last commit. Guarded by an async
/// mutex so only one writer holds it at a time; readers (`contains_in_db`,
/// `load_for_range`) go through the pool directly and so never see an
/// in-flight batch's uncommitted rows, matching the "committed batch
/// survives a crash, uncommitted work is idempotently retried" contract.
#[derive(Default)]
struct PendingBatch {
    tx: Option<Transaction<'static, Sqlite>>,
    count: u32,
}

/// A tile's outcome, as recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileStatus {
    Success,
    Failed,
    Skipped,
}

impl TileStatus {
    fn as_str(self) -> &'static str {
        match self {
            TileStatus::Success => "success",
            TileStatus::Failed => "failed",
            TileStatus::Skipped => "skipped",
        }
    }
}

/// Run totals, updated as tiles are marked. Cheap to read from the progress
/// reporter without touching the database.
#[derive(Debug, Default)]
pub struct LedgerCounts {
    pub downloaded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub total_bytes: AtomicU64,
}

impl LedgerCounts {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.downloaded.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.skipped.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed),
        )
    }
}

pub struct Ledger {
    pool: SqlitePool,
    seen: Mutex<HashSet<(u32, u32, u8)>>,
    /// Set once the in-memory front has hit [`MAX_IN_MEMORY_TILES`], either
    /// while paging in `load_for_range` or during a run's own `mark` calls.
    /// A "not found" answer from `seen` is only trustworthy while this is
    /// `false` — once frozen, a negative must be confirmed against the
    /// database before a caller treats the tile as unprocessed.
    front_frozen: AtomicBool,
    batch: AsyncMutex<PendingBatch>,
    pub counts: std::sync::Arc<LedgerCounts>,
}

#[derive(serde::Deserialize, Default)]
struct LegacyJsonLedger {
    #[serde(default, alias = "processed_tiles")]
    processed_tiles: Vec<LegacyJsonTile>,
}

#[derive(serde::Deserialize)]
struct LegacyJsonTile {
    x: u32,
    y: u32,
    z: u8,
    #[serde(default = "default_legacy_status")]
    status: String,
}

fn default_legacy_status() -> String {
    "success".to_string()
}

fn ledger_err(path: &Path, source: sqlx::Error) -> HarvestError {
    HarvestError::LedgerOpen {
        path: path.to_path_buf(),
        source,
    }
}

impl Ledger {
    /// Opens (creating if absent) the ledger at `path`. If no SQLite ledger
    /// exists yet but a legacy JSON ledger sits next to it, imports it
    /// before returning. `config_hash` is compared against the value
    /// stored on a previous run; a mismatch is logged, not rejected.
    ///
    /// A ledger file that exists but fails to open as a valid SQLite
    /// database (truncated by a crash mid-write, disk corruption, etc.) is
    /// renamed aside with a `.backup` suffix and the run starts with an
    /// empty ledger rather than aborting — the alternative is an operator
    /// stuck unable to resume at all because the resume mechanism itself is
    /// broken.
    pub async fn open(path: &Path, config_hash: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ledger_err(path, sqlx::Error::Io(e)))?;
        }

        let cache_kib = env_cache_kib("HARVEST_LEDGER_CACHE_MB", 1024);

        match Self::open_once(path, config_hash, cache_kib).await {
            Ok(ledger) => Ok(ledger),
            Err(first_err) if path.exists() => {
                tracing::error!(
                    path = %path.display(),
                    error = %first_err,
                    "progress ledger failed to open, quarantining as .backup and starting empty"
                );
                let backup = backup_path(path);
                tokio::fs::rename(path, &backup)
                    .await
                    .map_err(|e| ledger_err(path, sqlx::Error::Io(e)))?;
                for suffix in ["-wal", "-shm"] {
                    let sidecar = PathBuf::from(format!("{}{suffix}", path.display()));
                    let _ = tokio::fs::remove_file(&sidecar).await;
                }
                Self::open_once(path, config_hash, cache_kib).await
            }
            Err(e) => Err(e),
        }
    }

    async fn open_once(path: &Path, config_hash: &str, cache_kib: i64) -> Result<Self> {
        let db_existed = path.exists();
        let legacy_path = legacy_json_path(path);

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30))
            .pragma("cache_size", format!("-{cache_kib}"));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| ledger_err(path, e))?;

        sqlx::query("CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await
            .map_err(|e| ledger_err(path, e))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS processed_tiles (
                x INTEGER NOT NULL,
                y INTEGER NOT NULL,
                z INTEGER NOT NULL,
                status TEXT NOT NULL,
                bytes INTEGER NOT NULL DEFAULT 0,
                timestamp REAL NOT NULL,
                PRIMARY KEY (x, y, z)
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| ledger_err(path, e))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_processed_tiles_status ON processed_tiles(status)")
            .execute(&pool)
            .await
            .map_err(|e| ledger_err(path, e))?;

        let ledger = Ledger {
            pool,
            seen: Mutex::new(HashSet::new()),
            front_frozen: AtomicBool::new(false),
            batch: AsyncMutex::new(PendingBatch::default()),
            counts: std::sync::Arc::new(LedgerCounts::default()),
        };

        ledger.check_schema_version(path).await?;

        if !db_existed && legacy_path.exists() {
            ledger.migrate_legacy_json(&legacy_path).await?;
        }

        ledger.reconcile_config_hash(config_hash).await?;
        ledger.load_counts(path).await?;

        Ok(ledger)
    }

    async fn check_schema_version(&self, path: &Path) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'schema_version'")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| ledger_err(path, e))?;

        match existing {
            Some(v) => {
                let found: i64 = v.parse().unwrap_or(0);
                if found > SCHEMA_VERSION {
                    return Err(HarvestError::LedgerSchemaTooNew {
                        found,
                        supported: SCHEMA_VERSION,
                    });
                }
            }
            None => {
                sqlx::query("INSERT INTO metadata (key, value) VALUES ('schema_version', ?)")
                    .bind(SCHEMA_VERSION.to_string())
                    .execute(&self.pool)
                    .await
                    .map_err(|e| ledger_err(path, e))?;
            }
        }
        Ok(())
    }

    async fn reconcile_config_hash(&self, config_hash: &str) -> Result<()> {
        let existing: Option<String> = sqlx::query_scalar("SELECT value FROM metadata WHERE key = 'config_hash'")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HarvestError::Fatal(e.to_string()))?;

        match existing {
            Some(stored) if stored != config_hash => {
                tracing::warn!(
                    stored = %stored,
                    current = %config_hash,
                    "ledger config fingerprint changed since the last run against this ledger"
                );
            }
            Some(_) => {}
            None => {
                sqlx::query("INSERT INTO metadata (key, value) VALUES ('config_hash', ?)")
                    .bind(config_hash)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| HarvestError::Fatal(e.to_string()))?;
            }
        }
        Ok(())
    }

    async fn migrate_legacy_json(&self, legacy_path: &Path) -> Result<()> {
        let data = tokio::fs::read(legacy_path)
            .await
            .map_err(|e| ledger_err(legacy_path, sqlx::Error::Io(e)))?;

        let legacy: LegacyJsonLedger = match serde_json::from_slice(&data) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(path = %legacy_path.display(), error = %e, "legacy JSON ledger is unreadable, skipping migration");
                return Ok(());
            }
        };

        tracing::info!(
            count = legacy.processed_tiles.len(),
            path = %legacy_path.display(),
            "migrating legacy JSON ledger into the SQLite ledger"
        );

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| HarvestError::Fatal(e.to_string()))?;

        for tile in &legacy.processed_tiles {
            sqlx::query(
                "INSERT OR IGNORE INTO processed_tiles (x, y, z, status, bytes, timestamp)
                 VALUES (?, ?, ?, ?, 0, 0)",
            )
            .bind(tile.x)
            .bind(tile.y)
            .bind(tile.z)
            .bind(&tile.status)
            .execute(&mut *tx)
            .await
            .map_err(|e| HarvestError::Fatal(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
        Ok(())
    }

    async fn load_counts(&self, path: &Path) -> Result<()> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END), 0) AS s,
                COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0) AS f,
                COALESCE(SUM(CASE WHEN status = 'skipped' THEN 1 ELSE 0 END), 0) AS k,
                COALESCE(SUM(bytes), 0) AS b
             FROM processed_tiles",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| ledger_err(path, e))?;

        let s: i64 = row.try_get("s").unwrap_or(0);
        let f: i64 = row.try_get("f").unwrap_or(0);
        let k: i64 = row.try_get("k").unwrap_or(0);
        let b: i64 = row.try_get("b").unwrap_or(0);

        self.counts.downloaded.store(s as u64, Ordering::Relaxed);
        self.counts.failed.store(f as u64, Ordering::Relaxed);
        self.counts.skipped.store(k as u64, Ordering::Relaxed);
        self.counts.total_bytes.store(b as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Membership check the task source consults per tile. A hit in the
    /// in-memory front is always trustworthy (only genuinely processed
    /// tiles ever land there). A miss is trustworthy too, *unless* the
    /// front has been frozen by hitting [`MAX_IN_MEMORY_TILES`] — at that
    /// point a negative no longer proves the tile unprocessed, since some
    /// completed tiles never made it into memory, so this falls back to an
    /// authoritative point lookup against the database. Below the cap this
    /// never touches the database at all.
    pub async fn contains(&self, x: u32, y: u32, z: u8) -> Result<bool> {
        if self.contains_in_memory(x, y, z) {
            return Ok(true);
        }
        if self.front_frozen.load(Ordering::Relaxed) {
            self.contains_in_db(x, y, z).await
        } else {
            Ok(false)
        }
    }

    /// The raw in-memory front check, with no database fallback. Exposed
    /// for callers (and tests) that specifically want the best-effort,
    /// zero-I/O answer.
    pub fn contains_in_memory(&self, x: u32, y: u32, z: u8) -> bool {
        self.seen.lock().unwrap().contains(&(x, y, z))
    }

    /// Authoritative membership check against the database.
    pub async fn contains_in_db(&self, x: u32, y: u32, z: u8) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM processed_tiles WHERE x = ? AND y = ? AND z = ? LIMIT 1")
            .bind(x)
            .bind(y)
            .bind(z)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| HarvestError::Fatal(e.to_string()))?;
        Ok(row.is_some())
    }

    /// Loads previously processed tiles within `[min_zoom, max_zoom]` into
    /// the in-memory front, paged to bound peak memory. Stops once the
    /// front reaches [`MAX_IN_MEMORY_TILES`]; the task source falls back to
    /// the database for ranges too large to fully cache.
    pub async fn load_for_range(&self, min_zoom: u8, max_zoom: u8) -> Result<()> {
        let mut offset: i64 = 0;
        loop {
            let rows = sqlx::query("SELECT x, y, z FROM processed_tiles WHERE z >= ? AND z <= ? LIMIT ? OFFSET ?")
                .bind(min_zoom)
                .bind(max_zoom)
                .bind(LOAD_PAGE_SIZE)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| HarvestError::Fatal(e.to_string()))?;

            if rows.is_empty() {
                break;
            }
            let fetched = rows.len();

            let mut full = false;
            {
                let mut seen = self.seen.lock().unwrap();
                for row in rows {
                    if seen.len() >= MAX_IN_MEMORY_TILES {
                        full = true;
                        break;
                    }
                    let x: i64 = row.try_get(0).unwrap_or(0);
                    let y: i64 = row.try_get(1).unwrap_or(0);
                    let z: i64 = row.try_get(2).unwrap_or(0);
                    seen.insert((x as u32, y as u32, z as u8));
                }
            }
            if full {
                self.front_frozen.store(true, Ordering::Relaxed);
            }

            if full || fetched < LOAD_PAGE_SIZE as usize {
                break;
            }
            offset += LOAD_PAGE_SIZE;
        }
        Ok(())
    }

    /// Records a tile's outcome. Idempotent: if the tile was already marked
    /// (by either the in-memory front or, on a first-touch-this-run miss,
    /// the database), the skipped counter increments and the stored row is
    /// left untouched — no status overwrite, no duplicate insert. Returns
    /// whether a new row was written.
    pub async fn mark(&self, x: u32, y: u32, z: u8, status: TileStatus, bytes: u64) -> Result<bool> {
        let already_in_memory = {
            let mut seen = self.seen.lock().unwrap();
            if seen.contains(&(x, y, z)) {
                true
            } else {
                if seen.len() < MAX_IN_MEMORY_TILES {
                    seen.insert((x, y, z));
                } else {
                    self.front_frozen.store(true, Ordering::Relaxed);
                }
                false
            }
        };

        if already_in_memory {
            self.counts.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let result = self.insert_batched(x, y, z, status, bytes, now).await?;

        if !result {
            self.counts.skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }

        match status {
            TileStatus::Success => {
                self.counts.downloaded.fetch_add(1, Ordering::Relaxed);
                self.counts.total_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            TileStatus::Failed => {
                self.counts.failed.fetch_add(1, Ordering::Relaxed);
            }
            TileStatus::Skipped => {
                self.counts.skipped.fetch_add(1, Ordering::Relaxed);
            }
        }

        Ok(true)
    }

    /// `INSERT OR IGNORE` against the currently open batch transaction,
    /// opening one if none is pending and committing (restarting the
    /// count) once [`FLUSH_EVERY`] rows have accumulated in it. Retried
    /// with exponential backoff on "database is locked" contention.
    /// Returns whether a row was actually inserted.
    async fn insert_batched(&self, x: u32, y: u32, z: u8, status: TileStatus, bytes: u64, timestamp: f64) -> Result<bool> {
        const MAX_ATTEMPTS: u32 = 5;
        let mut guard = self.batch.lock().await;
        if guard.tx.is_none() {
            let tx = self.pool.begin().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
            guard.tx = Some(tx);
        }

        let mut delay = Duration::from_secs(1);
        let mut inserted = false;
        let mut attempt = 0;
        loop {
            let tx = guard.tx.as_mut().expect("batch transaction just ensured open");
            let result = sqlx::query(
                "INSERT OR IGNORE INTO processed_tiles (x, y, z, status, bytes, timestamp)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(x)
            .bind(y)
            .bind(z)
            .bind(status.as_str())
            .bind(bytes as i64)
            .bind(timestamp)
            .execute(&mut **tx)
            .await;

            match result {
                Ok(outcome) => {
                    inserted = outcome.rows_affected() > 0;
                    break;
                }
                Err(sqlx::Error::Database(db_err)) if is_locked(&*db_err) && attempt + 1 < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, "ledger write contended, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(HarvestError::Fatal(e.to_string())),
            }
        }

        guard.count += 1;
        if guard.count >= FLUSH_EVERY {
            let tx = guard.tx.take().expect("batch transaction just used");
            tx.commit().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
            guard.count = 0;
        }

        Ok(inserted)
    }

    /// Commits the currently open batch transaction, if any. Called at
    /// every `N` completions internally (see [`FLUSH_EVERY`]) and
    /// explicitly by the controller on pause, cancel, fatal error, normal
    /// completion, and signal receipt.
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.tx.take() {
            tx.commit().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
        }
        guard.count = 0;
        Ok(())
    }
}

fn is_locked(db_err: &dyn sqlx::error::DatabaseError) -> bool {
    db_err.message().contains("database is locked") || db_err.message().contains("database is busy")
}

fn legacy_json_path(sqlite_path: &Path) -> PathBuf {
    sqlite_path.with_extension("json")
}

/// `.backup`, `.backup.1`, `.backup.2`, ... so a second consecutive
/// corruption doesn't clobber the first quarantined file.
fn backup_path(path: &Path) -> PathBuf {
    let base = PathBuf::from(format!("{}.backup", path.display()));
    if !base.exists() {
        return base;
    }
    (1u32..).map(|n| PathBuf::from(format!("{}.backup.{n}", path.display())))
        .find(|p| !p.exists())
        .unwrap_or(base)
}

fn env_cache_kib(name: &str, default_mb: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i64>().ok())
        .filter(|mb| *mb > 0)
        .unwrap_or(default_mb)
        * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.db");
        let ledger = Ledger::open(&path, "test-hash").await.unwrap();
        (dir, ledger)
    }

    #[tokio::test]
    async fn mark_then_contains() {
        let (_dir, ledger) = open_temp().await;
        assert!(!ledger.contains(1, 2, 3).await.unwrap());
        let inserted = ledger.mark(1, 2, 3, TileStatus::Success, 1024).await.unwrap();
        assert!(inserted);
        assert!(ledger.contains(1, 2, 3).await.unwrap());
        let (downloaded, failed, skipped, bytes) = ledger.counts.snapshot();
        assert_eq!((downloaded, failed, skipped, bytes), (1, 0, 0, 1024));
    }

    #[tokio::test]
    async fn duplicate_mark_increments_skip_without_rewriting_row() {
        let (_dir, ledger) = open_temp().await;
        ledger.mark(5, 5, 5, TileStatus::Success, 500).await.unwrap();
        let inserted_again = ledger.mark(5, 5, 5, TileStatus::Failed, 0).await.unwrap();
        assert!(!inserted_again);

        let (downloaded, failed, skipped, bytes) = ledger.counts.snapshot();
        assert_eq!(downloaded, 1);
        assert_eq!(failed, 0);
        assert_eq!(skipped, 1);
        assert_eq!(bytes, 500);
        ledger.flush().await.unwrap();
        assert!(ledger.contains_in_db(5, 5, 5).await.unwrap());
    }

    #[tokio::test]
    async fn reopen_loads_persisted_progress() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.db");
        {
            let ledger = Ledger::open(&path, "hash-a").await.unwrap();
            ledger.mark(1, 1, 4, TileStatus::Success, 10).await.unwrap();
            ledger.flush().await.unwrap();
        }
        let reopened = Ledger::open(&path, "hash-a").await.unwrap();
        assert!(reopened.contains_in_db(1, 1, 4).await.unwrap());
        let (downloaded, ..) = reopened.counts.snapshot();
        assert_eq!(downloaded, 1);
    }

    #[tokio::test]
    async fn batch_commits_automatically_at_flush_every() {
        let (_dir, ledger) = open_temp().await;
        for i in 0..FLUSH_EVERY {
            ledger.mark(i, 0, 9, TileStatus::Success, 1).await.unwrap();
        }
        // The batch should have auto-committed on the FLUSH_EVERY-th row,
        // so the first row is visible without an explicit flush.
        assert!(ledger.contains_in_db(0, 0, 9).await.unwrap());
    }

    #[tokio::test]
    async fn uncommitted_batch_is_invisible_to_db_reads_until_flushed() {
        let (_dir, ledger) = open_temp().await;
        ledger.mark(1, 1, 9, TileStatus::Success, 1).await.unwrap();
        assert!(!ledger.contains_in_db(1, 1, 9).await.unwrap());
        ledger.flush().await.unwrap();
        assert!(ledger.contains_in_db(1, 1, 9).await.unwrap());
    }

    #[tokio::test]
    async fn load_for_range_populates_front() {
        let (_dir, ledger) = open_temp().await;
        for x in 0..5u32 {
            ledger.mark(x, 0, 10, TileStatus::Success, 1).await.unwrap();
        }
        let fresh = {
            let seen = ledger.seen.lock().unwrap();
            seen.clone()
        };
        assert_eq!(fresh.len(), 5);
    }

    #[tokio::test]
    async fn migrates_legacy_json_ledger_on_first_open() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("osm_progress.db");
        let json_path = db_path.with_extension("json");
        tokio::fs::write(
            &json_path,
            r#"{"processed_tiles": [{"x": 1, "y": 2, "z": 3, "status": "success"}]}"#,
        )
        .await
        .unwrap();

        let ledger = Ledger::open(&db_path, "hash").await.unwrap();
        assert!(ledger.contains_in_db(1, 2, 3).await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_ledger_file_is_quarantined_and_replaced_with_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.db");
        tokio::fs::write(&path, b"this is not a sqlite database")
            .await
            .unwrap();

        let ledger = Ledger::open(&path, "hash").await.unwrap();
        assert!(!ledger.contains(1, 1, 1).await.unwrap());
        assert!(PathBuf::from(format!("{}.backup", path.display())).exists());
    }

    #[tokio::test]
    async fn rejects_newer_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.db");
        {
            let ledger = Ledger::open(&path, "hash").await.unwrap();
            sqlx::query("UPDATE metadata SET value = ? WHERE key = 'schema_version'")
                .bind((SCHEMA_VERSION + 1).to_string())
                .execute(&ledger.pool)
                .await
                .unwrap();
        }
        let err = Ledger::open(&path, "hash").await.unwrap_err();
        assert!(matches!(err, HarvestError::LedgerSchemaTooNew { .. }));
    }
}
