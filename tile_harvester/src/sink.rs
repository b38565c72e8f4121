//! Tile storage backends: a plain directory tree, or one or more MBTiles
//! (SQLite) databases, optionally sharded by zoom level.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tokio::sync::Mutex as AsyncMutex;

use crate::error::{HarvestError, Result, SinkOpenError};

/// Tile writes per committed transaction for an MBTiles database.
const MBTILES_FLUSH_EVERY: u32 = 1000;

fn open_err(path: &Path, source: SinkOpenError) -> HarvestError {
    HarvestError::SinkOpen {
        path: path.to_path_buf(),
        source,
    }
}

/// Where a successfully fetched tile ends up, and whether it was already
/// there before the fetch started.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    /// Returns `true` if the tile already exists and the fetch can be
    /// skipped entirely (filesystem sinks only; MBTiles sinks always
    /// report `false` here since an existence probe would cost a query per
    /// tile for no benefit — `INSERT OR REPLACE` already makes the write
    /// idempotent).
    async fn already_present(&self, x: u32, y: u32, z: u8) -> Result<bool>;

    async fn put(&self, x: u32, y: u32, z: u8, data: &[u8]) -> Result<()>;

    /// Flushes any buffered writes. Safe to call repeatedly; a no-op sink
    /// with nothing buffered just returns immediately.
    async fn finalize(&self) -> Result<()>;

    /// Like [`Sink::finalize`], but called on a cancelled run: tolerant of
    /// partial state (a sharded MBTiles sink that never opened any shard,
    /// for instance) rather than treating an empty batch as an error.
    /// Default implementation just forwards to `finalize`, which already
    /// satisfies that contract for both sink backends.
    async fn cancel(&self) -> Result<()> {
        self.finalize().await
    }
}

/// Writes tiles to `root/[prefix/]z/x/y.ext`, matching
/// [`crate::provider::Provider::path_for`].
pub struct FsSink {
    root: PathBuf,
    provider: crate::provider::Provider,
    created_dirs: StdMutex<std::collections::HashSet<PathBuf>>,
}

impl FsSink {
    pub async fn open(root: &Path, provider: crate::provider::Provider) -> Result<Self> {
        tokio::fs::create_dir_all(root)
            .await
            .map_err(|e| open_err(root, SinkOpenError::Io(e)))?;
        Ok(FsSink {
            root: root.to_path_buf(),
            provider,
            created_dirs: StdMutex::new(std::collections::HashSet::new()),
        })
    }

    fn tile_path(&self, x: u32, y: u32, z: u8) -> PathBuf {
        self.provider.path_for(x, y, z, &self.root)
    }
}

#[async_trait::async_trait]
impl Sink for FsSink {
    async fn already_present(&self, x: u32, y: u32, z: u8) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.tile_path(x, y, z))
            .await
            .unwrap_or(false))
    }

    async fn put(&self, x: u32, y: u32, z: u8, data: &[u8]) -> Result<()> {
        let path = self.tile_path(x, y, z);
        let parent = path.parent().expect("tile path always has a parent").to_path_buf();

        let needs_dir = {
            let mut created = self.created_dirs.lock().unwrap();
            created.insert(parent.clone())
        };
        if needs_dir {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| open_err(&parent, SinkOpenError::Io(e)))?;
        }

        // Write to a sibling temp file and rename, so a crash mid-write
        // never leaves a truncated tile behind.
        let tmp_path = path.with_extension(format!(
            "{}.part",
            path.extension().and_then(|e| e.to_str()).unwrap_or("tile")
        ));
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(|e| open_err(&tmp_path, SinkOpenError::Io(e)))?;
        tokio::fs::rename(&tmp_path, &path)
            .await
            .map_err(|e| open_err(&path, SinkOpenError::Io(e)))?;
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

const METADATA: &[(&str, &str)] = &[
    ("name", "tile_harvester"),
    ("type", "baselayer"),
    ("version", "1.0"),
];

async fn open_mbtiles_pool(path: &Path, extension: &str, scheme: &str, description: &str) -> Result<SqlitePool> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| open_err(path, SinkOpenError::Io(e)))?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(30))
        .pragma("cache_size", "-500000");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS tiles (
            zoom_level INTEGER,
            tile_column INTEGER,
            tile_row INTEGER,
            tile_data BLOB,
            PRIMARY KEY (zoom_level, tile_column, tile_row)
        )",
    )
    .execute(&pool)
    .await
    .map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;

    sqlx::query("CREATE TABLE IF NOT EXISTS metadata (name TEXT, value TEXT, PRIMARY KEY (name))")
        .execute(&pool)
        .await
        .map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;

    let mut tx = pool.begin().await.map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;
    for (name, value) in METADATA {
        sqlx::query("INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)")
            .bind(*name)
            .bind(*value)
            .execute(&mut *tx)
            .await
            .map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;
    }
    for (name, value) in [("description", description), ("format", extension), ("scheme", scheme)] {
        sqlx::query("INSERT OR REPLACE INTO metadata (name, value) VALUES (?, ?)")
            .bind(name)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;
    }
    tx.commit().await.map_err(|e| open_err(path, SinkOpenError::Sqlite(e)))?;

    Ok(pool)
}

/// Converts a Slippy/XYZ row index into the MBTiles (TMS) row convention
/// the `tiles` table expects, regardless of whether the run itself is
/// operating in TMS mode.
fn mbtiles_row(y: u32, z: u8) -> u32 {
    crate::tile_math::flip_y(y, z)
}

/// An open transaction against an MBTiles database, plus how many tiles
/// have been inserted into it since the last commit.
#[derive(Default)]
struct MbtilesBatch {
    tx: Option<Transaction<'static, Sqlite>>,
    count: u32,
}

/// One MBTiles database and its in-flight batch transaction. Shared by
/// [`MbtilesSink`] (one instance) and [`ShardedMbtilesSink`] (one per
/// zoom). Writes commit every [`MBTILES_FLUSH_EVERY`] tiles; `finalize`
/// commits whatever is left.
struct MbtilesHandle {
    pool: SqlitePool,
    batch: AsyncMutex<MbtilesBatch>,
}

impl MbtilesHandle {
    async fn open(path: &Path, extension: &str, scheme: &str, description: &str) -> Result<Self> {
        let pool = open_mbtiles_pool(path, extension, scheme, description).await?;
        Ok(MbtilesHandle {
            pool,
            batch: AsyncMutex::new(MbtilesBatch::default()),
        })
    }

    async fn put(&self, x: u32, y: u32, z: u8, data: &[u8]) -> Result<()> {
        // Matches spec.md §4.D/§7's "database is locked" policy: exponential
        // backoff 1, 2, 4, 8, 16s, up to 5 attempts, before surfacing fatal.
        const MAX_ATTEMPTS: u32 = 5;
        let row = mbtiles_row(y, z);

        let mut guard = self.batch.lock().await;
        if guard.tx.is_none() {
            let tx = self.pool.begin().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
            guard.tx = Some(tx);
        }

        let mut delay = Duration::from_secs(1);
        let mut attempt = 0;
        loop {
            let tx = guard.tx.as_mut().expect("batch transaction just ensured open");
            let result = sqlx::query(
                "INSERT OR REPLACE INTO tiles (zoom_level, tile_column, tile_row, tile_data) VALUES (?, ?, ?, ?)",
            )
            .bind(z)
            .bind(x)
            .bind(row)
            .bind(data)
            .execute(&mut **tx)
            .await;

            match result {
                Ok(_) => break,
                Err(sqlx::Error::Database(db_err))
                    if db_err.message().contains("locked") && attempt + 1 < MAX_ATTEMPTS =>
                {
                    tracing::warn!(attempt, "mbtiles write contended, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                    attempt += 1;
                }
                Err(e) => return Err(HarvestError::Fatal(e.to_string())),
            }
        }

        guard.count += 1;
        if guard.count >= MBTILES_FLUSH_EVERY {
            let tx = guard.tx.take().expect("batch transaction just used");
            tx.commit().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
            guard.count = 0;
        }

        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        let mut guard = self.batch.lock().await;
        if let Some(tx) = guard.tx.take() {
            tx.commit().await.map_err(|e| HarvestError::Fatal(e.to_string()))?;
        }
        guard.count = 0;
        Ok(())
    }
}

/// A single, unsharded MBTiles file covering every zoom level.
pub struct MbtilesSink {
    handle: MbtilesHandle,
}

impl MbtilesSink {
    pub async fn open(path: &Path, extension: &str, scheme: &str) -> Result<Self> {
        let handle = MbtilesHandle::open(path, extension, scheme, "Generated by tile_harvester").await?;
        Ok(MbtilesSink { handle })
    }
}

#[async_trait::async_trait]
impl Sink for MbtilesSink {
    async fn already_present(&self, _x: u32, _y: u32, _z: u8) -> Result<bool> {
        Ok(false)
    }

    async fn put(&self, x: u32, y: u32, z: u8, data: &[u8]) -> Result<()> {
        self.handle.put(x, y, z, data).await
    }

    async fn finalize(&self) -> Result<()> {
        self.handle.finalize().await
    }
}

/// One MBTiles file per zoom level, selected by substituting `{z}` in the
/// configured output path. Connections are opened lazily and cached.
pub struct ShardedMbtilesSink {
    path_template: String,
    extension: String,
    scheme: String,
    shards: AsyncMutex<HashMap<u8, MbtilesHandle>>,
}

impl ShardedMbtilesSink {
    pub fn new(path_template: impl Into<String>, extension: impl Into<String>, scheme: impl Into<String>) -> Self {
        ShardedMbtilesSink {
            path_template: path_template.into(),
            extension: extension.into(),
            scheme: scheme.into(),
            shards: AsyncMutex::new(HashMap::new()),
        }
    }

    fn shard_path(&self, z: u8) -> PathBuf {
        PathBuf::from(self.path_template.replace("{z}", &z.to_string()))
    }
}

#[async_trait::async_trait]
impl Sink for ShardedMbtilesSink {
    async fn already_present(&self, _x: u32, _y: u32, _z: u8) -> Result<bool> {
        Ok(false)
    }

    async fn put(&self, x: u32, y: u32, z: u8, data: &[u8]) -> Result<()> {
        let mut shards = self.shards.lock().await;
        if !shards.contains_key(&z) {
            let path = self.shard_path(z);
            let description = format!("Generated by tile_harvester for zoom level {z}");
            let handle = MbtilesHandle::open(&path, &self.extension, &self.scheme, &description).await?;
            shards.insert(z, handle);
        }
        shards.get(&z).expect("just inserted").put(x, y, z, data).await
    }

    /// Commits every shard's outstanding batch.
    async fn finalize(&self) -> Result<()> {
        let shards = self.shards.lock().await;
        for handle in shards.values() {
            handle.finalize().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Provider;

    #[tokio::test]
    async fn fs_sink_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Provider::custom("c", "http://x/{z}/{x}/{y}.png", vec![], 0, 22).unwrap();
        let sink = FsSink::open(dir.path(), provider).await.unwrap();

        assert!(!sink.already_present(1, 2, 3).await.unwrap());
        sink.put(1, 2, 3, b"tiledata").await.unwrap();
        assert!(sink.already_present(1, 2, 3).await.unwrap());

        let contents = tokio::fs::read(dir.path().join("3/1/2.png")).await.unwrap();
        assert_eq!(contents, b"tiledata");
    }

    #[tokio::test]
    async fn mbtiles_sink_stores_tms_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mbtiles");
        let sink = MbtilesSink::open(&path, "png", "xyz").await.unwrap();
        sink.put(1, 2, 3, b"hello").await.unwrap();
        sink.finalize().await.unwrap();

        let row: (Vec<u8>,) = sqlx::query_as(
            "SELECT tile_data FROM tiles WHERE zoom_level = 3 AND tile_column = 1 AND tile_row = ?",
        )
        .bind(mbtiles_row(2, 3))
        .fetch_one(&sink.handle.pool)
        .await
        .unwrap();
        assert_eq!(row.0, b"hello");
    }

    #[tokio::test]
    async fn mbtiles_sink_batches_commits_every_flush_every_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.mbtiles");
        let sink = MbtilesSink::open(&path, "png", "xyz").await.unwrap();

        for x in 0..MBTILES_FLUSH_EVERY {
            sink.put(x, 0, 5, b"x").await.unwrap();
        }
        // The MBTILES_FLUSH_EVERY-th insert should have auto-committed, so
        // the first row is visible through a fresh query without an
        // explicit finalize.
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tiles WHERE zoom_level = 5")
            .fetch_one(&sink.handle.pool)
            .await
            .unwrap();
        assert_eq!(count.0, MBTILES_FLUSH_EVERY as i64);
    }

    #[tokio::test]
    async fn sharded_mbtiles_creates_one_file_per_zoom() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("tiles_z{z}.mbtiles");
        let sink = ShardedMbtilesSink::new(template.to_str().unwrap(), "png", "xyz");

        sink.put(0, 0, 3, b"a").await.unwrap();
        sink.put(0, 0, 4, b"b").await.unwrap();

        assert!(dir.path().join("tiles_z3.mbtiles").exists());
        assert!(dir.path().join("tiles_z4.mbtiles").exists());
    }
}
