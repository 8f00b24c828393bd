//! Database module for the workload-management core.
//!
//! This module provides the persistence layer using SQLite with sqlx.
//! It includes connection pool management, the transaction wrapper every
//! lifecycle operation runs in, models and the three stores.

pub mod batching;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod time;

pub use batching::{BatchWriter, BatchWriterConfig};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::Result;

/// Database connection pool type alias.
pub type DbPool = Pool<Sqlite>;

/// Serialized write pool type alias (max_connections=1).
pub type WritePool = Pool<Sqlite>;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 10;

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default cache size (negative = KiB, so this is 64MB).
const DEFAULT_CACHE_SIZE_KB: i32 = -64000;

/// Default WAL auto-checkpoint threshold in pages.
const DEFAULT_WAL_AUTOCHECKPOINT_PAGES: i32 = 1000;

async fn apply_per_connection_pragmas(
    conn: &mut sqlx::SqliteConnection,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(&format!(
        "PRAGMA wal_autocheckpoint = {}",
        DEFAULT_WAL_AUTOCHECKPOINT_PAGES
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!("PRAGMA cache_size = {}", DEFAULT_CACHE_SIZE_KB))
        .execute(&mut *conn)
        .await?;

    sqlx::query("PRAGMA temp_store = MEMORY")
        .execute(&mut *conn)
        .await?;

    Ok(())
}

async fn ensure_wal_mode(pool: &DbPool, pool_name: &str) -> std::result::Result<(), sqlx::Error> {
    let mut conn = pool.acquire().await?;
    let row = sqlx::query("PRAGMA journal_mode")
        .fetch_one(&mut *conn)
        .await?;
    let mode: String = row.get(0);
    if mode != "wal" && mode != "memory" {
        warn!(
            pool = pool_name,
            mode = %mode,
            "journal_mode was not 'wal'; re-setting"
        );
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

fn connect_options(database_url: &str) -> std::result::Result<SqliteConnectOptions, sqlx::Error> {
    Ok(SqliteConnectOptions::from_str(database_url)?
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
        // Cascading deletes of jobs, ledger rows and task-queue members rely on this.
        .foreign_keys(true)
        .create_if_missing(true))
}

/// Compute a sensible default read pool size based on available CPU cores.
pub fn default_read_pool_size() -> u32 {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(2);
    (cores * 2).min(DEFAULT_POOL_SIZE)
}

/// Initialize the read pool with WAL mode.
///
/// # Arguments
/// * `database_url` - SQLite database URL (e.g., "sqlite:wms.db?mode=rwc")
/// * `max_connections` - Maximum number of connections in the pool
pub async fn init_pool_with_size(database_url: &str, max_connections: u32) -> Result<DbPool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "read_pool").await?;

    tracing::info!(max_connections, "Database read pool initialized");

    Ok(pool)
}

/// Initialize the read pool with default size.
pub async fn init_pool(database_url: &str) -> Result<DbPool> {
    init_pool_with_size(database_url, default_read_pool_size()).await
}

/// Initialize a serialized write pool with `max_connections = 1`.
///
/// Every lifecycle operation takes its `BEGIN IMMEDIATE` transaction from this
/// pool, so at most one writer holds the SQLite write lock at a time. This is
/// what keeps ledger sequence numbers contiguous under concurrent callers.
pub async fn init_write_pool(database_url: &str) -> Result<WritePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(60))
        .after_connect(|conn, _meta| {
            Box::pin(async move { apply_per_connection_pragmas(&mut *conn).await })
        })
        .connect_with(connect_options(database_url)?)
        .await?;

    ensure_wal_mode(&pool, "write_pool").await?;

    tracing::info!("Write pool initialized with 1 max connection (serialized writes)");

    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

/// Read and write pools for one database.
///
/// Both may point at the same pool (tests use a single in-memory connection).
#[derive(Clone)]
pub struct Pools {
    pub read: DbPool,
    pub write: WritePool,
}

impl Pools {
    /// Open both pools against `database_url` and apply migrations.
    pub async fn open(database_url: &str, read_pool_size: u32) -> Result<Self> {
        let write = init_write_pool(database_url).await?;
        run_migrations(&write).await?;
        let read = init_pool_with_size(database_url, read_pool_size).await?;
        Ok(Self { read, write })
    }

    /// Use one pool for both reads and writes.
    pub fn shared(pool: DbPool) -> Self {
        Self {
            read: pool.clone(),
            write: pool,
        }
    }
}

pub async fn begin_immediate(pool: &WritePool) -> Result<ImmediateTransaction> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(ImmediateTransaction::new(conn))
}

/// Wrapper for a manual immediate transaction.
///
/// The write lock is taken up front (BEGIN IMMEDIATE), so reads performed
/// inside the transaction cannot be invalidated by a concurrent writer.
pub struct ImmediateTransaction {
    conn: sqlx::pool::PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    pub fn new(conn: sqlx::pool::PoolConnection<Sqlite>) -> Self {
        Self {
            conn,
            finished: false,
        }
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    pub async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK").execute(&mut *self.conn).await?;
        self.finished = true;
        Ok(())
    }

    /// Commit on `Ok`, roll back on `Err`, and hand the result back.
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                Err(err)
            }
        }
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = sqlx::SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

/// Single-connection in-memory pool with the schema applied.
#[cfg(test)]
pub(crate) async fn test_pool() -> DbPool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}
