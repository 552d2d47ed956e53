//! SQLite store: connection pool, migrations, and the process-wide
//! single-writer discipline.
//!
//! All mutations acquire the store's write lock before touching the pool;
//! reads go straight to the pool. SQLite runs in WAL mode so readers are
//! never blocked by the writer.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::sync::{Mutex, MutexGuard};
use tracing::info;

/// Handle to the mission-control database.
#[derive(Debug)]
pub struct Store {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl Store {
    /// Open (creating if missing) a database file with WAL journaling and
    /// foreign keys enforced.
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open database at {}", path.display()))?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// Open an in-memory database.
    ///
    /// A single connection keeps the one memory database alive for the
    /// store's lifetime; WAL does not apply in memory.
    pub async fn open_in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("invalid in-memory connection string")?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("failed to open in-memory database")?;

        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
        })
    }

    /// The underlying connection pool. Reads may use it directly.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Acquire the process-wide write lock.
    ///
    /// Every mutating query holds this guard for the duration of its
    /// statement(s), which serializes all writers in the process while
    /// leaving readers untouched.
    pub async fn write(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    /// Run all pending migrations from the given directory.
    ///
    /// Uses a runtime `Migrator` so that no running database is required at
    /// compile time (unlike the `sqlx::migrate!()` macro).
    pub async fn migrate(&self, migrations_dir: &Path) -> Result<()> {
        let migrator = sqlx::migrate::Migrator::new(migrations_dir)
            .await
            .with_context(|| {
                format!(
                    "failed to load migrations from {}",
                    migrations_dir.display()
                )
            })?;

        migrator
            .run(&self.pool)
            .await
            .context("failed to run database migrations")?;

        info!("migrations applied successfully");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Return the default path to the migrations directory shipped with
/// `mc-db`.
///
/// At runtime this resolves relative to the `mc-db` crate's source tree via
/// the `CARGO_MANIFEST_DIR` compile-time env. For installed binaries (where
/// the source tree is absent) callers embed the migrations instead.
pub fn default_migrations_path() -> &'static Path {
    Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/migrations"))
}
