use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqlitePool};

use crate::{AppError, AppResult};

/// Opens (creating if needed) the queue database at `db_path`.
pub async fn open_sqlite_pool(db_path: &Path) -> AppResult<Pool<Sqlite>> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            tracing::error!(
                target: "fieldsync",
                error = %e,
                event = "data_dir_create_failed",
                path = %parent.display()
            );
            AppError::from(e).with_context("path", parent.display().to_string())
        })?;
    }
    tracing::info!(target: "fieldsync", event = "db_path", path = %db_path.display());

    let path_str = db_path.to_str().ok_or_else(|| {
        AppError::new("STORE/INVALID_PATH", "Database path is not valid UTF-8")
            .with_context("path", db_path.display().to_string())
    })?;
    let opts = SqliteConnectOptions::from_str(path_str)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA busy_timeout = 5000;")
                    .execute(&mut *conn)
                    .await?;
                sqlx::query("PRAGMA wal_autocheckpoint = 1000;")
                    .execute(&mut *conn)
                    .await?;
                Ok::<_, sqlx::Error>(())
            })
        })
        .connect_with(opts)
        .await?;

    log_effective_pragmas(&pool).await;

    Ok(pool)
}

/// Single-connection in-memory database. Every connection to `sqlite::memory:`
/// is a separate database, so the pool must never grow past one.
pub async fn open_memory_pool() -> AppResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

async fn log_effective_pragmas(pool: &Pool<Sqlite>) {
    use tracing::{info, warn};

    let (sqlite_ver,): (String,) = sqlx::query_as("select sqlite_version()")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let jm: (String,) = sqlx::query_as("PRAGMA journal_mode;")
        .fetch_one(pool)
        .await
        .unwrap_or((String::from("unknown"),));

    let sync: (i64,) = sqlx::query_as("PRAGMA synchronous;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    let busy: (i64,) = sqlx::query_as("PRAGMA busy_timeout;")
        .fetch_one(pool)
        .await
        .unwrap_or((i64::MIN,));

    info!(
        target: "fieldsync",
        event = "db_open",
        sqlite_version = %sqlite_ver,
        journal_mode = %jm.0,
        synchronous = %sync.0,
        busy_timeout_ms = %busy.0
    );

    if !jm.0.eq_ignore_ascii_case("wal") {
        warn!(
            target: "fieldsync",
            event = "db_open_warning",
            msg = "journal_mode != WAL; queued writes may not survive a crash"
        );
    }
}

/// Writes `bytes` to `path` through a temp file in the same directory, so
/// readers see either the old contents or the new ones.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    use std::io::Write;

    let dir = path.parent().ok_or_else(|| {
        AppError::new("IO/INVALID_PATH", "Path has no parent directory")
            .with_context("path", path.display().to_string())
    })?;
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        AppError::from(e.error).with_context("path", path.display().to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_pool_runs_in_wal_mode() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested").join("queue.sqlite3");
        let pool = open_sqlite_pool(&path).await?;
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode;")
            .fetch_one(&pool)
            .await?;
        assert!(mode.eq_ignore_ascii_case("wal"));
        assert!(path.exists());
        Ok(())
    }

    #[test]
    fn write_atomic_replaces_contents() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("session.json");
        write_atomic(&path, b"first")?;
        write_atomic(&path, b"second")?;
        assert_eq!(std::fs::read(&path)?, b"second");
        Ok(())
    }
}
