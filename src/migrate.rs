use sha2::{Digest, Sha256};
use sqlx::{Executor, Row, SqlitePool};
use std::collections::HashMap;

use crate::time::now_ms;
use crate::{AppError, AppResult};
use tracing::{error, info};

fn preview(sql: &str) -> String {
    let one_line = sql.replace(['\n', '\t'], " ");
    let trimmed = one_line.trim();
    match trimmed.char_indices().nth(160) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

static MIGRATIONS: &[(&str, &str)] = &[
    (
        "202601100900_offline_mutations.sql",
        include_str!("../migrations/202601100900_offline_mutations.sql"),
    ),
    (
        "202601100910_id_map.sql",
        include_str!("../migrations/202601100910_id_map.sql"),
    ),
    (
        "202601100920_pending_photos.sql",
        include_str!("../migrations/202601100920_pending_photos.sql"),
    ),
    (
        "202601100930_read_cache.sql",
        include_str!("../migrations/202601100930_read_cache.sql"),
    ),
];

fn strip_comments(raw_sql: &str) -> String {
    raw_sql
        .lines()
        .filter(|line| {
            let t = line.trim_start();
            !(t.is_empty() || t.starts_with("--"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn checksum(cleaned: &str) -> String {
    format!("{:x}", Sha256::digest(cleaned.as_bytes()))
}

/// Applies every embedded migration not yet recorded in `schema_migrations`.
/// Each file runs in its own transaction. A recorded file whose checksum no
/// longer matches is refused.
pub async fn apply_migrations(pool: &SqlitePool) -> AppResult<()> {
    pool.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (\
           version   TEXT PRIMARY KEY,\
           applied_at INTEGER NOT NULL,\
           checksum TEXT NOT NULL\
         )",
    )
    .await?;

    let rows = sqlx::query("SELECT version, checksum FROM schema_migrations")
        .fetch_all(pool)
        .await?;
    let mut applied: HashMap<String, String> = HashMap::new();
    for r in rows {
        let version: String = r.try_get("version")?;
        let sum: String = r.try_get("checksum")?;
        applied.insert(version, sum);
    }

    for (filename, raw_sql) in MIGRATIONS {
        let cleaned = strip_comments(raw_sql);
        let sum = checksum(&cleaned);

        if let Some(stored) = applied.get(*filename) {
            if stored != &sum {
                return Err(AppError::new(
                    "MIGRATION/CHECKSUM_MISMATCH",
                    "Migration edited after application",
                )
                .with_context("file", *filename));
            }
            info!(target: "fieldsync", event = "migration_skip_file", file = %filename);
            continue;
        }

        let mut tx = pool.begin().await?;
        for stmt in cleaned.split(';') {
            let s = stmt.trim();
            if s.is_empty() {
                continue;
            }
            info!(target: "fieldsync", event = "migration_stmt", file = %filename, sql = %preview(s));
            if let Err(e) = sqlx::query(s).execute(&mut *tx).await {
                error!(target: "fieldsync", event = "migration_stmt_error", file = %filename, sql = %preview(s), error = %e);
                return Err(AppError::from(e).with_context("file", *filename));
            }
        }

        sqlx::query(
            "INSERT INTO schema_migrations (version, applied_at, checksum) VALUES (?, ?, ?)",
        )
        .bind(*filename)
        .bind(now_ms())
        .bind(&sum)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(target: "fieldsync", event = "migration_file_applied", file = %filename);
    }

    Ok(())
}
