//! Job photos captured offline.
//!
//! Bytes are spooled to the photos directory and a row in `pending_photos`
//! tracks each upload. Photos are synced after mutations in the same pass
//! but with their own retry policy and counts.

use std::path::{Path, PathBuf};

use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::api::PhotoUpload;
use crate::backoff::RetryPolicy;
use crate::db::write_atomic;
use crate::id::{is_local_id, new_uuid_v7};
use crate::mutation::{EntityKind, FailureKind, MutationStatus, SyncFailure};
use crate::time::now_ms;
use crate::{AppError, AppResult};

const SELECT_COLUMNS: &str = "SELECT id, job_id, file_name, spool_path, mime, byte_len, \
     content_hash, created_at, retry_count, status, last_error, failure_kind, next_attempt_at \
     FROM pending_photos";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPhoto {
    pub id: String,
    pub job_id: String,
    pub file_name: String,
    pub spool_path: PathBuf,
    pub mime: String,
    pub byte_len: u64,
    pub content_hash: String,
    pub created_at: i64,
    pub retry_count: u32,
    pub status: MutationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<i64>,
}

impl PendingPhoto {
    /// The job has not been created on the server yet.
    pub fn awaits_job(&self) -> bool {
        is_local_id(&self.job_id)
    }
}

fn row_to_photo(row: &SqliteRow) -> AppResult<PendingPhoto> {
    let failure_kind: Option<String> = row.try_get("failure_kind")?;
    let byte_len: i64 = row.try_get("byte_len")?;
    let retry_count: i64 = row.try_get("retry_count")?;
    Ok(PendingPhoto {
        id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        file_name: row.try_get("file_name")?,
        spool_path: PathBuf::from(row.try_get::<String, _>("spool_path")?),
        mime: row.try_get("mime")?,
        byte_len: byte_len.max(0) as u64,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        status: row.try_get::<String, _>("status")?.parse()?,
        last_error: row.try_get("last_error")?,
        failure_kind: failure_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()?,
        next_attempt_at: row.try_get("next_attempt_at")?,
    })
}

fn photos_err(code: &'static str, message: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |err| AppError::new(code, message).with_cause(err)
}

fn detect_mime(file_name: &str, bytes: &[u8]) -> (String, String) {
    if let Some(kind) = infer::get(bytes) {
        return (kind.mime_type().to_string(), kind.extension().to_string());
    }
    let mime = mime_guess::from_path(file_name).first_or_octet_stream();
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "bin".to_string());
    (mime.essence_str().to_string(), ext)
}

fn remove_spool_file(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(
                target: "fieldsync",
                event = "photo_spool_remove_failed",
                path = %path.display(),
                error = %err
            );
        }
    }
}

#[derive(Clone, Debug)]
pub struct PhotoQueue {
    pool: SqlitePool,
    spool_dir: PathBuf,
    policy: RetryPolicy,
}

impl PhotoQueue {
    pub fn new(pool: SqlitePool, spool_dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            spool_dir: spool_dir.into(),
            policy,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn spool_dir(&self) -> &Path {
        &self.spool_dir
    }

    /// Spools a photo for `job_id`. The same bytes queued twice for one job
    /// return the existing record.
    pub async fn enqueue(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> AppResult<PendingPhoto> {
        if bytes.is_empty() {
            return Err(AppError::new("PHOTOS/EMPTY", "Photo has no content")
                .with_context("file_name", file_name));
        }
        let job_id = self.resolve_job(job_id).await?;
        let content_hash = format!("{:x}", Sha256::digest(bytes));

        let existing = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE job_id = ? AND content_hash = ? LIMIT 1"
        ))
        .bind(&job_id)
        .bind(&content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/READ_FAILED", "Failed to read pending photos"))?;
        if let Some(row) = existing {
            let photo = row_to_photo(&row)?;
            tracing::info!(
                target: "fieldsync",
                event = "photo_duplicate",
                photo_id = %photo.id,
                job_id = %job_id
            );
            return Ok(photo);
        }

        let (mime, ext) = detect_mime(file_name, bytes);
        let id = new_uuid_v7();
        let spool_path = self.spool_dir.join(format!("{id}.{ext}"));
        write_atomic(&spool_path, bytes).map_err(|err| {
            AppError::new("PHOTOS/SPOOL_FAILED", "Failed to write photo to disk")
                .with_context("path", spool_path.display().to_string())
                .with_cause(err)
        })?;

        let photo = PendingPhoto {
            id,
            job_id,
            file_name: file_name.to_string(),
            spool_path,
            mime,
            byte_len: bytes.len() as u64,
            content_hash,
            created_at: now_ms(),
            retry_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
            failure_kind: None,
            next_attempt_at: None,
        };

        let inserted = sqlx::query(
            "INSERT INTO pending_photos \
             (id, job_id, file_name, spool_path, mime, byte_len, content_hash, created_at, retry_count, status) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, 'pending')",
        )
        .bind(&photo.id)
        .bind(&photo.job_id)
        .bind(&photo.file_name)
        .bind(photo.spool_path.to_string_lossy().into_owned())
        .bind(&photo.mime)
        .bind(photo.byte_len as i64)
        .bind(&photo.content_hash)
        .bind(photo.created_at)
        .execute(&self.pool)
        .await;
        if let Err(err) = inserted {
            remove_spool_file(&photo.spool_path);
            return Err(AppError::new("PHOTOS/WRITE_FAILED", "Failed to queue photo").with_cause(err));
        }

        tracing::info!(
            target: "fieldsync",
            event = "photo_enqueued",
            photo_id = %photo.id,
            job_id = %photo.job_id,
            mime = %photo.mime,
            bytes = photo.byte_len
        );
        Ok(photo)
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<PendingPhoto>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(photos_err("PHOTOS/READ_FAILED", "Failed to read pending photos"))?;
        row.as_ref().map(row_to_photo).transpose()
    }

    /// Pending and failed photos in capture order.
    pub async fn pending(&self) -> AppResult<Vec<PendingPhoto>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'failed') ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/READ_FAILED", "Failed to read pending photos"))?;
        rows.iter().map(row_to_photo).collect()
    }

    pub async fn count(&self) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_photos")
            .fetch_one(&self.pool)
            .await
            .map_err(photos_err("PHOTOS/READ_FAILED", "Failed to count pending photos"))?;
        Ok(count.max(0) as u64)
    }

    pub fn read_upload(&self, photo: &PendingPhoto) -> AppResult<PhotoUpload> {
        let bytes = std::fs::read(&photo.spool_path).map_err(|err| {
            AppError::new("PHOTOS/SPOOL_MISSING", "Spooled photo could not be read")
                .with_context("photo_id", photo.id.clone())
                .with_context("path", photo.spool_path.display().to_string())
                .with_cause(err)
        })?;
        Ok(PhotoUpload {
            file_name: photo.file_name.clone(),
            mime: photo.mime.clone(),
            bytes,
        })
    }

    pub async fn mark_uploading(&self, id: &str) -> AppResult<bool> {
        let res = sqlx::query(
            "UPDATE pending_photos SET status = 'syncing' \
             WHERE id = ? AND status IN ('pending', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to update photo"))?;
        Ok(res.rows_affected() > 0)
    }

    /// Deletes the row and the spooled file.
    pub async fn mark_uploaded(&self, id: &str) -> AppResult<()> {
        self.delete(id).await.map(|_| ())
    }

    pub async fn mark_failed(&self, id: &str, failure: &SyncFailure) -> AppResult<()> {
        sqlx::query(
            "UPDATE pending_photos \
             SET status = 'failed', retry_count = retry_count + 1, last_error = ?, \
                 failure_kind = ?, next_attempt_at = ? \
             WHERE id = ?",
        )
        .bind(&failure.message)
        .bind(failure.kind.as_str())
        .bind(failure.next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to update photo"))?;
        tracing::warn!(
            target: "fieldsync",
            event = "photo_failed",
            photo_id = %id,
            failure_kind = failure.kind.as_str(),
            error = %failure.message
        );
        Ok(())
    }

    pub async fn release(&self, id: &str) -> AppResult<()> {
        sqlx::query("UPDATE pending_photos SET status = 'pending' WHERE id = ? AND status = 'syncing'")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to update photo"))?;
        Ok(())
    }

    pub async fn reset_for_retry(&self, id: &str) -> AppResult<bool> {
        let res = sqlx::query(
            "UPDATE pending_photos \
             SET status = 'pending', last_error = NULL, failure_kind = NULL, next_attempt_at = NULL \
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to update photo"))?;
        Ok(res.rows_affected() > 0)
    }

    /// User dismissal.
    pub async fn remove(&self, id: &str) -> AppResult<bool> {
        self.delete(id).await
    }

    pub async fn recover_interrupted(&self) -> AppResult<u64> {
        let res = sqlx::query("UPDATE pending_photos SET status = 'pending' WHERE status = 'syncing'")
            .execute(&self.pool)
            .await
            .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to update photos"))?;
        Ok(res.rows_affected())
    }

    async fn delete(&self, id: &str) -> AppResult<bool> {
        let Some(photo) = self.get(id).await? else {
            return Ok(false);
        };
        sqlx::query("DELETE FROM pending_photos WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(photos_err("PHOTOS/WRITE_FAILED", "Failed to delete photo"))?;
        remove_spool_file(&photo.spool_path);
        Ok(true)
    }

    async fn resolve_job(&self, job_id: &str) -> AppResult<String> {
        let job_id = job_id.trim();
        if job_id.is_empty() {
            return Err(AppError::new("PHOTOS/MISSING_JOB", "Photo must belong to a job"));
        }
        if !is_local_id(job_id) {
            return Ok(job_id.to_string());
        }
        let remote: Option<String> = sqlx::query_scalar(
            "SELECT remote_id FROM id_map WHERE entity_type = ? AND local_id = ?",
        )
        .bind(EntityKind::Job.as_str())
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(photos_err("PHOTOS/READ_FAILED", "Failed to resolve job id"))?;
        Ok(remote.unwrap_or_else(|| job_id.to_string()))
    }
}
