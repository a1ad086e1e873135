//! Durable mutation log.
//!
//! Every operation is a single statement or a single transaction, so a
//! record is never observed half-written. Rows are deleted on successful
//! replay; there is no terminal "synced" status.

use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::id::{is_local_id, new_local_id, new_uuid_v7};
use crate::mutation::{
    EntityKind, FailureKind, MutationAction, MutationStatus, OfflineMutation, SyncFailure,
};
use crate::time::now_ms;
use crate::{AppError, AppResult};

const SELECT_COLUMNS: &str = "SELECT id, entity_type, action, target_id, payload, created_at, \
     retry_count, status, last_error, failure_kind, next_attempt_at FROM offline_mutations";

fn write_failed(op: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |err| {
        AppError::new("STORE/WRITE_FAILED", "Failed to persist offline mutation")
            .with_context("operation", op)
            .with_cause(err)
    }
}

fn read_failed(op: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |err| {
        AppError::new("STORE/READ_FAILED", "Failed to read offline mutations")
            .with_context("operation", op)
            .with_cause(err)
    }
}

fn not_found(id: &str) -> AppError {
    AppError::new("STORE/NOT_FOUND", "Mutation not found").with_context("mutation_id", id)
}

fn row_to_mutation(row: &SqliteRow) -> AppResult<OfflineMutation> {
    let id: String = row.try_get("id")?;
    let payload_raw: String = row.try_get("payload")?;
    let payload: Value = serde_json::from_str(&payload_raw).map_err(|err| {
        AppError::new("STORE/CORRUPT_RECORD", "Stored payload is not valid JSON")
            .with_context("mutation_id", id.clone())
            .with_cause(err)
    })?;
    let retry_count: i64 = row.try_get("retry_count")?;
    let failure_kind: Option<String> = row.try_get("failure_kind")?;

    Ok(OfflineMutation {
        entity_type: row.try_get::<String, _>("entity_type")?.parse()?,
        action: row.try_get::<String, _>("action")?.parse()?,
        target_id: row.try_get("target_id")?,
        payload,
        created_at: row.try_get("created_at")?,
        retry_count: u32::try_from(retry_count).unwrap_or(u32::MAX),
        status: row.try_get::<String, _>("status")?.parse()?,
        last_error: row.try_get("last_error")?,
        failure_kind: failure_kind
            .as_deref()
            .map(str::parse::<FailureKind>)
            .transpose()?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        id,
    })
}

#[derive(Clone, Debug)]
pub struct MutationStore {
    pool: SqlitePool,
}

impl MutationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Persists a new pending mutation.
    ///
    /// A missing `target_id` gets a fresh local placeholder. A placeholder
    /// that has already been mapped to a server id is rewritten to that id.
    pub async fn enqueue(
        &self,
        kind: EntityKind,
        action: MutationAction,
        target_id: Option<&str>,
        payload: Value,
    ) -> AppResult<OfflineMutation> {
        self.enqueue_with_id(new_uuid_v7(), kind, action, target_id, payload)
            .await
    }

    /// Same as [`MutationStore::enqueue`] with a caller-chosen id, for writes
    /// that were already attempted online under that idempotency key.
    pub async fn enqueue_with_id(
        &self,
        id: String,
        kind: EntityKind,
        action: MutationAction,
        target_id: Option<&str>,
        payload: Value,
    ) -> AppResult<OfflineMutation> {
        let target_id = match target_id.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => self.resolve_target(kind, target).await?,
            None => new_local_id(),
        };
        let payload_json = serde_json::to_string(&payload)?;
        let mutation = OfflineMutation {
            id,
            entity_type: kind,
            action,
            target_id,
            payload,
            created_at: now_ms(),
            retry_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
            failure_kind: None,
            next_attempt_at: None,
        };

        sqlx::query(
            "INSERT INTO offline_mutations \
             (id, entity_type, action, target_id, payload, created_at, seq, retry_count, status) \
             VALUES (?, ?, ?, ?, ?, ?, \
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM offline_mutations), 0, 'pending')",
        )
        .bind(&mutation.id)
        .bind(kind.as_str())
        .bind(action.as_str())
        .bind(&mutation.target_id)
        .bind(&payload_json)
        .bind(mutation.created_at)
        .execute(&self.pool)
        .await
        .map_err(write_failed("enqueue"))?;

        tracing::info!(
            target: "fieldsync",
            event = "mutation_enqueued",
            mutation_id = %mutation.id,
            entity_type = %kind,
            action = %action,
            target_id = %mutation.target_id
        );
        Ok(mutation)
    }

    pub async fn get(&self, id: &str) -> AppResult<Option<OfflineMutation>> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(read_failed("get"))?;
        row.as_ref().map(row_to_mutation).transpose()
    }

    /// Pending and failed mutations in enqueue order. Records currently being
    /// replayed are excluded.
    pub async fn get_pending_mutations(&self) -> AppResult<Vec<OfflineMutation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'failed') ORDER BY created_at, seq"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed("get_pending_mutations"))?;
        rows.iter().map(row_to_mutation).collect()
    }

    /// Every queued record in enqueue order, including ones still marked
    /// `syncing`. Replay uses this so an unconfirmed record keeps blocking the
    /// records queued after it for the same entity.
    pub async fn queued_in_order(&self) -> AppResult<Vec<OfflineMutation>> {
        let rows = sqlx::query(&format!("{SELECT_COLUMNS} ORDER BY created_at, seq"))
            .fetch_all(&self.pool)
            .await
            .map_err(read_failed("queued_in_order"))?;
        rows.iter().map(row_to_mutation).collect()
    }

    pub async fn get_pending_mutations_by_type(
        &self,
        kind: EntityKind,
    ) -> AppResult<Vec<OfflineMutation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'failed') AND entity_type = ? \
             ORDER BY created_at, seq"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed("get_pending_mutations_by_type"))?;
        rows.iter().map(row_to_mutation).collect()
    }

    /// Whether anything is queued for `(kind, target_id)`, including a record
    /// a pass is replaying right now.
    pub async fn has_queued_for_target(&self, kind: EntityKind, target_id: &str) -> AppResult<bool> {
        let queued: Option<i64> = sqlx::query_scalar(
            "SELECT 1 FROM offline_mutations WHERE entity_type = ? AND target_id = ? LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(target_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed("has_queued_for_target"))?;
        Ok(queued.is_some())
    }

    pub async fn failed_mutations(&self) -> AppResult<Vec<OfflineMutation>> {
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status = 'failed' ORDER BY created_at, seq"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(read_failed("failed_mutations"))?;
        rows.iter().map(row_to_mutation).collect()
    }

    /// Every record not yet applied remotely, whatever its status.
    pub async fn pending_count(&self) -> AppResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offline_mutations")
            .fetch_one(&self.pool)
            .await
            .map_err(read_failed("pending_count"))?;
        Ok(count.max(0) as u64)
    }

    pub async fn mark_syncing(&self, id: &str) -> AppResult<()> {
        let res = sqlx::query(
            "UPDATE offline_mutations SET status = 'syncing' \
             WHERE id = ? AND status IN ('pending', 'failed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(write_failed("mark_syncing"))?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "mark_syncing").await);
        }
        Ok(())
    }

    /// Removes a mutation after the server applied it. Returns `false` when
    /// the record was already gone, e.g. dismissed while in flight.
    pub async fn mark_synced(&self, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM offline_mutations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(write_failed("mark_synced"))?;
        Ok(res.rows_affected() > 0)
    }

    /// Records a failed attempt. This is the only place `retry_count` grows.
    pub async fn mark_failed(&self, id: &str, failure: &SyncFailure) -> AppResult<()> {
        let res = sqlx::query(
            "UPDATE offline_mutations \
             SET status = 'failed', retry_count = retry_count + 1, last_error = ?, \
                 failure_kind = ?, next_attempt_at = ? \
             WHERE id = ? AND status = 'syncing'",
        )
        .bind(&failure.message)
        .bind(failure.kind.as_str())
        .bind(failure.next_attempt_at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(write_failed("mark_failed"))?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "mark_failed").await);
        }
        tracing::warn!(
            target: "fieldsync",
            event = "mutation_failed",
            mutation_id = %id,
            failure_kind = failure.kind.as_str(),
            error = %failure.message
        );
        Ok(())
    }

    /// `failed → pending`. Keeps `retry_count`; clears the failure details.
    /// A record that is already pending is returned unchanged.
    pub async fn reset_for_retry(&self, id: &str) -> AppResult<OfflineMutation> {
        let res = sqlx::query(
            "UPDATE offline_mutations \
             SET status = 'pending', last_error = NULL, failure_kind = NULL, next_attempt_at = NULL \
             WHERE id = ? AND status IN ('failed', 'pending')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(write_failed("reset_for_retry"))?;
        if res.rows_affected() == 0 {
            return Err(self.transition_error(id, "reset_for_retry").await);
        }
        self.get(id).await?.ok_or_else(|| not_found(id))
    }

    /// `syncing → pending` without counting an attempt.
    pub async fn release(&self, id: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE offline_mutations SET status = 'pending' WHERE id = ? AND status = 'syncing'",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(write_failed("release"))?;
        Ok(())
    }

    /// User dismissal. Deletes the record whatever its status.
    pub async fn remove(&self, id: &str) -> AppResult<bool> {
        let res = sqlx::query("DELETE FROM offline_mutations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(write_failed("remove"))?;
        let removed = res.rows_affected() > 0;
        if removed {
            tracing::info!(target: "fieldsync", event = "mutation_dismissed", mutation_id = %id);
        }
        Ok(removed)
    }

    /// Returns records stranded in `syncing` by an interrupted pass to
    /// `pending`. Called once when the store is opened.
    pub async fn recover_interrupted(&self) -> AppResult<u64> {
        let res = sqlx::query(
            "UPDATE offline_mutations SET status = 'pending' WHERE status = 'syncing'",
        )
        .execute(&self.pool)
        .await
        .map_err(write_failed("recover_interrupted"))?;
        let recovered = res.rows_affected();
        if recovered > 0 {
            tracing::warn!(
                target: "fieldsync",
                event = "mutations_recovered",
                count = recovered
            );
        }
        Ok(recovered)
    }

    /// Finishes a create whose target was a local placeholder: records the
    /// server id, points later mutations (and photos of a created job) at it,
    /// and deletes the create. Returns how many mutations were relinked.
    pub async fn complete_create(
        &self,
        mutation_id: &str,
        kind: EntityKind,
        local_id: &str,
        remote_id: &str,
    ) -> AppResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(write_failed("complete_create"))?;

        sqlx::query(
            "INSERT OR REPLACE INTO id_map (entity_type, local_id, remote_id, created_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(kind.as_str())
        .bind(local_id)
        .bind(remote_id)
        .bind(now_ms())
        .execute(&mut *tx)
        .await
        .map_err(write_failed("complete_create"))?;

        let relinked = sqlx::query(
            "UPDATE offline_mutations SET target_id = ? \
             WHERE entity_type = ? AND target_id = ? AND id != ?",
        )
        .bind(remote_id)
        .bind(kind.as_str())
        .bind(local_id)
        .bind(mutation_id)
        .execute(&mut *tx)
        .await
        .map_err(write_failed("complete_create"))?
        .rows_affected();

        if kind == EntityKind::Job {
            sqlx::query("UPDATE pending_photos SET job_id = ? WHERE job_id = ?")
                .bind(remote_id)
                .bind(local_id)
                .execute(&mut *tx)
                .await
                .map_err(write_failed("complete_create"))?;
        }

        sqlx::query("DELETE FROM offline_mutations WHERE id = ?")
            .bind(mutation_id)
            .execute(&mut *tx)
            .await
            .map_err(write_failed("complete_create"))?;

        tx.commit().await.map_err(write_failed("complete_create"))?;

        tracing::info!(
            target: "fieldsync",
            event = "local_id_remapped",
            entity_type = %kind,
            local_id = %local_id,
            remote_id = %remote_id,
            relinked
        );
        Ok(relinked)
    }

    /// Maps a local placeholder to its server id when one is known.
    /// Anything else is returned as is.
    pub async fn resolve_target(&self, kind: EntityKind, target: &str) -> AppResult<String> {
        if !is_local_id(target) {
            return Ok(target.to_string());
        }
        let remote: Option<String> = sqlx::query_scalar(
            "SELECT remote_id FROM id_map WHERE entity_type = ? AND local_id = ?",
        )
        .bind(kind.as_str())
        .bind(target)
        .fetch_optional(&self.pool)
        .await
        .map_err(read_failed("resolve_target"))?;
        Ok(remote.unwrap_or_else(|| target.to_string()))
    }

    async fn transition_error(&self, id: &str, op: &'static str) -> AppError {
        match self.get(id).await {
            Ok(Some(current)) => AppError::new(
                "STORE/INVALID_TRANSITION",
                "Mutation is not in a state that allows this operation",
            )
            .with_context("mutation_id", id)
            .with_context("operation", op)
            .with_context("status", current.status.as_str()),
            Ok(None) => not_found(id).with_context("operation", op),
            Err(err) => err,
        }
    }
}
