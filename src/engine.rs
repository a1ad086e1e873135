//! Replays queued mutations and photos against the remote API.
//!
//! Mutations are grouped by `(entity_type, target_id)`. Groups are visited in
//! the order of their oldest record; inside a group records are replayed
//! strictly in enqueue order and the first one that fails, or is not yet due
//! for a retry, blocks the rest of its group for this pass. Unrelated groups
//! are unaffected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::api::{remote_id_of, ApiError, ErrorClass, RemoteApi};
use crate::backoff::RetryPolicy;
use crate::connectivity::ConnectivityMonitor;
use crate::id::is_local_id;
use crate::mutation::{
    EntityKind, FullSyncReport, HaltReason, MutationAction, OfflineMutation, SkipReason,
    SyncFailure, SyncResult,
};
use crate::photos::PhotoQueue;
use crate::store::MutationStore;
use crate::time::now_ms;

enum Outcome {
    Synced,
    Failed,
    /// Record vanished (dismissed mid-pass); the group may continue.
    Gone,
    /// Store trouble; stop this group without counting a failure.
    Blocked,
    Halted(HaltReason),
}

#[derive(Clone)]
pub struct SyncEngine {
    store: MutationStore,
    photos: PhotoQueue,
    api: Arc<dyn RemoteApi>,
    monitor: ConnectivityMonitor,
    policy: RetryPolicy,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    pub fn new(
        store: MutationStore,
        photos: PhotoQueue,
        api: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            photos,
            api,
            monitor,
            policy,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn store(&self) -> &MutationStore {
        &self.store
    }

    pub fn photos(&self) -> &PhotoQueue {
        &self.photos
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn api(&self) -> &Arc<dyn RemoteApi> {
        &self.api
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Stops the current pass after the item in flight and skips later ones.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn interruption(&self) -> Option<HaltReason> {
        if self.is_cancelled() {
            Some(HaltReason::Cancelled)
        } else if !self.monitor.is_online() {
            Some(HaltReason::WentOffline)
        } else {
            None
        }
    }

    /// One full pass: mutations first, then photos. Never fails; per-item
    /// problems end up in the store and in the returned counts.
    pub async fn perform_full_sync(&self) -> FullSyncReport {
        if self.is_cancelled() {
            return FullSyncReport {
                halted: Some(HaltReason::Cancelled),
                ..FullSyncReport::default()
            };
        }
        if !self.monitor.is_online() {
            tracing::info!(target: "fieldsync", event = "sync_pass_skipped", reason = "offline");
            return FullSyncReport::skipped(SkipReason::Offline);
        }
        if !self.api.has_session().await {
            tracing::info!(target: "fieldsync", event = "sync_pass_skipped", reason = "no_session");
            return FullSyncReport::skipped(SkipReason::NoSession);
        }

        let started = Instant::now();
        tracing::info!(target: "fieldsync", event = "sync_pass_start");

        let mut report = FullSyncReport::default();
        let pending = match self.store.queued_in_order().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(target: "fieldsync", event = "sync_pass_skipped", reason = "store_unavailable", error = %err);
                return FullSyncReport::skipped(SkipReason::StoreUnavailable);
            }
        };

        let (mutations, halted) = self.sync_mutations(pending).await;
        report.mutations = mutations;
        report.halted = halted;

        if report.halted.is_none() {
            let (photos, halted) = self.sync_photos().await;
            report.photos = photos;
            report.halted = halted;
        }

        if let Some(reason) = report.halted {
            tracing::warn!(
                target: "fieldsync",
                event = "sync_pass_halted",
                reason = ?reason,
                synced = report.mutations.synced,
                failed = report.mutations.failed
            );
        }
        tracing::info!(
            target: "fieldsync",
            event = "sync_pass_complete",
            mutations_synced = report.mutations.synced,
            mutations_failed = report.mutations.failed,
            photos_synced = report.photos.synced,
            photos_failed = report.photos.failed,
            duration_ms = started.elapsed().as_millis() as u64
        );
        report
    }

    async fn sync_mutations(
        &self,
        pending: Vec<OfflineMutation>,
    ) -> (SyncResult, Option<HaltReason>) {
        let now = now_ms();
        let mut result = SyncResult::default();

        for group in group_in_order(pending) {
            for mutation in group {
                if let Some(reason) = self.interruption() {
                    return (result, Some(reason));
                }
                // Covers records left `syncing` by an interrupted pass too.
                if !self.policy.is_eligible(&mutation, now) {
                    break;
                }
                match self.replay(&mutation).await {
                    Outcome::Synced => result.synced += 1,
                    Outcome::Gone => continue,
                    Outcome::Failed => {
                        result.failed += 1;
                        break;
                    }
                    Outcome::Blocked => break,
                    Outcome::Halted(reason) => return (result, Some(reason)),
                }
            }
        }
        (result, None)
    }

    async fn replay(&self, mutation: &OfflineMutation) -> Outcome {
        if let Err(err) = self.store.mark_syncing(&mutation.id).await {
            if err.code() == "STORE/NOT_FOUND" {
                return Outcome::Gone;
            }
            tracing::error!(target: "fieldsync", event = "mutation_mark_syncing_failed", mutation_id = %mutation.id, error = %err);
            return Outcome::Blocked;
        }

        let kind = mutation.entity_type;
        let target = match self.store.resolve_target(kind, &mutation.target_id).await {
            Ok(target) => target,
            Err(err) => {
                tracing::error!(target: "fieldsync", event = "mutation_resolve_failed", mutation_id = %mutation.id, error = %err);
                self.release(&mutation.id).await;
                return Outcome::Blocked;
            }
        };

        let response = match self.call(mutation, &target).await {
            Ok(response) => response,
            Err(err) => return self.record_failure(mutation, err).await,
        };

        if mutation.action == MutationAction::Create && is_local_id(&target) {
            let Some(remote_id) = remote_id_of(&response) else {
                return self
                    .record_failure(
                        mutation,
                        ApiError::Decode("create response did not include an id".into()),
                    )
                    .await;
            };
            if let Err(err) = self
                .store
                .complete_create(&mutation.id, kind, &target, &remote_id)
                .await
            {
                tracing::error!(target: "fieldsync", event = "mutation_remap_failed", mutation_id = %mutation.id, error = %err);
                // Server has it; a replay reuses the idempotency key.
                self.release(&mutation.id).await;
                return Outcome::Blocked;
            }
        } else if let Err(err) = self.store.mark_synced(&mutation.id).await {
            tracing::error!(target: "fieldsync", event = "mutation_mark_synced_failed", mutation_id = %mutation.id, error = %err);
            self.release(&mutation.id).await;
            return Outcome::Blocked;
        }

        tracing::info!(
            target: "fieldsync",
            event = "mutation_synced",
            mutation_id = %mutation.id,
            entity_type = %kind,
            action = %mutation.action
        );
        Outcome::Synced
    }

    async fn call(&self, mutation: &OfflineMutation, target: &str) -> Result<Value, ApiError> {
        let kind = mutation.entity_type;
        let key = mutation.id.as_str();
        match mutation.action {
            MutationAction::Create => self.api.create(kind, &mutation.payload, key).await,
            _ if is_local_id(target) => Err(unresolved_target(kind, target)),
            MutationAction::Update => {
                self.api
                    .update(kind, target, &mutation.payload, key)
                    .await
            }
            MutationAction::Delete => self
                .api
                .delete(kind, target, key)
                .await
                .map(|()| Value::Null),
        }
    }

    async fn record_failure(&self, mutation: &OfflineMutation, err: ApiError) -> Outcome {
        let failure = match err.classify() {
            ErrorClass::Unauthenticated => {
                self.release(&mutation.id).await;
                return Outcome::Halted(HaltReason::Unauthenticated);
            }
            ErrorClass::Transient => {
                let attempts = mutation.retry_count.saturating_add(1);
                if self.policy.exhausted(attempts) {
                    tracing::warn!(
                        target: "fieldsync",
                        event = "mutation_retries_exhausted",
                        mutation_id = %mutation.id,
                        retry_count = attempts
                    );
                }
                SyncFailure::transient(err.to_string(), self.policy.next_attempt_at(now_ms(), attempts))
            }
            ErrorClass::Permanent => SyncFailure::permanent(err.to_string()),
        };
        match self.store.mark_failed(&mutation.id, &failure).await {
            Ok(()) => Outcome::Failed,
            Err(store_err) if store_err.code() == "STORE/NOT_FOUND" => Outcome::Gone,
            Err(store_err) => {
                tracing::error!(target: "fieldsync", event = "mutation_mark_failed_failed", mutation_id = %mutation.id, error = %store_err);
                Outcome::Blocked
            }
        }
    }

    async fn release(&self, id: &str) {
        if let Err(err) = self.store.release(id).await {
            tracing::error!(target: "fieldsync", event = "mutation_release_failed", mutation_id = %id, error = %err);
        }
    }

    async fn sync_photos(&self) -> (SyncResult, Option<HaltReason>) {
        let mut result = SyncResult::default();
        let pending = match self.photos.pending().await {
            Ok(pending) => pending,
            Err(err) => {
                tracing::error!(target: "fieldsync", event = "photo_pass_skipped", error = %err);
                return (result, None);
            }
        };
        let policy = *self.photos.policy();
        let now = now_ms();

        for photo in pending {
            if let Some(reason) = self.interruption() {
                return (result, Some(reason));
            }
            if photo.awaits_job()
                || !policy.allows(
                    photo.status,
                    photo.failure_kind,
                    photo.retry_count,
                    photo.next_attempt_at,
                    now,
                )
            {
                continue;
            }
            match self.photos.mark_uploading(&photo.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    tracing::error!(target: "fieldsync", event = "photo_mark_uploading_failed", photo_id = %photo.id, error = %err);
                    continue;
                }
            }

            let upload = match self.photos.read_upload(&photo) {
                Ok(upload) => upload,
                Err(err) => {
                    let failure = SyncFailure::permanent(err.message().to_string());
                    if let Err(store_err) = self.photos.mark_failed(&photo.id, &failure).await {
                        tracing::error!(target: "fieldsync", event = "photo_mark_failed_failed", photo_id = %photo.id, error = %store_err);
                    }
                    result.failed += 1;
                    continue;
                }
            };

            let outcome = self
                .api
                .upload_photo(&photo.job_id, &upload, &photo.id)
                .await;
            let recorded = match outcome {
                Ok(()) => {
                    tracing::info!(target: "fieldsync", event = "photo_synced", photo_id = %photo.id, job_id = %photo.job_id);
                    result.synced += 1;
                    match self.photos.mark_uploaded(&photo.id).await {
                        Ok(()) => Ok(()),
                        Err(err) => {
                            tracing::error!(target: "fieldsync", event = "photo_mark_uploaded_failed", photo_id = %photo.id, error = %err);
                            // Next pass re-sends under the same idempotency key.
                            self.photos.release(&photo.id).await
                        }
                    }
                }
                Err(err) => match err.classify() {
                    ErrorClass::Unauthenticated => {
                        if let Err(store_err) = self.photos.release(&photo.id).await {
                            tracing::error!(target: "fieldsync", event = "photo_release_failed", photo_id = %photo.id, error = %store_err);
                        }
                        return (result, Some(HaltReason::Unauthenticated));
                    }
                    ErrorClass::Transient => {
                        result.failed += 1;
                        let attempts = photo.retry_count.saturating_add(1);
                        let failure = SyncFailure::transient(
                            err.to_string(),
                            policy.next_attempt_at(now_ms(), attempts),
                        );
                        self.photos.mark_failed(&photo.id, &failure).await
                    }
                    ErrorClass::Permanent => {
                        result.failed += 1;
                        self.photos
                            .mark_failed(&photo.id, &SyncFailure::permanent(err.to_string()))
                            .await
                    }
                },
            };
            if let Err(err) = recorded {
                tracing::error!(target: "fieldsync", event = "photo_record_failed", photo_id = %photo.id, error = %err);
            }
        }
        (result, None)
    }
}

fn unresolved_target(kind: EntityKind, target: &str) -> ApiError {
    ApiError::status(
        422,
        format!("{kind} {target} was never created on the server"),
    )
}

/// Splits an ordered list into per-entity groups, keeping each group in
/// enqueue order and ordering groups by their oldest record.
fn group_in_order(pending: Vec<OfflineMutation>) -> Vec<Vec<OfflineMutation>> {
    let mut index: HashMap<(EntityKind, String), usize> = HashMap::new();
    let mut groups: Vec<Vec<OfflineMutation>> = Vec::new();
    for mutation in pending {
        let slot = *index.entry(mutation.group_key()).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[slot].push(mutation);
    }
    groups
}
