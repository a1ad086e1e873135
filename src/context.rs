//! Service object the host application holds for the lifetime of a session.
//!
//! It owns the sync exclusion flag and publishes an [`OfflineSnapshot`] read
//! model through a watch channel; the store stays the source of truth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::watch;
use ts_rs::TS;

use crate::api::{ErrorClass, RemoteApi};
use crate::cache::ReadCache;
use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::db::open_sqlite_pool;
use crate::engine::SyncEngine;
use crate::id::{is_local_id, new_uuid_v7};
use crate::migrate::apply_migrations;
use crate::mutation::{
    EntityKind, FullSyncReport, MutationAction, OfflineMutation, SyncResult,
};
use crate::photos::{PendingPhoto, PhotoQueue};
use crate::store::MutationStore;
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct OfflineSnapshot {
    pub online: bool,
    #[ts(type = "number")]
    pub pending_count: u64,
    #[ts(type = "number")]
    pub pending_photos: u64,
    pub is_syncing: bool,
    pub last_sync_result: Option<SyncResult>,
    pub failed_mutations: Vec<OfflineMutation>,
}

/// Held while a pass runs; a second acquire fails until it is dropped.
pub struct SyncGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> SyncGuard<'a> {
    pub fn try_begin(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for SyncGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Result of [`OfflineContext::submit`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The server applied the write; carries its response body.
    Applied(Value),
    /// The write was queued for a later pass.
    Queued(OfflineMutation),
}

struct Inner {
    engine: SyncEngine,
    cache: ReadCache,
    syncing: AtomicBool,
    last_report: Mutex<Option<FullSyncReport>>,
    snapshot: Arc<watch::Sender<OfflineSnapshot>>,
    connectivity: Mutex<Option<Subscription>>,
}

#[derive(Clone)]
pub struct OfflineContext {
    inner: Arc<Inner>,
}

impl OfflineContext {
    /// Opens the database under the configured data dir and wires every part.
    pub async fn open(
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
    ) -> AppResult<Self> {
        let pool = open_sqlite_pool(&config.db_path()).await?;
        Self::open_with_pool(pool, config, api, monitor).await
    }

    pub async fn open_with_pool(
        pool: SqlitePool,
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        monitor: ConnectivityMonitor,
    ) -> AppResult<Self> {
        apply_migrations(&pool).await?;
        let store = MutationStore::new(pool.clone());
        let photos = PhotoQueue::new(pool.clone(), config.photos_dir(), config.photo_policy());
        store.recover_interrupted().await?;
        photos.recover_interrupted().await?;

        let engine = SyncEngine::new(store, photos, api, monitor, config.mutation_policy());
        let ctx = Self::new(engine, ReadCache::new(pool));
        ctx.refresh().await?;
        Ok(ctx)
    }

    /// Wraps already constructed parts. The caller is responsible for
    /// migrations.
    pub fn new(engine: SyncEngine, cache: ReadCache) -> Self {
        let initial = OfflineSnapshot {
            online: engine.monitor().is_online(),
            ..OfflineSnapshot::default()
        };
        let (tx, _rx) = watch::channel(initial);
        let snapshot = Arc::new(tx);

        let publisher = Arc::clone(&snapshot);
        let subscription = engine.monitor().on_online_status_change(move |online| {
            publisher.send_modify(|snap| snap.online = online);
        });

        Self {
            inner: Arc::new(Inner {
                engine,
                cache,
                syncing: AtomicBool::new(false),
                last_report: Mutex::new(None),
                snapshot,
                connectivity: Mutex::new(Some(subscription)),
            }),
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub fn store(&self) -> &MutationStore {
        self.inner.engine.store()
    }

    pub fn photos(&self) -> &PhotoQueue {
        self.inner.engine.photos()
    }

    pub fn cache(&self) -> &ReadCache {
        &self.inner.cache
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        self.inner.engine.monitor()
    }

    pub fn is_online(&self) -> bool {
        self.monitor().is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.syncing.load(Ordering::SeqCst)
    }

    pub async fn enqueue(
        &self,
        kind: EntityKind,
        action: MutationAction,
        target_id: Option<&str>,
        payload: Value,
    ) -> AppResult<OfflineMutation> {
        let mutation = self.store().enqueue(kind, action, target_id, payload).await?;
        self.refresh_quietly().await;
        Ok(mutation)
    }

    /// Write-through: sends the write now when that cannot overtake queued
    /// work for the same entity, and queues it otherwise or when the attempt
    /// fails transiently. Rejections and auth failures go back to the caller.
    pub async fn submit(
        &self,
        kind: EntityKind,
        action: MutationAction,
        target_id: Option<&str>,
        payload: Value,
    ) -> AppResult<SubmitOutcome> {
        let target = match target_id.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Some(self.store().resolve_target(kind, t).await?),
            None => None,
        };
        if !self.can_send_now(kind, action, target.as_deref()).await? {
            let queued = self.enqueue(kind, action, target.as_deref(), payload).await?;
            return Ok(SubmitOutcome::Queued(queued));
        }

        let key = new_uuid_v7();
        let api = self.inner.engine.api();
        let attempt = match (action, target.as_deref()) {
            (MutationAction::Create, _) => api.create(kind, &payload, &key).await,
            (MutationAction::Update, Some(id)) => api.update(kind, id, &payload, &key).await,
            (MutationAction::Delete, Some(id)) => {
                api.delete(kind, id, &key).await.map(|()| Value::Null)
            }
            (_, None) => {
                let queued = self.enqueue(kind, action, None, payload).await?;
                return Ok(SubmitOutcome::Queued(queued));
            }
        };

        match attempt {
            Ok(body) => Ok(SubmitOutcome::Applied(body)),
            Err(err) if err.classify() == ErrorClass::Transient => {
                tracing::info!(
                    target: "fieldsync",
                    event = "submit_queued_after_failure",
                    entity_type = %kind,
                    action = %action,
                    error = %err
                );
                let queued = self
                    .store()
                    .enqueue_with_id(key, kind, action, target.as_deref(), payload)
                    .await?;
                self.refresh_quietly().await;
                Ok(SubmitOutcome::Queued(queued))
            }
            Err(err) => Err(AppError::from(err)),
        }
    }

    async fn can_send_now(
        &self,
        kind: EntityKind,
        action: MutationAction,
        target: Option<&str>,
    ) -> AppResult<bool> {
        if !self.is_online() || !self.inner.engine.api().has_session().await {
            return Ok(false);
        }
        let Some(target) = target else {
            return Ok(action == MutationAction::Create);
        };
        if is_local_id(target) {
            return Ok(false);
        }
        Ok(!self.store().has_queued_for_target(kind, target).await?)
    }

    pub async fn enqueue_photo(
        &self,
        job_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> AppResult<PendingPhoto> {
        let photo = self.photos().enqueue(job_id, file_name, bytes).await?;
        self.refresh_quietly().await;
        Ok(photo)
    }

    pub async fn get_pending_mutations(&self) -> AppResult<Vec<OfflineMutation>> {
        self.store().get_pending_mutations().await
    }

    pub async fn get_pending_mutations_by_type(
        &self,
        kind: EntityKind,
    ) -> AppResult<Vec<OfflineMutation>> {
        self.store().get_pending_mutations_by_type(kind).await
    }

    /// Runs a pass unless one is already in flight, in which case this
    /// returns `None` without touching anything.
    pub async fn sync_now(&self) -> Option<FullSyncReport> {
        let report = {
            let Some(_guard) = SyncGuard::try_begin(&self.inner.syncing) else {
                tracing::debug!(target: "fieldsync", event = "sync_already_running");
                return None;
            };
            self.inner.snapshot.send_modify(|snap| snap.is_syncing = true);
            let report = self.inner.engine.perform_full_sync().await;
            if report.skipped.is_none() {
                *self
                    .inner
                    .last_report
                    .lock()
                    .unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
            }
            report
        };
        self.refresh_quietly().await;
        Some(report)
    }

    /// Puts a failed mutation back to pending, whatever its retry count, and
    /// starts a pass. If a pass is already running the next one picks it up.
    pub async fn retry_mutation(&self, id: &str) -> AppResult<Option<FullSyncReport>> {
        self.store().reset_for_retry(id).await?;
        tracing::info!(target: "fieldsync", event = "mutation_retry_requested", mutation_id = %id);
        Ok(self.sync_now().await)
    }

    /// Abandons a mutation. Nothing already applied server-side is undone.
    pub async fn dismiss_mutation(&self, id: &str) -> AppResult<bool> {
        let removed = self.store().remove(id).await?;
        self.refresh_quietly().await;
        Ok(removed)
    }

    pub async fn retry_photo(&self, id: &str) -> AppResult<Option<FullSyncReport>> {
        self.photos().reset_for_retry(id).await?;
        Ok(self.sync_now().await)
    }

    pub async fn dismiss_photo(&self, id: &str) -> AppResult<bool> {
        let removed = self.photos().remove(id).await?;
        self.refresh_quietly().await;
        Ok(removed)
    }

    /// Returns records an aborted pass left in `syncing` to `pending`. Skipped
    /// while a pass is running, since its records are legitimately in flight.
    pub async fn recover_interrupted(&self) -> AppResult<Option<u64>> {
        let recovered = {
            let Some(_guard) = SyncGuard::try_begin(&self.inner.syncing) else {
                return Ok(None);
            };
            let mutations = self.store().recover_interrupted().await?;
            let photos = self.photos().recover_interrupted().await?;
            mutations + photos
        };
        self.refresh_quietly().await;
        Ok(Some(recovered))
    }

    /// Drops cached reads. The mutation queue and photos are untouched.
    pub async fn clear_cache(&self) -> AppResult<u64> {
        self.inner.cache.clear().await
    }

    pub fn snapshot(&self) -> OfflineSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OfflineSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Combined counts of the last pass that actually ran.
    pub fn last_sync_result(&self) -> Option<SyncResult> {
        self.last_report().map(|report| report.combined())
    }

    pub fn last_report(&self) -> Option<FullSyncReport> {
        self.inner
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-reads counts from the store and publishes a new snapshot.
    pub async fn refresh(&self) -> AppResult<OfflineSnapshot> {
        let pending_count = self.store().pending_count().await?;
        let pending_photos = self.photos().count().await?;
        let failed_mutations = self.store().failed_mutations().await?;
        let snapshot = OfflineSnapshot {
            online: self.is_online(),
            pending_count,
            pending_photos,
            is_syncing: self.is_syncing(),
            last_sync_result: self.last_sync_result(),
            failed_mutations,
        };
        self.inner.snapshot.send_replace(snapshot.clone());
        Ok(snapshot)
    }

    async fn refresh_quietly(&self) {
        if let Err(err) = self.refresh().await {
            tracing::warn!(target: "fieldsync", event = "snapshot_refresh_failed", error = %err);
        }
    }

    /// Stops connectivity notifications and makes the engine stop after the
    /// item in flight. Later passes are skipped.
    pub fn shutdown(&self) {
        self.inner.engine.cancel();
        let subscription = self
            .inner
            .connectivity
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }
        tracing::info!(target: "fieldsync", event = "context_shutdown");
    }
}
