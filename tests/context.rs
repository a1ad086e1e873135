#![allow(clippy::unwrap_used, clippy::expect_used)]

mod util;

use anyhow::Result;
use fieldsync_lib::{ApiError, EntityKind, MutationAction, SubmitOutcome, SyncResult};
use serde_json::json;
use util::{eventually, harness, Call};

#[tokio::test]
async fn concurrent_sync_now_runs_a_single_pass() -> Result<()> {
    let h = harness(true).await;
    h.ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await?;

    h.api.close_gate();
    let ctx = h.ctx.clone();
    let first = tokio::spawn(async move { ctx.sync_now().await });
    assert!(eventually(|| h.api.call_count() == 1).await);
    assert!(h.ctx.is_syncing());
    assert!(h.ctx.snapshot().is_syncing);

    assert_eq!(h.ctx.sync_now().await, None);

    h.api.open_gate();
    let report = first.await?.expect("first pass ran");
    assert_eq!(report.mutations, SyncResult { synced: 1, failed: 0 });
    assert_eq!(h.api.call_count(), 1);
    assert!(!h.ctx.is_syncing());
    assert!(!h.ctx.snapshot().is_syncing);
    Ok(())
}

#[tokio::test]
async fn retry_during_a_pass_is_picked_up_by_the_next_one() -> Result<()> {
    let h = harness(true).await;
    let failing = h
        .ctx
        .enqueue(EntityKind::Seal, MutationAction::Update, Some("1"), json!({}))
        .await?;
    h.api.fail_next(ApiError::status(409, "conflict"));
    h.ctx.sync_now().await.expect("pass ran");

    h.ctx
        .enqueue(EntityKind::Seal, MutationAction::Update, Some("2"), json!({}))
        .await?;
    h.api.close_gate();
    let ctx = h.ctx.clone();
    let running = tokio::spawn(async move { ctx.sync_now().await });
    assert!(eventually(|| h.api.call_count() == 2).await);

    assert_eq!(h.ctx.retry_mutation(&failing.id).await?, None);
    h.api.open_gate();
    running.await?.expect("pass ran");

    let report = h.ctx.sync_now().await.expect("pass ran");
    assert_eq!(report.mutations, SyncResult { synced: 1, failed: 0 });
    assert_eq!(h.ctx.snapshot().pending_count, 0);
    Ok(())
}

#[tokio::test]
async fn snapshot_tracks_queue_and_connectivity() -> Result<()> {
    let h = harness(false).await;
    let mut rx = h.ctx.subscribe();
    assert!(!rx.borrow().online);

    h.ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await?;
    rx.changed().await?;
    assert_eq!(rx.borrow_and_update().pending_count, 1);

    h.monitor.set_online(true);
    assert!(rx.borrow_and_update().online);
    assert!(h.ctx.snapshot().online);

    h.ctx.sync_now().await.expect("pass ran");
    let snap = h.ctx.snapshot();
    assert_eq!(snap.pending_count, 0);
    assert_eq!(snap.last_sync_result, Some(SyncResult { synced: 1, failed: 0 }));
    Ok(())
}

#[tokio::test]
async fn skipped_pass_keeps_the_previous_result() -> Result<()> {
    let h = harness(true).await;
    h.ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await?;
    h.ctx.sync_now().await.expect("pass ran");

    h.monitor.set_online(false);
    let report = h.ctx.sync_now().await.expect("pass returned");
    assert!(report.skipped.is_some());
    assert_eq!(h.ctx.last_sync_result(), Some(SyncResult { synced: 1, failed: 0 }));
    Ok(())
}

#[tokio::test]
async fn snapshot_serializes_with_ui_field_names() -> Result<()> {
    let h = harness(true).await;
    let value = serde_json::to_value(h.ctx.snapshot())?;
    assert_eq!(value["online"], true);
    assert_eq!(value["pendingCount"], 0);
    assert_eq!(value["isSyncing"], false);
    assert!(value["lastSyncResult"].is_null());
    assert!(value["failedMutations"].as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn submit_applies_directly_when_online() -> Result<()> {
    let h = harness(true).await;
    let outcome = h
        .ctx
        .submit(
            EntityKind::Order,
            MutationAction::Update,
            Some("42"),
            json!({"status": "completed"}),
        )
        .await?;
    assert_eq!(outcome, SubmitOutcome::Applied(json!({"status": "completed"})));
    assert_eq!(h.ctx.snapshot().pending_count, 0);
    Ok(())
}

#[tokio::test]
async fn submit_queues_when_offline() -> Result<()> {
    let h = harness(false).await;
    let outcome = h
        .ctx
        .submit(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await?;
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert_eq!(h.api.call_count(), 0);
    assert_eq!(h.ctx.snapshot().pending_count, 1);
    Ok(())
}

#[tokio::test]
async fn submit_queues_behind_existing_work_for_the_target() -> Result<()> {
    let h = harness(false).await;
    h.ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({"a": 1}))
        .await?;
    h.monitor.set_online(true);

    let outcome = h
        .ctx
        .submit(EntityKind::Order, MutationAction::Update, Some("42"), json!({"a": 2}))
        .await?;
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert_eq!(h.api.call_count(), 0);
    Ok(())
}

#[tokio::test]
async fn submit_keeps_the_key_when_queueing_after_a_transient_failure() -> Result<()> {
    let h = harness(true).await;
    h.api.fail_next(ApiError::Timeout);
    let outcome = h
        .ctx
        .submit(EntityKind::Material, MutationAction::Update, Some("5"), json!({}))
        .await?;
    let SubmitOutcome::Queued(queued) = outcome else {
        panic!("expected the write to be queued");
    };
    assert_eq!(h.api.calls()[0].key(), queued.id);

    h.ctx.sync_now().await.expect("pass ran");
    let calls = h.api.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].key(), calls[1].key());
    Ok(())
}

#[tokio::test]
async fn submit_returns_rejections_to_the_caller() -> Result<()> {
    let h = harness(true).await;
    h.api.fail_next(ApiError::status(422, "invalid status"));
    let err = h
        .ctx
        .submit(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await
        .expect_err("rejected");
    assert_eq!(err.code(), "API/REJECTED");
    assert_eq!(h.ctx.snapshot().pending_count, 0);
    Ok(())
}

#[tokio::test]
async fn submit_create_then_queue_update_against_placeholder() -> Result<()> {
    let h = harness(false).await;
    let SubmitOutcome::Queued(create) = h
        .ctx
        .submit(EntityKind::Job, MutationAction::Create, None, json!({"title": "Leak"}))
        .await?
    else {
        panic!("offline create must queue");
    };
    h.monitor.set_online(true);

    let outcome = h
        .ctx
        .submit(
            EntityKind::Job,
            MutationAction::Update,
            Some(&create.target_id),
            json!({"title": "Leak fixed"}),
        )
        .await?;
    assert!(matches!(outcome, SubmitOutcome::Queued(_)));
    assert_eq!(h.api.call_count(), 0);

    h.ctx.sync_now().await.expect("pass ran");
    let calls = h.api.calls();
    assert!(matches!(calls[0], Call::Create { .. }));
    assert!(matches!(&calls[1], Call::Update { id, .. } if id == "srv-1"));
    Ok(())
}

#[tokio::test]
async fn clear_cache_leaves_the_queue_alone() -> Result<()> {
    let h = harness(false).await;
    h.ctx.cache().put("orders", &json!([{"id": 1}])).await?;
    h.ctx.cache().put("jobs", &json!([])).await?;
    h.ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("1"), json!({}))
        .await?;
    h.ctx.enqueue_photo("9", "a.jpg", b"bytes").await?;

    assert_eq!(h.ctx.clear_cache().await?, 2);
    assert!(h.ctx.cache().get("orders").await?.is_none());
    let snap = h.ctx.refresh().await?;
    assert_eq!(snap.pending_count, 1);
    assert_eq!(snap.pending_photos, 1);
    Ok(())
}

#[tokio::test]
async fn reopen_recovers_rows_stranded_in_syncing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let mut config = fieldsync_lib::SyncConfig::with_data_dir(dir.path());
    config.backoff_base = std::time::Duration::ZERO;
    config.backoff_max = std::time::Duration::ZERO;
    let monitor = fieldsync_lib::ConnectivityMonitor::with_initial(false);

    let id = {
        let api = util::MockApi::new();
        let ctx = fieldsync_lib::OfflineContext::open(&config, api, monitor.clone()).await?;
        let m = ctx
            .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
            .await?;
        ctx.store().mark_syncing(&m.id).await?;
        ctx.store().pool().close().await;
        m.id
    };

    let api = util::MockApi::new();
    let ctx = fieldsync_lib::OfflineContext::open(&config, api.clone(), monitor.clone()).await?;
    let pending = ctx.get_pending_mutations().await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);

    monitor.set_online(true);
    let report = ctx.sync_now().await.expect("pass ran");
    assert_eq!(report.mutations.synced, 1);
    assert_eq!(api.calls()[0].key(), id);
    Ok(())
}

#[tokio::test]
async fn submit_queues_behind_a_write_in_flight() -> Result<()> {
    let h = harness(true).await;
    let first = h
        .ctx
        .enqueue(
            EntityKind::Order,
            MutationAction::Update,
            Some("42"),
            json!({"status": "a"}),
        )
        .await?;

    h.api.close_gate();
    let ctx = h.ctx.clone();
    let pass = tokio::spawn(async move { ctx.sync_now().await });
    assert!(eventually(|| h.api.call_count() == 1).await);

    let outcome = h
        .ctx
        .submit(
            EntityKind::Order,
            MutationAction::Update,
            Some("42"),
            json!({"status": "b"}),
        )
        .await?;
    let second = match outcome {
        SubmitOutcome::Queued(m) => m,
        other => panic!("direct write while order 42 was in flight: {other:?}"),
    };
    assert_eq!(h.api.call_count(), 1);

    h.api.open_gate();
    pass.await?.expect("pass ran");
    h.ctx.sync_now().await.expect("pass ran");

    let keys: Vec<String> = h.api.calls().iter().map(|c| c.key().to_string()).collect();
    assert_eq!(keys, vec![first.id, second.id]);
    assert_eq!(h.ctx.snapshot().pending_count, 0);
    Ok(())
}

#[tokio::test]
async fn recovery_waits_for_a_running_pass() -> Result<()> {
    let h = harness(true).await;
    let m = h
        .ctx
        .enqueue(EntityKind::Order, MutationAction::Update, Some("42"), json!({}))
        .await?;

    h.api.close_gate();
    let ctx = h.ctx.clone();
    let pass = tokio::spawn(async move { ctx.sync_now().await });
    assert!(eventually(|| h.api.call_count() == 1).await);

    assert_eq!(h.ctx.recover_interrupted().await?, None);
    let in_flight = h.ctx.store().get(&m.id).await?.expect("row");
    assert_eq!(in_flight.status, fieldsync_lib::MutationStatus::Syncing);

    h.api.open_gate();
    pass.await?.expect("pass ran");
    assert_eq!(h.ctx.recover_interrupted().await?, Some(0));
    Ok(())
}
