use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::context::OfflineContext;
use crate::util::dispatch_async_with_fence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoSyncOptions {
    /// Pass cadence while online.
    pub sync_interval: Duration,
    /// How often `pendingCount` and friends are re-read from the store.
    pub refresh_interval: Duration,
    /// Run one pass immediately if online at setup.
    pub sync_on_start: bool,
}

impl AutoSyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            sync_interval: config.sync_interval,
            refresh_interval: config.refresh_interval,
            sync_on_start: true,
        }
    }
}

impl Default for AutoSyncOptions {
    fn default() -> Self {
        Self {
            sync_interval: crate::config::DEFAULT_SYNC_INTERVAL,
            refresh_interval: crate::config::DEFAULT_REFRESH_INTERVAL,
            sync_on_start: true,
        }
    }
}

/// Cleanup capability for [`setup_auto_sync`]. Stopping consumes the handle;
/// dropping it also stops future triggers but does not wait.
#[must_use = "dropping the handle stops auto-sync"]
pub struct AutoSyncHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutoSyncHandle {
    /// Prevents further triggers and waits for the scheduler task. A pass
    /// already in flight runs to completion first.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::error!(target: "fieldsync", event = "auto_sync_join_failed", error = %err);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for AutoSyncHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Startup,
    Reconnected,
    Interval,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Startup => "startup",
            Trigger::Reconnected => "reconnected",
            Trigger::Interval => "interval",
        }
    }
}

/// Starts syncing on offline→online edges and on a fixed interval while
/// online, and keeps the context snapshot fresh. Must be called inside a
/// tokio runtime.
pub fn setup_auto_sync(ctx: OfflineContext, options: AutoSyncOptions) -> AutoSyncHandle {
    let (edge_tx, mut edge_rx) = mpsc::unbounded_channel::<()>();
    let subscription = ctx.monitor().on_online_status_change(move |online| {
        if online {
            let _ = edge_tx.send(());
        }
    });
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let _subscription = subscription;
        let start = Instant::now();
        let mut sync_tick = interval_at(start + options.sync_interval, options.sync_interval);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh_tick =
            interval_at(start + options.refresh_interval, options.refresh_interval);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            target: "fieldsync",
            event = "auto_sync_started",
            sync_interval_secs = options.sync_interval.as_secs(),
            refresh_interval_secs = options.refresh_interval.as_secs()
        );

        if options.sync_on_start && ctx.is_online() {
            run_pass(&ctx, Trigger::Startup).await;
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                Some(()) = edge_rx.recv() => {
                    while edge_rx.try_recv().is_ok() {}
                    run_pass(&ctx, Trigger::Reconnected).await;
                }
                _ = sync_tick.tick() => {
                    if ctx.is_online() {
                        run_pass(&ctx, Trigger::Interval).await;
                    }
                }
                _ = refresh_tick.tick() => {
                    if let Err(err) = ctx.refresh().await {
                        tracing::warn!(target: "fieldsync", event = "snapshot_refresh_failed", error = %err);
                    }
                }
            }
        }

        tracing::info!(target: "fieldsync", event = "auto_sync_stopped");
    });

    AutoSyncHandle {
        shutdown: Some(stop_tx),
        task: Some(task),
    }
}

async fn run_pass(ctx: &OfflineContext, trigger: Trigger) {
    tracing::debug!(target: "fieldsync", event = "auto_sync_trigger", trigger = trigger.as_str());
    match dispatch_async_with_fence(|| ctx.sync_now()).await {
        Ok(Some(report)) => {
            let combined = report.combined();
            tracing::info!(
                target: "fieldsync",
                event = "auto_sync_pass",
                trigger = trigger.as_str(),
                synced = combined.synced,
                failed = combined.failed
            );
        }
        Ok(None) => {
            tracing::debug!(target: "fieldsync", event = "auto_sync_pass_dropped", trigger = trigger.as_str());
        }
        Err(err) => {
            tracing::error!(
                target: "fieldsync",
                event = "auto_sync_pass_panicked",
                trigger = trigger.as_str(),
                code = %err.code(),
                error = %err
            );
            match ctx.recover_interrupted().await {
                Ok(Some(count)) => {
                    tracing::info!(target: "fieldsync", event = "auto_sync_recovered", count);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::error!(target: "fieldsync", event = "auto_sync_recover_failed", error = %err);
                }
            }
        }
    }
}
