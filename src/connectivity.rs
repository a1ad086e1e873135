//! Online/offline status and its observers.
//!
//! The platform signal may be unknown; the monitor then reports online and
//! lets request failures sort out whether the server is actually reachable.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::api::RemoteApi;

type Callback = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback)>>,
}

impl Registry {
    fn remove(&self, id: u64) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
}

#[derive(Clone, Default)]
pub struct ConnectivityMonitor {
    signal: Arc<Mutex<Option<bool>>>,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("signal", &self.signal())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ConnectivityMonitor {
    /// Starts with no platform signal, i.e. assumed online.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(online: bool) -> Self {
        let monitor = Self::default();
        *monitor.signal.lock().unwrap_or_else(|e| e.into_inner()) = Some(online);
        monitor
    }

    pub fn is_online(&self) -> bool {
        self.signal().unwrap_or(true)
    }

    /// Raw platform signal; `None` when unavailable.
    pub fn signal(&self) -> Option<bool> {
        *self.signal.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feeds a platform reading. Observers run only when the effective state
    /// changes, synchronously on the caller's thread.
    pub fn set_online(&self, online: bool) {
        self.apply(Some(online));
    }

    /// Marks the platform signal as unavailable.
    pub fn clear_signal(&self) {
        self.apply(None);
    }

    fn apply(&self, next: Option<bool>) {
        let changed_to = {
            let mut signal = self.signal.lock().unwrap_or_else(|e| e.into_inner());
            let before = signal.unwrap_or(true);
            *signal = next;
            let after = next.unwrap_or(true);
            (before != after).then_some(after)
        };
        let Some(online) = changed_to else {
            return;
        };

        tracing::info!(target: "fieldsync", event = "connectivity_changed", online);
        let callbacks: Vec<Callback> = {
            let guard = self
                .registry
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };
        for callback in callbacks {
            callback(online);
        }
    }

    /// Registers `callback` for every transition. Notifications stop when the
    /// returned token is unsubscribed or dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_online_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            active: true,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

/// Capability returned by [`ConnectivityMonitor::on_online_status_change`].
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
    active: bool,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Polls [`RemoteApi::probe`] and feeds the result into a monitor.
pub struct ConnectivityProbe {
    task: Option<JoinHandle<()>>,
}

impl ConnectivityProbe {
    pub fn spawn(
        monitor: ConnectivityMonitor,
        api: Arc<dyn RemoteApi>,
        interval: Duration,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reachable = api.probe().await;
                monitor.set_online(reachable);
            }
        });
        Self { task: Some(task) }
    }

    pub fn stop(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for ConnectivityProbe {
    fn drop(&mut self) {
        self.abort();
    }
}
