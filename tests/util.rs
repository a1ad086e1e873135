#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fieldsync_lib::db::open_memory_pool;
use fieldsync_lib::{
    ApiError, ConnectivityMonitor, EntityKind, OfflineContext, PhotoUpload, RemoteApi,
    SyncConfig,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create {
        kind: EntityKind,
        key: String,
    },
    Update {
        kind: EntityKind,
        id: String,
        key: String,
    },
    Delete {
        kind: EntityKind,
        id: String,
        key: String,
    },
    Upload {
        job_id: String,
        key: String,
        file_name: String,
    },
}

impl Call {
    pub fn key(&self) -> &str {
        match self {
            Call::Create { key, .. }
            | Call::Update { key, .. }
            | Call::Delete { key, .. }
            | Call::Upload { key, .. } => key,
        }
    }
}

/// Scripted stand-in for the work-order API. Each call consumes the next
/// scripted outcome and succeeds once the script is empty.
pub struct MockApi {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<Result<(), ApiError>>>,
    session: AtomicBool,
    reachable: AtomicBool,
    panic_next: AtomicBool,
    next_id: AtomicU64,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Default for MockApi {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            session: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
            panic_next: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            gate: Mutex::new(None),
        }
    }
}

impl MockApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn fail_next(&self, err: ApiError) {
        self.script.lock().unwrap().push_back(Err(err));
    }

    /// Lets one call through ahead of later scripted failures.
    pub fn succeed_next(&self) {
        self.script.lock().unwrap().push_back(Ok(()));
    }

    pub fn set_session(&self, present: bool) {
        self.session.store(present, Ordering::SeqCst);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn panic_on_next_call(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    /// Calls block after being recorded until [`MockApi::open_gate`].
    pub fn close_gate(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn open_gate(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    async fn enter(&self, call: Call) -> Result<(), ApiError> {
        self.calls.lock().unwrap().push(call);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("mock api exploded");
        }
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.expect("gate closed");
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteApi for MockApi {
    async fn has_session(&self) -> bool {
        self.session.load(Ordering::SeqCst)
    }

    async fn create(
        &self,
        kind: EntityKind,
        payload: &Value,
        key: &str,
    ) -> Result<Value, ApiError> {
        self.enter(Call::Create {
            kind,
            key: key.to_string(),
        })
        .await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut body = payload.clone();
        if let Value::Object(map) = &mut body {
            map.insert("id".into(), json!(format!("srv-{id}")));
            Ok(body)
        } else {
            Ok(json!({ "id": format!("srv-{id}") }))
        }
    }

    async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        payload: &Value,
        key: &str,
    ) -> Result<Value, ApiError> {
        self.enter(Call::Update {
            kind,
            id: id.to_string(),
            key: key.to_string(),
        })
        .await?;
        Ok(payload.clone())
    }

    async fn delete(&self, kind: EntityKind, id: &str, key: &str) -> Result<(), ApiError> {
        self.enter(Call::Delete {
            kind,
            id: id.to_string(),
            key: key.to_string(),
        })
        .await
    }

    async fn upload_photo(
        &self,
        job_id: &str,
        upload: &PhotoUpload,
        key: &str,
    ) -> Result<(), ApiError> {
        self.enter(Call::Upload {
            job_id: job_id.to_string(),
            key: key.to_string(),
            file_name: upload.file_name.clone(),
        })
        .await
    }

    async fn probe(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

pub struct Harness {
    pub ctx: OfflineContext,
    pub api: Arc<MockApi>,
    pub monitor: ConnectivityMonitor,
    pub config: SyncConfig,
    pub dir: TempDir,
}

/// Context over an in-memory database with no backoff between retries.
pub async fn harness(online: bool) -> Harness {
    harness_with_retries(online, 5).await
}

pub async fn harness_with_retries(online: bool, max_retries: u32) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = SyncConfig::with_data_dir(dir.path());
    config.max_retries = max_retries;
    config.photo_max_retries = max_retries;
    config.backoff_base = Duration::ZERO;
    config.backoff_max = Duration::ZERO;

    let api = MockApi::new();
    let monitor = ConnectivityMonitor::with_initial(online);
    let pool = open_memory_pool().await.expect("memory pool");
    let ctx = OfflineContext::open_with_pool(
        pool,
        &config,
        api.clone() as Arc<dyn RemoteApi>,
        monitor.clone(),
    )
    .await
    .expect("open context");

    Harness {
        ctx,
        api,
        monitor,
        config,
        dir,
    }
}

/// Polls `check` every 10ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
