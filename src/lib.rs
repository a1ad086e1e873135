//! Offline mutation queue and sync engine for field-service work orders.
//!
//! Writes made while disconnected are persisted in a local SQLite log and
//! replayed against the work-order API when connectivity returns. The
//! [`OfflineContext`] is the surface a host application talks to.

pub mod api;
pub mod auth;
pub mod backoff;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod mutation;
pub mod photos;
pub mod scheduler;
pub mod store;
pub mod time;
pub mod util;

pub use api::{ApiError, ErrorClass, HttpApiClient, PhotoUpload, RemoteApi};
pub use auth::{Session, TokenStore};
pub use backoff::RetryPolicy;
pub use cache::ReadCache;
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, ConnectivityProbe, Subscription};
pub use context::{OfflineContext, OfflineSnapshot, SubmitOutcome, SyncGuard};
pub use engine::SyncEngine;
pub use error::{AppError, AppResult};
pub use logging::{init_file_logging, init_logging};
pub use mutation::{
    EntityKind, FailureKind, FullSyncReport, HaltReason, MutationAction, MutationStatus,
    OfflineMutation, SkipReason, SyncFailure, SyncResult,
};
pub use photos::{PendingPhoto, PhotoQueue};
pub use scheduler::{setup_auto_sync, AutoSyncHandle, AutoSyncOptions};
pub use store::MutationStore;

/// Git commit the binary was built from, or `unknown`.
pub const GIT_HASH: &str = env!("FIELDSYNC_GIT_HASH");
