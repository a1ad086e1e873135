//! Records persisted by the offline queue and the aggregates reported by a
//! sync pass.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::AppError;

/// Entity categories the work-order API accepts writes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum EntityKind {
    Order,
    Job,
    Material,
    Activity,
    Seal,
    User,
    Tenant,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Order,
        EntityKind::Job,
        EntityKind::Material,
        EntityKind::Activity,
        EntityKind::Seal,
        EntityKind::User,
        EntityKind::Tenant,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Order => "order",
            EntityKind::Job => "job",
            EntityKind::Material => "material",
            EntityKind::Activity => "activity",
            EntityKind::Seal => "seal",
            EntityKind::User => "user",
            EntityKind::Tenant => "tenant",
        }
    }

    /// Collection segment used by the REST routes.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityKind::Order => "orders",
            EntityKind::Job => "jobs",
            EntityKind::Material => "materials",
            EntityKind::Activity => "activities",
            EntityKind::Seal => "seals",
            EntityKind::User => "users",
            EntityKind::Tenant => "tenants",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                AppError::new("STORE/UNKNOWN_ENTITY_TYPE", "Unknown entity type")
                    .with_context("entity_type", s.to_string())
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MutationAction {
    Create,
    Update,
    Delete,
}

impl MutationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationAction::Create => "create",
            MutationAction::Update => "update",
            MutationAction::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(MutationAction::Create),
            "update" => Ok(MutationAction::Update),
            "delete" => Ok(MutationAction::Delete),
            _ => Err(AppError::new("STORE/UNKNOWN_ACTION", "Unknown mutation action")
                .with_context("action", s.to_string())),
        }
    }
}

/// Lifecycle of a queued mutation. Successful mutations are deleted rather
/// than given a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum MutationStatus {
    Pending,
    Syncing,
    Failed,
}

impl MutationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationStatus::Pending => "pending",
            MutationStatus::Syncing => "syncing",
            MutationStatus::Failed => "failed",
        }
    }
}

impl FromStr for MutationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MutationStatus::Pending),
            "syncing" => Ok(MutationStatus::Syncing),
            "failed" => Ok(MutationStatus::Failed),
            _ => Err(AppError::new("STORE/CORRUPT_RECORD", "Unknown mutation status")
                .with_context("status", s.to_string())),
        }
    }
}

/// Whether a failure may clear up by resending the same request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        }
    }
}

impl FromStr for FailureKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(FailureKind::Transient),
            "permanent" => Ok(FailureKind::Permanent),
            _ => Err(AppError::new("STORE/CORRUPT_RECORD", "Unknown failure kind")
                .with_context("failure_kind", s.to_string())),
        }
    }
}

/// Reason recorded on a failed replay attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Earliest time (ms) an automatic pass may try again.
    pub next_attempt_at: Option<i64>,
}

impl SyncFailure {
    pub fn transient(message: impl Into<String>, next_attempt_at: i64) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
            next_attempt_at: Some(next_attempt_at),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
            next_attempt_at: None,
        }
    }
}

/// A durable record of one pending write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct OfflineMutation {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: EntityKind,
    pub action: MutationAction,
    pub target_id: String,
    #[ts(type = "unknown")]
    pub payload: Value,
    #[ts(type = "number")]
    pub created_at: i64,
    pub retry_count: u32,
    pub status: MutationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub failure_kind: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional, type = "number")]
    pub next_attempt_at: Option<i64>,
}

impl OfflineMutation {
    /// Automatic passes never retry permanent failures; only the user can.
    pub fn is_retryable(&self) -> bool {
        self.failure_kind != Some(FailureKind::Permanent)
    }

    pub fn has_local_target(&self) -> bool {
        crate::id::is_local_id(&self.target_id)
    }

    pub fn group_key(&self) -> (EntityKind, String) {
        (self.entity_type, self.target_id.clone())
    }
}

/// Per-domain counts for one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncResult {
    pub synced: u32,
    pub failed: u32,
}

impl SyncResult {
    pub fn merge(self, other: SyncResult) -> SyncResult {
        SyncResult {
            synced: self.synced + other.synced,
            failed: self.failed + other.failed,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.synced == 0 && self.failed == 0
    }
}

/// Why a pass did not start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum SkipReason {
    Offline,
    NoSession,
    StoreUnavailable,
}

/// Why a pass stopped before draining every eligible item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export)]
pub enum HaltReason {
    Unauthenticated,
    WentOffline,
    Cancelled,
}

/// Outcome of `perform_full_sync`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FullSyncReport {
    pub mutations: SyncResult,
    pub photos: SyncResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub skipped: Option<SkipReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[ts(optional)]
    pub halted: Option<HaltReason>,
}

impl FullSyncReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }

    /// Both domains summed, as shown by the pending-sync indicator.
    pub fn combined(&self) -> SyncResult {
        self.mutations.merge(self.photos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_kind_parses_case_insensitively() {
        assert_eq!("Order".parse::<EntityKind>().unwrap(), EntityKind::Order);
        assert_eq!(" seal ".parse::<EntityKind>().unwrap(), EntityKind::Seal);
        let err = "invoice".parse::<EntityKind>().unwrap_err();
        assert_eq!(err.code(), "STORE/UNKNOWN_ENTITY_TYPE");
    }

    #[test]
    fn mutation_serializes_with_ui_field_names() {
        let mutation = OfflineMutation {
            id: "m-1".into(),
            entity_type: EntityKind::Order,
            action: MutationAction::Update,
            target_id: "42".into(),
            payload: json!({"status": "completed"}),
            created_at: 10,
            retry_count: 0,
            status: MutationStatus::Pending,
            last_error: None,
            failure_kind: None,
            next_attempt_at: None,
        };
        let value = serde_json::to_value(&mutation).unwrap();
        assert_eq!(value["type"], "order");
        assert_eq!(value["targetId"], "42");
        assert_eq!(value["retryCount"], 0);
        assert_eq!(value["status"], "pending");
        assert!(value.get("lastError").is_none());
    }

    #[test]
    fn combined_result_sums_domains() {
        let report = FullSyncReport {
            mutations: SyncResult { synced: 2, failed: 1 },
            photos: SyncResult { synced: 1, failed: 0 },
            ..FullSyncReport::default()
        };
        assert_eq!(report.combined(), SyncResult { synced: 3, failed: 1 });
    }
}
