use chrono::{DateTime, Utc};
use entitlement_core::{
    events::EventType,
    ids::*,
    CatalogError, CoreError,
};
use entitlement_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;

/// Broad class of a failure, deciding how a caller should react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Stale read or contended bundle: re-read and retry.
    ConcurrencyConflict,
    /// The request references something that does not exist.
    Structural,
    /// The edit is logically inconsistent in time.
    Temporal,
    /// The catalog has no answer for the given input.
    Catalog,
}

/// Rejections of a bundle repair. Nothing is written when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepairError {
    #[error("bundle {bundle_id} changed since the repair was prepared (expected view {expected}, found {current})")]
    ViewChanged {
        bundle_id: BundleId,
        expected: String,
        current: String,
    },

    #[error("unknown bundle {0}")]
    UnknownBundle(BundleId),

    #[error("subscription {subscription_id} is not part of bundle {bundle_id}")]
    UnknownSubscription {
        bundle_id: BundleId,
        subscription_id: SubscriptionId,
    },

    #[error("bundle {0} has no active subscriptions")]
    NoActiveSubscriptions(BundleId),

    #[error("event {event_id} is not a visible event of subscription {subscription_id}")]
    NonExistentDeleteEvent {
        subscription_id: SubscriptionId,
        event_id: EventId,
    },

    #[error("subscription {subscription_id} keeps event {event_id} at {effective_date} after a deleted event")]
    InvalidDeleteSet {
        subscription_id: SubscriptionId,
        event_id: EventId,
        effective_date: DateTime<Utc>,
    },

    #[error("subscription {subscription_id} is re-created but keeps events up to {last_remaining}")]
    SubRecreateNotEmpty {
        subscription_id: SubscriptionId,
        last_remaining: DateTime<Utc>,
    },

    #[error("subscription {0} would be left without events")]
    SubEmpty(SubscriptionId),

    #[error("new event for {subscription_id} at {effective_date} precedes the last base plan event at {last_remaining}")]
    NewEventBeforeLastBpRemaining {
        subscription_id: SubscriptionId,
        effective_date: DateTime<Utc>,
        last_remaining: DateTime<Utc>,
    },

    #[error("new event for {subscription_id} at {effective_date} precedes its last remaining event at {last_remaining}")]
    NewEventBeforeLastAoRemaining {
        subscription_id: SubscriptionId,
        effective_date: DateTime<Utc>,
        last_remaining: DateTime<Utc>,
    },

    #[error("base plan is re-created but add-on {0} is missing from the repair")]
    BpRecreateMissingAo(SubscriptionId),

    #[error("base plan is re-created but add-on {0} does not start with a creation")]
    BpRecreateMissingAoCreate(SubscriptionId),

    #[error("add-on {subscription_id} re-created at {effective_date}, before the base plan start {base_start}")]
    AoCreateBeforeBpStart {
        subscription_id: SubscriptionId,
        effective_date: DateTime<Utc>,
        base_start: DateTime<Utc>,
    },

    #[error("add-on {subscription_id} keeps an event at {effective_date}, after the first deleted base plan event at {first_deleted}")]
    MissingAoDeleteEvent {
        subscription_id: SubscriptionId,
        effective_date: DateTime<Utc>,
        first_deleted: DateTime<Utc>,
    },

    #[error("{event_type:?} at {effective_date} is not allowed as a new event for {subscription_id}")]
    InvalidNewEventType {
        subscription_id: SubscriptionId,
        event_type: EventType,
        effective_date: DateTime<Utc>,
    },

    #[error("{event_type:?} at {effective_date} is invalid for {subscription_id}: {reason}")]
    InvalidTransition {
        subscription_id: SubscriptionId,
        event_type: EventType,
        effective_date: DateTime<Utc>,
        reason: String,
    },
}

impl RepairError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ViewChanged { .. } => "VIEW_CHANGED",
            Self::UnknownBundle(_) => "UNKNOWN_BUNDLE",
            Self::UnknownSubscription { .. } => "UNKNOWN_SUBSCRIPTION",
            Self::NoActiveSubscriptions(_) => "NO_ACTIVE_SUBSCRIPTIONS",
            Self::NonExistentDeleteEvent { .. } => "NON_EXISTENT_DELETE_EVENT",
            Self::InvalidDeleteSet { .. } => "INVALID_DELETE_SET",
            Self::SubRecreateNotEmpty { .. } => "SUB_RECREATE_NOT_EMPTY",
            Self::SubEmpty(_) => "SUB_EMPTY",
            Self::NewEventBeforeLastBpRemaining { .. } => "NEW_EVENT_BEFORE_LAST_BP_REMAINING",
            Self::NewEventBeforeLastAoRemaining { .. } => "NEW_EVENT_BEFORE_LAST_AO_REMAINING",
            Self::BpRecreateMissingAo(_) => "BP_RECREATE_MISSING_AO",
            Self::BpRecreateMissingAoCreate(_) => "BP_RECREATE_MISSING_AO_CREATE",
            Self::AoCreateBeforeBpStart { .. } => "AO_CREATE_BEFORE_BP_START",
            Self::MissingAoDeleteEvent { .. } => "MISSING_AO_DELETE_EVENT",
            Self::InvalidNewEventType { .. } => "INVALID_NEW_EVENT_TYPE",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ViewChanged { .. } => ErrorKind::ConcurrencyConflict,
            Self::UnknownBundle(_)
            | Self::UnknownSubscription { .. }
            | Self::NoActiveSubscriptions(_)
            | Self::NonExistentDeleteEvent { .. }
            | Self::BpRecreateMissingAo(_)
            | Self::InvalidNewEventType { .. } => ErrorKind::Structural,
            Self::InvalidDeleteSet { .. }
            | Self::SubRecreateNotEmpty { .. }
            | Self::SubEmpty(_)
            | Self::NewEventBeforeLastBpRemaining { .. }
            | Self::NewEventBeforeLastAoRemaining { .. }
            | Self::BpRecreateMissingAoCreate(_)
            | Self::AoCreateBeforeBpStart { .. }
            | Self::MissingAoDeleteEvent { .. }
            | Self::InvalidTransition { .. } => ErrorKind::Temporal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyConflict
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("repair rejected: {0}")]
    Repair(#[from] RepairError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("could not lock bundle {bundle_id} after {attempts} attempts")]
    LockTimeout { bundle_id: BundleId, attempts: u32 },

    #[error("bundle not found: {0}")]
    BundleNotFound(String),

    #[error("subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    #[error("bundle key {key} already used by account {account_id}")]
    BundleKeyInUse { account_id: AccountId, key: String },

    #[error("bundle {0} already has an active base subscription")]
    BaseAlreadyActive(BundleId),

    #[error("bundle {bundle_id} has no active base subscription at {date}")]
    MissingActiveBase {
        bundle_id: BundleId,
        date: DateTime<Utc>,
    },

    #[error("plan {plan} is {found}, subscription is {expected}")]
    CategoryMismatch {
        plan: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("subscription {0} is cancelled or pending cancellation")]
    SubscriptionCancelled(SubscriptionId),

    #[error("subscription {0} is not active")]
    SubscriptionNotActive(SubscriptionId),

    #[error("subscription {0} has no pending cancellation")]
    NotFutureCancelled(SubscriptionId),

    #[error("invalid migration: {0}")]
    InvalidMigration(String),

    #[error("nothing to transfer from bundle {0}")]
    NothingToTransfer(BundleId),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Repair(e) => e.code(),
            Self::LockTimeout { .. } => "LOCK_TIMEOUT",
            Self::Catalog(_) => "CATALOG_ERROR",
            Self::Storage(_) | Self::Core(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::BundleNotFound(_) => "BUNDLE_NOT_FOUND",
            Self::SubscriptionNotFound(_) => "SUBSCRIPTION_NOT_FOUND",
            Self::BundleKeyInUse { .. } => "BUNDLE_KEY_IN_USE",
            Self::BaseAlreadyActive(_) => "BASE_ALREADY_ACTIVE",
            Self::MissingActiveBase { .. } => "MISSING_ACTIVE_BASE",
            Self::CategoryMismatch { .. } => "CATEGORY_MISMATCH",
            Self::SubscriptionCancelled(_) => "SUBSCRIPTION_CANCELLED",
            Self::SubscriptionNotActive(_) => "SUBSCRIPTION_NOT_ACTIVE",
            Self::NotFutureCancelled(_) => "NOT_FUTURE_CANCELLED",
            Self::InvalidMigration(_) => "INVALID_MIGRATION",
            Self::NothingToTransfer(_) => "NOTHING_TO_TRANSFER",
        }
    }

    /// `None` for infrastructure failures and lifecycle precondition errors.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Repair(e) => Some(e.kind()),
            Self::LockTimeout { .. } => Some(ErrorKind::ConcurrencyConflict),
            Self::Catalog(_) => Some(ErrorKind::Catalog),
            Self::BundleNotFound(_) | Self::SubscriptionNotFound(_) => Some(ErrorKind::Structural),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == Some(ErrorKind::ConcurrencyConflict)
    }

    pub fn repair_code(&self) -> Option<&'static str> {
        match self {
            Self::Repair(e) => Some(e.code()),
            _ => None,
        }
    }
}
