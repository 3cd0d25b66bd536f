use chrono::{DateTime, Duration, Utc};

use entitlement_core::{
    events::EntitlementEvent,
    ids::*,
    model::{Subscription, SubscriptionBundle},
};

use crate::error::StorageError;

/// The new visible history of one subscription after a repair. Events are
/// written at `active_version + 1` in the given order.
#[derive(Debug, Clone)]
pub struct RepairedSubscription {
    pub subscription_id: SubscriptionId,
    pub start_date: DateTime<Utc>,
    pub bundle_start_date: DateTime<Utc>,
    pub align_start_date: DateTime<Utc>,
    pub events: Vec<EntitlementEvent>,
}

#[derive(Debug, Clone)]
pub struct RepairCommit {
    pub bundle_id: BundleId,
    /// The view the repair was validated against; the commit fails if the
    /// bundle moved on since.
    pub expected_view: String,
    pub bundle_start_date: Option<DateTime<Utc>>,
    pub subscriptions: Vec<RepairedSubscription>,
    pub created_by: String,
}

/// Audit trail of a committed repair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRecord {
    pub repair_id: i64,
    pub bundle_id: BundleId,
    pub subscriptions: Vec<SubscriptionId>,
    pub event_count: u32,
    pub checksum: [u8; 32],
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

/// A bundle written from scratch, subscriptions and their events included.
/// Used by migration and by the destination side of a transfer.
#[derive(Debug, Clone)]
pub struct BundleImage {
    pub bundle: SubscriptionBundle,
    pub subscriptions: Vec<Subscription>,
}

pub trait Storage {
    fn create_bundle(&mut self, bundle: &SubscriptionBundle) -> Result<(), StorageError>;

    fn get_bundle(&self, bundle_id: BundleId) -> Result<Option<SubscriptionBundle>, StorageError>;

    fn get_bundle_by_key(
        &self,
        account_id: AccountId,
        key: &str,
    ) -> Result<Option<SubscriptionBundle>, StorageError>;

    fn get_bundles_for_account(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<SubscriptionBundle>, StorageError>;

    /// Insert a subscription with its initial events at version 1.
    fn create_subscription(
        &mut self,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Result<Subscription, StorageError>;

    fn get_subscription(
        &self,
        subscription_id: SubscriptionId,
    ) -> Result<Option<Subscription>, StorageError>;

    /// All subscriptions of a bundle, BASE/STANDALONE first, then add-ons by
    /// start date.
    fn load_subscriptions(&self, bundle_id: BundleId) -> Result<Vec<Subscription>, StorageError>;

    fn append_events(
        &mut self,
        subscription_id: SubscriptionId,
        events: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntitlementEvent>, StorageError>;

    /// Append events for several subscriptions of one bundle in a single
    /// transaction.
    fn append_bundle_events(
        &mut self,
        bundle_id: BundleId,
        events: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<Vec<EntitlementEvent>, StorageError>;

    fn set_charged_through_date(
        &mut self,
        subscription_id: SubscriptionId,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), StorageError>;

    fn view_token(&self, bundle_id: BundleId) -> Result<String, StorageError>;

    /// Atomically write a repair: compare the view, bump every touched
    /// subscription's version, write the new event sets and the audit record.
    fn commit_repair(
        &mut self,
        commit: &RepairCommit,
        now: DateTime<Utc>,
    ) -> Result<RepairRecord, StorageError>;

    /// Atomically create whole bundles and append cancellation events to
    /// existing subscriptions.
    fn commit_bundles(
        &mut self,
        images: &[BundleImage],
        appended: &[EntitlementEvent],
        now: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Events written at a specific version, including superseded versions.
    fn events_for_version(
        &self,
        subscription_id: SubscriptionId,
        version: u32,
    ) -> Result<Vec<EntitlementEvent>, StorageError>;

    fn get_repairs(&self, bundle_id: BundleId) -> Result<Vec<RepairRecord>, StorageError>;

    fn event_count(&self) -> Result<u64, StorageError>;

    /// Take the advisory lock on a bundle. Returns `false` when another owner
    /// holds a lock younger than `ttl`.
    fn try_acquire_bundle_lock(
        &mut self,
        bundle_id: BundleId,
        owner: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    fn release_bundle_lock(&mut self, bundle_id: BundleId, owner: &str) -> Result<(), StorageError>;
}
