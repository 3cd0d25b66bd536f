use chrono::{DateTime, Duration, TimeZone, Utc};
use entitlement_core::{
    catalog::{BillingPeriod, PlanSpecifier},
    ids::*,
    model::{CallContext, Subscription, SubscriptionBundle},
    EventType, ManualClock,
};
use entitlement_engine::{Engine, EngineConfig, EngineError, TimelineView};
use entitlement_storage::SqliteStorage;
use uuid::Uuid;

use crate::catalog::{FixtureCatalog, PRICE_LIST};

/// Day `n` of the fixture calendar, day 0 being 2024-01-01.
pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        + Duration::days(n)
}

pub fn monthly(product: &str) -> PlanSpecifier {
    PlanSpecifier::new(product, BillingPeriod::Monthly, PRICE_LIST)
}

/// Call context acting at day `n`.
pub fn at(n: i64) -> CallContext {
    CallContext::new("harness").with_requested_date(day(n))
}

/// An engine on its own account with a clock the test moves by hand.
pub struct TestWorld {
    pub engine: Engine<FixtureCatalog>,
    pub clock: ManualClock,
    pub account: AccountId,
}

impl TestWorld {
    pub fn new() -> Result<Self, EngineError> {
        Self::with_storage(SqliteStorage::open_in_memory()?, FixtureCatalog::new(), Self::quick_config())
    }

    pub fn with_catalog(catalog: FixtureCatalog) -> Result<Self, EngineError> {
        Self::with_storage(SqliteStorage::open_in_memory()?, catalog, Self::quick_config())
    }

    /// A world on a database file, so several worlds can share one database.
    pub fn open(path: &str) -> Result<Self, EngineError> {
        Self::with_storage(SqliteStorage::open(path)?, FixtureCatalog::new(), Self::quick_config())
    }

    pub fn with_storage(
        storage: SqliteStorage,
        catalog: FixtureCatalog,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let clock = ManualClock::new(day(0));
        let engine = Engine::new(storage, catalog, Box::new(clock.clone()), config)?;
        Ok(Self {
            engine,
            clock,
            account: AccountId::new(),
        })
    }

    /// Lock retries kept short so contention tests finish quickly.
    pub fn quick_config() -> EngineConfig {
        EngineConfig {
            lock_retry_attempts: 3,
            lock_retry_backoff_ms: 5,
            ..EngineConfig::default()
        }
    }

    pub fn fresh_key() -> String {
        format!("bundle-{}", Uuid::now_v7().simple())
    }

    pub fn bundle(&mut self) -> Result<SubscriptionBundle, EngineError> {
        self.engine.create_bundle(self.account, &Self::fresh_key(), &at(0))
    }

    pub fn subscribe(
        &mut self,
        bundle_id: BundleId,
        product: &str,
        on_day: i64,
    ) -> Result<Subscription, EngineError> {
        self.engine.create_subscription(bundle_id, &monthly(product), &at(on_day))
    }

    pub fn timeline(&self, bundle_id: BundleId) -> Result<TimelineView, EngineError> {
        self.engine.get_bundle_timeline(bundle_id)
    }

    /// Visible event types of a subscription with their day offsets.
    pub fn history(&self, subscription_id: SubscriptionId) -> Result<Vec<(EventType, i64)>, EngineError> {
        let sub = self.engine.get_subscription(subscription_id)?;
        Ok(sub
            .effective_events()
            .iter()
            .map(|e| (e.event_type(), (e.effective_date - day(0)).num_days()))
            .collect())
    }
}
