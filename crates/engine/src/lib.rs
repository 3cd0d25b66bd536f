pub mod aligner;
pub mod config;
pub mod error;
pub mod lock;
pub mod migration;
pub mod repair;
pub mod timeline;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use aligner::{AlignmentContext, MigrationCase, PlanAligner, TimedPhase, TimedPhases};
pub use config::{ConfigError, EngineConfig};
pub use error::{EngineError, ErrorKind, RepairError};
pub use migration::{AccountMigration, BundleMigration, SubscriptionMigration};
pub use timeline::{BundleRepair, NewEvent, SubscriptionRepair, SubscriptionTimeline, TimelineView};
pub use transfer::TransferRequest;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use entitlement_core::{
    catalog::{ActionPolicy, PlanSpecifier, ProductCategory},
    events::{EntitlementEvent, EventPayload, PlanTarget},
    ids::*,
    model::{CallContext, Subscription, SubscriptionBundle},
    Catalog, Clock, SubscriptionState,
};
use entitlement_storage::{RepairRecord, SqliteStorage, Storage, StorageError};

/// Entitlement operations over one storage connection.
///
/// Every mutation of an existing bundle runs under that bundle's advisory
/// lock, so engines on separate connections to the same database serialize
/// their writes per bundle.
pub struct Engine<C: Catalog> {
    storage: SqliteStorage,
    catalog: C,
    clock: Box<dyn Clock>,
    config: EngineConfig,
    lock_owner: String,
}

impl<C: Catalog> Engine<C> {
    pub fn new(
        storage: SqliteStorage,
        catalog: C,
        clock: Box<dyn Clock>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            storage,
            catalog,
            clock,
            config,
            lock_owner: Uuid::now_v7().to_string(),
        })
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut SqliteStorage {
        &mut self.storage
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Run `op` holding the bundle lock. The lock is released whether or not
    /// `op` succeeds.
    fn locked<T>(
        &mut self,
        bundle_id: BundleId,
        op: impl FnOnce(&mut Self) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        lock::acquire(
            &mut self.storage,
            bundle_id,
            &self.lock_owner,
            self.clock.as_ref(),
            &self.config,
        )?;
        let result = op(self);
        let released = lock::release(&mut self.storage, bundle_id, &self.lock_owner);
        let value = result?;
        released?;
        Ok(value)
    }

    // ---- Reads ----

    pub fn get_bundle(&self, bundle_id: BundleId) -> Result<SubscriptionBundle, EngineError> {
        self.storage
            .get_bundle(bundle_id)?
            .ok_or_else(|| EngineError::BundleNotFound(bundle_id.to_string()))
    }

    pub fn get_bundle_by_key(
        &self,
        account_id: AccountId,
        key: &str,
    ) -> Result<Option<SubscriptionBundle>, EngineError> {
        Ok(self.storage.get_bundle_by_key(account_id, key)?)
    }

    pub fn get_bundles_for_account(&self, account_id: AccountId) -> Result<Vec<SubscriptionBundle>, EngineError> {
        Ok(self.storage.get_bundles_for_account(account_id)?)
    }

    pub fn get_subscription(&self, subscription_id: SubscriptionId) -> Result<Subscription, EngineError> {
        self.storage
            .get_subscription(subscription_id)?
            .ok_or(EngineError::SubscriptionNotFound(subscription_id))
    }

    pub fn get_subscriptions(&self, bundle_id: BundleId) -> Result<Vec<Subscription>, EngineError> {
        Ok(self.storage.load_subscriptions(bundle_id)?)
    }

    /// State of a subscription as of `as_of`; `None` if it has no creation.
    pub fn get_subscription_state(
        &self,
        subscription_id: SubscriptionId,
        as_of: DateTime<Utc>,
    ) -> Result<Option<SubscriptionState>, EngineError> {
        Ok(self.get_subscription(subscription_id)?.state_at(as_of))
    }

    pub fn get_bundle_timeline(&self, bundle_id: BundleId) -> Result<TimelineView, EngineError> {
        let bundle = self.get_bundle(bundle_id)?;
        let subscriptions = self.storage.load_subscriptions(bundle_id)?;
        Ok(TimelineView::from_bundle(&bundle, &subscriptions))
    }

    pub fn get_repairs(&self, bundle_id: BundleId) -> Result<Vec<RepairRecord>, EngineError> {
        Ok(self.storage.get_repairs(bundle_id)?)
    }

    // ---- Lifecycle ----

    pub fn create_bundle(
        &mut self,
        account_id: AccountId,
        key: &str,
        ctx: &CallContext,
    ) -> Result<SubscriptionBundle, EngineError> {
        if self.storage.get_bundle_by_key(account_id, key)?.is_some() {
            return Err(EngineError::BundleKeyInUse {
                account_id,
                key: key.to_string(),
            });
        }
        let now = self.clock.now();
        let bundle = SubscriptionBundle {
            bundle_id: BundleId::new(),
            key: key.to_string(),
            account_id,
            start_date: ctx.requested_date.unwrap_or(now),
            last_system_update_time: now,
        };
        self.storage
            .create_bundle(&bundle)
            .map_err(|e| key_in_use(e, account_id))?;
        info!(bundle_id = %bundle.bundle_id, %account_id, key, "bundle created");
        Ok(bundle)
    }

    /// Create a subscription on `spec` effective at the requested date, with
    /// every upcoming phase of the plan already scheduled.
    pub fn create_subscription(
        &mut self,
        bundle_id: BundleId,
        spec: &PlanSpecifier,
        ctx: &CallContext,
    ) -> Result<Subscription, EngineError> {
        self.locked(bundle_id, |engine| engine.create_subscription_locked(bundle_id, spec, ctx))
    }

    fn create_subscription_locked(
        &mut self,
        bundle_id: BundleId,
        spec: &PlanSpecifier,
        ctx: &CallContext,
    ) -> Result<Subscription, EngineError> {
        let now = self.clock.now();
        let effective = ctx.requested_date.unwrap_or(now);
        self.get_bundle(bundle_id)?;
        let existing = self.storage.load_subscriptions(bundle_id)?;
        let plan = self.catalog.find_plan(spec, effective)?;
        let category = plan.product.category;

        let bundle_start_date = if category.is_base_like() {
            if existing
                .iter()
                .any(|s| s.category.is_base_like() && s.is_active_at(effective))
            {
                return Err(EngineError::BaseAlreadyActive(bundle_id));
            }
            effective
        } else {
            existing
                .iter()
                .find(|s| s.category == ProductCategory::Base && s.is_active_at(effective))
                .map(|base| base.start_date)
                .ok_or(EngineError::MissingActiveBase {
                    bundle_id,
                    date: effective,
                })?
        };

        let alignment = AlignmentContext {
            category,
            bundle_start_date,
            align_start_date: effective,
        };
        let phases = PlanAligner::new(&self.catalog).align_on_create(
            &alignment,
            &plan,
            None,
            &spec.price_list,
            effective,
            effective,
        )?;

        let subscription_id = SubscriptionId::new();
        let target = PlanTarget::new(&plan.name, &phases.current.phase.name, &spec.price_list);
        let mut events = vec![EntitlementEvent::new(
            subscription_id,
            effective,
            effective,
            now,
            EventPayload::Create(target),
            &ctx.created_by,
        )];
        events.extend(phase_events(subscription_id, &phases, effective, now, &ctx.created_by));

        let subscription = Subscription {
            subscription_id,
            bundle_id,
            category,
            start_date: effective,
            bundle_start_date,
            align_start_date: effective,
            charged_through_date: None,
            active_version: 1,
            events,
        };
        let stored = self.storage.create_subscription(&subscription, now)?;
        info!(%bundle_id, %subscription_id, plan = %plan.name, %effective, "subscription created");
        Ok(stored)
    }

    /// Move a subscription to another plan. The catalog's change policy
    /// decides whether the change happens now or at the charged-through date.
    pub fn change_plan(
        &mut self,
        subscription_id: SubscriptionId,
        spec: &PlanSpecifier,
        ctx: &CallContext,
    ) -> Result<Subscription, EngineError> {
        let bundle_id = self.get_subscription(subscription_id)?.bundle_id;
        self.locked(bundle_id, |engine| engine.change_plan_locked(subscription_id, spec, ctx))
    }

    fn change_plan_locked(
        &mut self,
        subscription_id: SubscriptionId,
        spec: &PlanSpecifier,
        ctx: &CallContext,
    ) -> Result<Subscription, EngineError> {
        let now = self.clock.now();
        let requested = ctx.requested_date.unwrap_or(now);
        let sub = self.get_subscription(subscription_id)?;
        let current = live_target(&sub, requested)?;

        let aligner = PlanAligner::new(&self.catalog);
        let from = aligner.phase_specifier(&current, requested)?;
        let plan = self.catalog.find_plan(spec, requested)?;
        if plan.product.category != sub.category {
            return Err(EngineError::CategoryMismatch {
                plan: plan.name,
                expected: sub.category.as_str(),
                found: plan.product.category.as_str(),
            });
        }
        let change = self.catalog.plan_change(&from, spec, requested)?;
        let effective = policy_date(change.policy, &sub, requested);

        let alignment = AlignmentContext {
            category: sub.category,
            bundle_start_date: sub.bundle_start_date,
            align_start_date: sub.align_start_date,
        };
        let phases = aligner.align_on_change(
            &alignment,
            &current,
            &plan,
            &change.new_price_list,
            requested,
            effective,
        )?;

        let target = PlanTarget::new(&plan.name, &phases.current.phase.name, &change.new_price_list);
        let mut events = vec![EntitlementEvent::new(
            subscription_id,
            effective,
            requested,
            now,
            EventPayload::Change(target),
            &ctx.created_by,
        )];
        events.extend(phase_events(subscription_id, &phases, requested, now, &ctx.created_by));
        self.storage.append_events(subscription_id, &events, now)?;
        info!(%subscription_id, from = %current.plan, to = %plan.name, policy = ?change.policy, %effective, "plan changed");
        self.get_subscription(subscription_id)
    }

    /// Cancel a subscription. Cancelling a base plan also cancels its add-ons
    /// at the same date, or at their start if that is later.
    pub fn cancel(&mut self, subscription_id: SubscriptionId, ctx: &CallContext) -> Result<Subscription, EngineError> {
        let bundle_id = self.get_subscription(subscription_id)?.bundle_id;
        self.locked(bundle_id, |engine| engine.cancel_locked(subscription_id, ctx))
    }

    fn cancel_locked(&mut self, subscription_id: SubscriptionId, ctx: &CallContext) -> Result<Subscription, EngineError> {
        let now = self.clock.now();
        let requested = ctx.requested_date.unwrap_or(now);
        let sub = self.get_subscription(subscription_id)?;
        let current = live_target(&sub, requested)?;

        let from = PlanAligner::new(&self.catalog).phase_specifier(&current, requested)?;
        let policy = self.catalog.plan_cancel_policy(&from, requested)?;
        let effective = policy_date(policy, &sub, requested);

        let mut events = vec![EntitlementEvent::new(
            subscription_id,
            effective,
            requested,
            now,
            EventPayload::Cancel,
            &ctx.created_by,
        )];
        if sub.category == ProductCategory::Base {
            for add_on in self
                .storage
                .load_subscriptions(sub.bundle_id)?
                .iter()
                .filter(|s| s.category == ProductCategory::AddOn)
            {
                let Some(state) = add_on.state_at(effective) else {
                    continue;
                };
                if state.end_date.is_some_and(|end| end <= effective) {
                    continue;
                }
                let at = effective.max(add_on.start_date);
                debug!(add_on = %add_on.subscription_id, %at, "cascading cancel");
                events.push(EntitlementEvent::new(
                    add_on.subscription_id,
                    at,
                    requested,
                    now,
                    EventPayload::Cancel,
                    &ctx.created_by,
                ));
            }
        }
        self.storage.append_bundle_events(sub.bundle_id, &events, now)?;
        info!(%subscription_id, ?policy, %effective, cascaded = events.len() - 1, "subscription cancelled");
        self.get_subscription(subscription_id)
    }

    /// Withdraw a pending cancellation, along with the add-on cancellations
    /// that cascaded from it.
    pub fn uncancel(&mut self, subscription_id: SubscriptionId, ctx: &CallContext) -> Result<Subscription, EngineError> {
        let bundle_id = self.get_subscription(subscription_id)?.bundle_id;
        self.locked(bundle_id, |engine| engine.uncancel_locked(subscription_id, ctx))
    }

    fn uncancel_locked(&mut self, subscription_id: SubscriptionId, ctx: &CallContext) -> Result<Subscription, EngineError> {
        let now = self.clock.now();
        let at = ctx.requested_date.unwrap_or(now);
        let sub = self.get_subscription(subscription_id)?;
        let state = sub
            .state_at(at)
            .filter(|s| s.is_future_cancelled)
            .ok_or(EngineError::NotFutureCancelled(subscription_id))?;

        let uncancel = |id| EntitlementEvent::new(id, at, at, now, EventPayload::Uncancel, &ctx.created_by);
        let mut events = vec![uncancel(subscription_id)];
        if sub.category == ProductCategory::Base {
            for add_on in self.storage.load_subscriptions(sub.bundle_id)? {
                let cascaded = add_on.category == ProductCategory::AddOn
                    && add_on
                        .state_at(at)
                        .is_some_and(|s| s.is_future_cancelled && s.end_date == state.end_date);
                if cascaded {
                    events.push(uncancel(add_on.subscription_id));
                }
            }
        }
        self.storage.append_bundle_events(sub.bundle_id, &events, now)?;
        info!(%subscription_id, %at, "cancellation withdrawn");
        self.get_subscription(subscription_id)
    }

    pub fn set_charged_through_date(
        &mut self,
        subscription_id: SubscriptionId,
        date: Option<DateTime<Utc>>,
    ) -> Result<(), EngineError> {
        let bundle_id = self.get_subscription(subscription_id)?.bundle_id;
        self.locked(bundle_id, |engine| {
            engine.storage.set_charged_through_date(subscription_id, date)?;
            Ok(())
        })
    }

    // ---- Repair ----

    /// Validate and, unless `dry_run`, apply a bundle repair. Returns the
    /// resulting timeline: the computed one for a dry run, the stored one
    /// otherwise.
    pub fn repair(
        &mut self,
        bundle_id: BundleId,
        repair: &BundleRepair,
        dry_run: bool,
        ctx: &CallContext,
    ) -> Result<TimelineView, EngineError> {
        let result = self.locked(bundle_id, |engine| engine.repair_locked(bundle_id, repair, dry_run, ctx));
        if let Err(err) = &result {
            if let Some(code) = err.repair_code() {
                warn!(%bundle_id, code, dry_run, "repair rejected: {err}");
            }
        }
        result
    }

    fn repair_locked(
        &mut self,
        bundle_id: BundleId,
        repair: &BundleRepair,
        dry_run: bool,
        ctx: &CallContext,
    ) -> Result<TimelineView, EngineError> {
        let now = self.clock.now();
        let bundle = self
            .storage
            .get_bundle(bundle_id)?
            .ok_or(RepairError::UnknownBundle(bundle_id))?;
        let subscriptions = self.storage.load_subscriptions(bundle_id)?;
        let current_view = TimelineView::from_bundle(&bundle, &subscriptions).view_id;

        let plan = repair::plan_repair(
            &self.catalog,
            &bundle,
            &current_view,
            &subscriptions,
            repair,
            ctx,
            now,
        )?;
        if dry_run {
            debug!(%bundle_id, touched = plan.commit.subscriptions.len(), "repair dry run");
            return Ok(plan.view);
        }

        let record = self
            .storage
            .commit_repair(&plan.commit, now)
            .map_err(|e| match e {
                StorageError::ViewChanged { expected, current, .. } => EngineError::from(RepairError::ViewChanged {
                    bundle_id,
                    expected,
                    current,
                }),
                other => other.into(),
            })?;
        info!(
            %bundle_id,
            repair_id = record.repair_id,
            subscriptions = record.subscriptions.len(),
            events = record.event_count,
            "repair committed"
        );
        self.get_bundle_timeline(bundle_id)
    }

    // ---- Migration and transfer ----

    /// Import an account's bundles in one transaction. Nothing is written if
    /// any bundle is rejected.
    pub fn migrate(
        &mut self,
        migration: &AccountMigration,
        ctx: &CallContext,
    ) -> Result<Vec<SubscriptionBundle>, EngineError> {
        let now = self.clock.now();
        let account_id = migration.account_id;
        let existing = self.storage.get_bundles_for_account(account_id)?;
        let images = migration::plan_migration(&self.catalog, migration, &existing, ctx, now)?;
        self.storage
            .commit_bundles(&images, &[], now)
            .map_err(|e| key_in_use(e, account_id))?;
        info!(%account_id, bundles = images.len(), "account migrated");
        Ok(images.into_iter().map(|image| image.bundle).collect())
    }

    /// Move a bundle to another account. Returns the destination bundle.
    pub fn transfer(
        &mut self,
        request: &TransferRequest,
        ctx: &CallContext,
    ) -> Result<SubscriptionBundle, EngineError> {
        let source = self
            .storage
            .get_bundle_by_key(request.source_account, &request.bundle_key)?
            .ok_or_else(|| EngineError::BundleNotFound(request.bundle_key.clone()))?;
        let destination = request.destination_account;
        if self
            .storage
            .get_bundle_by_key(destination, &request.bundle_key)?
            .is_some()
        {
            return Err(EngineError::BundleKeyInUse {
                account_id: destination,
                key: request.bundle_key.clone(),
            });
        }

        self.locked(source.bundle_id, |engine| {
            let now = engine.clock.now();
            let subscriptions = engine.storage.load_subscriptions(source.bundle_id)?;
            let plan = transfer::plan_transfer(&source, &subscriptions, request, ctx, now)?;
            engine
                .storage
                .commit_bundles(std::slice::from_ref(&plan.image), &plan.cancels, now)
                .map_err(|e| key_in_use(e, destination))?;
            info!(
                source = %source.bundle_id,
                destination = %plan.image.bundle.bundle_id,
                subscriptions = plan.image.subscriptions.len(),
                date = %request.transfer_date,
                "bundle transferred"
            );
            Ok(plan.image.bundle)
        })
    }
}

/// The plan a subscription is on at `date`, provided it is live and has no
/// cancellation pending.
fn live_target(sub: &Subscription, date: DateTime<Utc>) -> Result<PlanTarget, EngineError> {
    let state = sub
        .state_at(date)
        .filter(|s| s.start_date <= date)
        .ok_or(EngineError::SubscriptionNotActive(sub.subscription_id))?;
    if state.is_cancelled || state.is_future_cancelled {
        return Err(EngineError::SubscriptionCancelled(sub.subscription_id));
    }
    state
        .current_target()
        .ok_or(EngineError::SubscriptionNotActive(sub.subscription_id))
}

fn policy_date(policy: ActionPolicy, sub: &Subscription, requested: DateTime<Utc>) -> DateTime<Utc> {
    match (policy, sub.charged_through_date) {
        (ActionPolicy::EndOfTerm, Some(ctd)) if ctd > requested => ctd,
        _ => requested,
    }
}

fn phase_events(
    subscription_id: SubscriptionId,
    phases: &TimedPhases,
    requested: DateTime<Utc>,
    now: DateTime<Utc>,
    created_by: &str,
) -> Vec<EntitlementEvent> {
    phases
        .upcoming
        .iter()
        .map(|p| {
            EntitlementEvent::new(
                subscription_id,
                p.start_date,
                requested,
                now,
                EventPayload::Phase {
                    phase: p.phase.name.clone(),
                },
                created_by,
            )
        })
        .collect()
}

fn key_in_use(err: StorageError, account_id: AccountId) -> EngineError {
    match err {
        StorageError::DuplicateBundleKey { key, .. } => EngineError::BundleKeyInUse { account_id, key },
        other => other.into(),
    }
}
