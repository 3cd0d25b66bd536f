//! Import of externally managed subscriptions.
//!
//! Each subscription arrives as a list of contiguous [`MigrationCase`]s. The
//! aligner turns them into MIGRATE_ENTITLEMENT / CHANGE / PHASE / CANCEL
//! events; a MIGRATE_BILLING marker is added at the charged-through date. The
//! result is a set of [`BundleImage`]s the storage layer writes in one
//! transaction.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entitlement_core::{
    catalog::ProductCategory,
    events::{EntitlementEvent, EventPayload},
    ids::*,
    model::{CallContext, Subscription, SubscriptionBundle},
    timeline, Catalog,
};
use entitlement_storage::BundleImage;

use crate::aligner::{MigrationCase, PlanAligner};
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMigration {
    pub account_id: AccountId,
    pub bundles: Vec<BundleMigration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMigration {
    pub key: String,
    pub subscriptions: Vec<SubscriptionMigration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionMigration {
    pub category: ProductCategory,
    pub cases: Vec<MigrationCase>,
    pub charged_through_date: Option<DateTime<Utc>>,
}

impl SubscriptionMigration {
    fn first_case_date(&self) -> Option<DateTime<Utc>> {
        self.cases.iter().map(|c| c.effective_date).min()
    }
}

/// Build the bundles described by `migration`. `existing` are the account's
/// bundles already in storage; a key clash with one of them, or within the
/// migration itself, rejects the whole import.
pub fn plan_migration<C: Catalog + ?Sized>(
    catalog: &C,
    migration: &AccountMigration,
    existing: &[SubscriptionBundle],
    ctx: &CallContext,
    now: DateTime<Utc>,
) -> Result<Vec<BundleImage>, EngineError> {
    let account_id = migration.account_id;
    let mut keys: HashSet<&str> = existing.iter().map(|b| b.key.as_str()).collect();
    for bundle in &migration.bundles {
        if !keys.insert(bundle.key.as_str()) {
            return Err(EngineError::BundleKeyInUse {
                account_id,
                key: bundle.key.clone(),
            });
        }
    }

    let aligner = PlanAligner::new(catalog);
    let requested = ctx.requested_date.unwrap_or(now);
    migration
        .bundles
        .iter()
        .map(|bundle| plan_bundle(catalog, &aligner, account_id, bundle, requested, &ctx.created_by, now))
        .collect()
}

fn plan_bundle<C: Catalog + ?Sized>(
    catalog: &C,
    aligner: &PlanAligner<'_, C>,
    account_id: AccountId,
    migration: &BundleMigration,
    requested: DateTime<Utc>,
    created_by: &str,
    now: DateTime<Utc>,
) -> Result<BundleImage, EngineError> {
    let mut ordered: Vec<&SubscriptionMigration> = migration.subscriptions.iter().collect();
    ordered.sort_by_key(|s| (!s.category.is_base_like(), s.first_case_date()));

    let bundle_id = BundleId::new();
    let mut bundle_start = None;
    let mut subscriptions = Vec::with_capacity(ordered.len());

    for sub in ordered {
        for case in &sub.cases {
            let plan = catalog.find_plan_by_name(&case.plan, now)?;
            if plan.product.category != sub.category {
                return Err(EngineError::CategoryMismatch {
                    plan: plan.name,
                    expected: sub.category.as_str(),
                    found: plan.product.category.as_str(),
                });
            }
        }

        let subscription_id = SubscriptionId::new();
        let mut events: Vec<EntitlementEvent> = aligner
            .align_migration(&sub.cases, now)?
            .into_iter()
            .map(|e| EntitlementEvent::new(subscription_id, e.effective_date, requested, now, e.payload, created_by))
            .collect();
        let start = events
            .first()
            .map(|e| e.effective_date)
            .ok_or_else(|| EngineError::InvalidMigration(format!("bundle {} has an empty subscription", migration.key)))?;

        if sub.category.is_base_like() {
            bundle_start.get_or_insert(start);
        }
        let Some(bundle_start_date) = bundle_start else {
            return Err(EngineError::InvalidMigration(format!(
                "bundle {} has add-ons but no base subscription",
                migration.key
            )));
        };

        if let Some(ctd) = sub.charged_through_date {
            if let Some(billing) = billing_marker(&events, sub.category, start, ctd) {
                let event = EntitlementEvent::new(subscription_id, ctd, requested, now, billing, created_by);
                let at = events.partition_point(|e| e.effective_date < ctd);
                events.insert(at, event);
            }
        }

        subscriptions.push(Subscription {
            subscription_id,
            bundle_id,
            category: sub.category,
            start_date: start,
            bundle_start_date,
            align_start_date: start,
            charged_through_date: sub.charged_through_date,
            active_version: 1,
            events,
        });
    }

    let Some(start_date) = bundle_start else {
        return Err(EngineError::InvalidMigration(format!(
            "bundle {} has no subscriptions",
            migration.key
        )));
    };
    Ok(BundleImage {
        bundle: SubscriptionBundle {
            bundle_id,
            key: migration.key.clone(),
            account_id,
            start_date,
            last_system_update_time: now,
        },
        subscriptions,
    })
}

/// MIGRATE_BILLING payload for a charged-through date, or `None` when billing
/// has nothing to pick up there.
fn billing_marker(
    events: &[EntitlementEvent],
    category: ProductCategory,
    start: DateTime<Utc>,
    charged_through: DateTime<Utc>,
) -> Option<EventPayload> {
    if charged_through < start {
        return None;
    }
    let state = timeline::replay_at(events, category, charged_through)?;
    if state.end_date.is_some_and(|end| end <= charged_through) {
        return None;
    }
    state.last_active_target().cloned().map(EventPayload::MigrateBilling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{day, TestCatalog};
    use entitlement_core::{
        catalog::{PhaseType, PlanAlignment},
        events::EventType,
    };

    fn case(plan: &str, phase_type: PhaseType, from: i64, to: Option<i64>) -> MigrationCase {
        MigrationCase {
            plan: plan.into(),
            phase_type,
            price_list: "DEFAULT".into(),
            effective_date: day(from),
            end_date: to.map(day),
        }
    }

    fn account(bundles: Vec<BundleMigration>) -> AccountMigration {
        AccountMigration {
            account_id: AccountId::new(),
            bundles,
        }
    }

    fn base(cases: Vec<MigrationCase>, ctd: Option<i64>) -> SubscriptionMigration {
        SubscriptionMigration {
            category: ProductCategory::Base,
            cases,
            charged_through_date: ctd.map(day),
        }
    }

    #[test]
    fn base_with_add_on_builds_one_bundle() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let migration = account(vec![BundleMigration {
            key: "legacy-1".into(),
            subscriptions: vec![
                SubscriptionMigration {
                    category: ProductCategory::AddOn,
                    cases: vec![case("laser-scope-monthly", PhaseType::Evergreen, 20, None)],
                    charged_through_date: None,
                },
                base(vec![case("pistol-monthly", PhaseType::Evergreen, 10, None)], Some(40)),
            ],
        }]);

        let images = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(50))?;
        assert_eq!(images.len(), 1);
        let image = &images[0];
        assert_eq!(image.bundle.start_date, day(10));
        assert_eq!(image.subscriptions[0].category, ProductCategory::Base);
        assert_eq!(image.subscriptions[1].bundle_start_date, day(10));

        let types: Vec<EventType> = image.subscriptions[0].events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::MigrateEntitlement, EventType::MigrateBilling]);
        assert_eq!(image.subscriptions[0].events[1].effective_date, day(40));
        Ok(())
    }

    #[test]
    fn billing_marker_precedes_same_instant_events() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let migration = account(vec![BundleMigration {
            key: "legacy-2".into(),
            subscriptions: vec![base(
                vec![
                    case("pistol-monthly", PhaseType::Trial, 0, Some(30)),
                    case("pistol-monthly", PhaseType::Evergreen, 30, None),
                ],
                Some(30),
            )],
        }]);

        let images = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(50))?;
        let events = &images[0].subscriptions[0].events;
        assert_eq!(events[1].event_type(), EventType::MigrateBilling);
        assert_eq!(events[2].event_type(), EventType::Phase);
        assert_eq!(events[1].effective_date, events[2].effective_date);
        Ok(())
    }

    #[test]
    fn no_billing_marker_after_cancellation() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let migration = account(vec![BundleMigration {
            key: "legacy-3".into(),
            subscriptions: vec![base(vec![case("pistol-monthly", PhaseType::Evergreen, 0, Some(20))], Some(25))],
        }]);

        let images = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(50))?;
        let types: Vec<EventType> = images[0].subscriptions[0].events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::MigrateEntitlement, EventType::Cancel]);
        Ok(())
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let bundle = BundleMigration {
            key: "dup".into(),
            subscriptions: vec![base(vec![case("pistol-monthly", PhaseType::Evergreen, 0, None)], None)],
        };
        let migration = account(vec![bundle.clone(), bundle]);
        let err = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(5)).unwrap_err();
        assert_eq!(err.code(), "BUNDLE_KEY_IN_USE");
    }

    #[test]
    fn add_on_without_base_is_rejected() {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let migration = account(vec![BundleMigration {
            key: "orphan".into(),
            subscriptions: vec![SubscriptionMigration {
                category: ProductCategory::AddOn,
                cases: vec![case("laser-scope-monthly", PhaseType::Evergreen, 0, None)],
                charged_through_date: None,
            }],
        }]);
        let err = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(5)).unwrap_err();
        assert_eq!(err.code(), "INVALID_MIGRATION");
    }

    #[test]
    fn plan_category_must_match() {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let migration = account(vec![BundleMigration {
            key: "wrong".into(),
            subscriptions: vec![base(vec![case("laser-scope-monthly", PhaseType::Evergreen, 0, None)], None)],
        }]);
        let err = plan_migration(&catalog, &migration, &[], &CallContext::new("import"), day(5)).unwrap_err();
        assert_eq!(err.code(), "CATEGORY_MISMATCH");
    }
}
