//! Fixtures shared by this crate's unit tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use entitlement_core::{
    catalog::{
        ActionPolicy, BillingPeriod, Duration as PhaseDuration, Plan, PlanAlignment, PlanChangeResult,
        PlanPhase, PlanPhaseSpecifier, PlanSpecifier, PhaseType, Product, ProductCategory,
    },
    events::{EntitlementEvent, EventPayload, PlanTarget},
    ids::*,
    model::Subscription,
    Catalog, CatalogError,
};

pub fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
}

pub struct TestCatalog {
    pub alignment: PlanAlignment,
}

impl TestCatalog {
    pub fn new(alignment: PlanAlignment) -> Self {
        Self { alignment }
    }

    fn plans() -> Vec<Plan> {
        fn phase(name: &str, phase_type: PhaseType, duration: PhaseDuration) -> PlanPhase {
            PlanPhase {
                name: name.into(),
                phase_type,
                duration,
            }
        }
        fn plan(name: &str, product: &str, category: ProductCategory, phases: Vec<PlanPhase>) -> Plan {
            Plan {
                name: name.into(),
                product: Product {
                    name: product.into(),
                    category,
                },
                billing_period: BillingPeriod::Monthly,
                price_list: "DEFAULT".into(),
                phases,
            }
        }
        vec![
            plan(
                "shotgun-monthly",
                "shotgun",
                ProductCategory::Base,
                vec![
                    phase("shotgun-monthly-trial", PhaseType::Trial, PhaseDuration::days(30)),
                    phase("shotgun-monthly-discount", PhaseType::Discount, PhaseDuration::months(1)),
                    phase("shotgun-monthly-evergreen", PhaseType::Evergreen, PhaseDuration::unlimited()),
                ],
            ),
            plan(
                "pistol-monthly",
                "pistol",
                ProductCategory::Base,
                vec![
                    phase("pistol-monthly-trial", PhaseType::Trial, PhaseDuration::days(30)),
                    phase("pistol-monthly-evergreen", PhaseType::Evergreen, PhaseDuration::unlimited()),
                ],
            ),
            plan(
                "laser-scope-monthly",
                "laser-scope",
                ProductCategory::AddOn,
                vec![phase(
                    "laser-scope-monthly-evergreen",
                    PhaseType::Evergreen,
                    PhaseDuration::unlimited(),
                )],
            ),
        ]
    }
}

impl Catalog for TestCatalog {
    fn find_plan(&self, spec: &PlanSpecifier, _date: DateTime<Utc>) -> Result<Plan, CatalogError> {
        Self::plans()
            .into_iter()
            .find(|p| p.product.name == spec.product && p.billing_period == spec.billing_period)
            .ok_or_else(|| CatalogError::NoMatchingPlan {
                product: spec.product.clone(),
                billing_period: spec.billing_period.as_str().into(),
                price_list: spec.price_list.clone(),
            })
    }

    fn find_plan_by_name(&self, plan_name: &str, _date: DateTime<Utc>) -> Result<Plan, CatalogError> {
        Self::plans()
            .into_iter()
            .find(|p| p.name == plan_name)
            .ok_or_else(|| CatalogError::UnknownPlan(plan_name.into()))
    }

    fn find_phase(
        &self,
        phase_name: &str,
        _date: DateTime<Utc>,
        _subscription_start: DateTime<Utc>,
    ) -> Result<PlanPhase, CatalogError> {
        Self::plans()
            .into_iter()
            .flat_map(|p| p.phases)
            .find(|p| p.name == phase_name)
            .ok_or_else(|| CatalogError::UnknownPhase(phase_name.into()))
    }

    fn plan_cancel_policy(
        &self,
        _current: &PlanPhaseSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<ActionPolicy, CatalogError> {
        Ok(ActionPolicy::Immediate)
    }

    fn plan_change(
        &self,
        _from: &PlanPhaseSpecifier,
        to: &PlanSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<PlanChangeResult, CatalogError> {
        Ok(PlanChangeResult {
            policy: ActionPolicy::Immediate,
            alignment: self.alignment,
            new_price_list: to.price_list.clone(),
        })
    }

    fn plan_creation_alignment(
        &self,
        _spec: &PlanSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<PlanAlignment, CatalogError> {
        Ok(self.alignment)
    }
}

/// A persisted-looking event with an explicit ordering.
pub fn stored(
    sub: SubscriptionId,
    effective: i64,
    ordering: u64,
    payload: EventPayload,
) -> EntitlementEvent {
    let mut e = EntitlementEvent::new(sub, day(effective), day(0), day(0), payload, "test");
    e.total_ordering = ordering;
    e.active_version = 1;
    e.from_disk = true;
    e
}

pub fn create(plan: &str, phase: &str) -> EventPayload {
    EventPayload::Create(PlanTarget::new(plan, phase, "DEFAULT"))
}

pub fn phase(name: &str) -> EventPayload {
    EventPayload::Phase { phase: name.into() }
}

pub fn subscription(
    bundle_id: BundleId,
    category: ProductCategory,
    start: i64,
    events: Vec<EntitlementEvent>,
) -> Subscription {
    Subscription {
        subscription_id: events
            .first()
            .map(|e| e.subscription_id)
            .unwrap_or_default(),
        bundle_id,
        category,
        start_date: day(start),
        bundle_start_date: day(0),
        align_start_date: day(start),
        charged_through_date: None,
        active_version: 1,
        events,
    }
}
