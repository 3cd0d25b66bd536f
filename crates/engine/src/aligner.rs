//! Phase alignment.
//!
//! Given a plan and an anchor date, the aligner lays the plan's phases end to
//! end and reports which phase is in force at the effective date and which
//! ones are still ahead. The anchor comes from the catalog's alignment policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use entitlement_core::{
    catalog::{Plan, PlanAlignment, PlanPhase, PlanPhaseSpecifier, PlanSpecifier, PhaseType, ProductCategory},
    events::{EventPayload, EventType, PlanTarget},
    timeline::SubscriptionTransition,
    Catalog, CatalogError, CoreError,
};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedPhase {
    pub plan: String,
    pub phase: PlanPhase,
    pub start_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedPhases {
    /// Phase in force at the effective date.
    pub current: TimedPhase,
    /// Phases after `current`, nearest first. Ends at the first unlimited phase.
    pub upcoming: Vec<TimedPhase>,
}

impl TimedPhases {
    pub fn next(&self) -> Option<&TimedPhase> {
        self.upcoming.first()
    }
}

/// Dates a subscription's phases may be anchored to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignmentContext {
    pub category: ProductCategory,
    pub bundle_start_date: DateTime<Utc>,
    pub align_start_date: DateTime<Utc>,
}

/// One externally supplied snapshot of a subscription's past: the plan and
/// phase it was on from `effective_date` until `end_date`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCase {
    pub plan: String,
    pub phase_type: PhaseType,
    pub price_list: String,
    pub effective_date: DateTime<Utc>,
    /// Must equal the next case's start; on the last case it is a cancellation.
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedMigrationEvent {
    pub effective_date: DateTime<Utc>,
    pub payload: EventPayload,
}

impl TimedMigrationEvent {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

pub struct PlanAligner<'a, C: Catalog + ?Sized> {
    catalog: &'a C,
}

impl<'a, C: Catalog + ?Sized> PlanAligner<'a, C> {
    pub fn new(catalog: &'a C) -> Self {
        Self { catalog }
    }

    /// Phases of a newly created subscription. With an explicit initial
    /// phase type the earlier phases are skipped and the timeline starts at
    /// the effective date.
    pub fn align_on_create(
        &self,
        ctx: &AlignmentContext,
        plan: &Plan,
        initial_phase: Option<PhaseType>,
        price_list: &str,
        requested_date: DateTime<Utc>,
        effective_date: DateTime<Utc>,
    ) -> Result<TimedPhases, EngineError> {
        let (from, anchor) = match initial_phase {
            Some(phase_type) => {
                let index = plan.phase_of_type(phase_type).ok_or_else(|| {
                    CatalogError::UnknownPhase(format!("{} {}", plan.name, phase_type.as_str()))
                })?;
                (index, effective_date)
            }
            None => {
                let spec = PlanSpecifier::new(&plan.product.name, plan.billing_period, price_list);
                let alignment = self.catalog.plan_creation_alignment(&spec, requested_date)?;
                let anchor = match alignment {
                    PlanAlignment::StartOfBundle => ctx.bundle_start_date,
                    _ => ctx.align_start_date,
                };
                debug!(plan = %plan.name, ?alignment, %anchor, "creation alignment");
                (0, anchor)
            }
        };
        split_at(phase_chain(plan, from, anchor)?, effective_date)
    }

    /// Phases of `new_plan` after a change away from `current`.
    pub fn align_on_change(
        &self,
        ctx: &AlignmentContext,
        current: &PlanTarget,
        new_plan: &Plan,
        new_price_list: &str,
        requested_date: DateTime<Utc>,
        effective_date: DateTime<Utc>,
    ) -> Result<TimedPhases, EngineError> {
        let from = self.phase_specifier(current, requested_date)?;
        let to = PlanSpecifier::new(&new_plan.product.name, new_plan.billing_period, new_price_list);
        let change = self.catalog.plan_change(&from, &to, requested_date)?;
        let anchor = match change.alignment {
            PlanAlignment::StartOfBundle => ctx.bundle_start_date,
            PlanAlignment::StartOfSubscription => ctx.align_start_date,
            PlanAlignment::ChangeOfPlan => effective_date,
            PlanAlignment::ChangeOfPriceList if current.price_list != new_price_list => effective_date,
            PlanAlignment::ChangeOfPriceList => ctx.align_start_date,
        };
        debug!(from = %current.plan, to = %new_plan.name, alignment = ?change.alignment, %anchor, "change alignment");
        split_at(phase_chain(new_plan, 0, anchor)?, effective_date)
    }

    /// The phase following `current_phase` of `plan`, when that phase began at
    /// `phase_start` and the next one starts after `after`.
    ///
    /// Public entry point for callers that track one phase at a time, such
    /// as billing. The engine itself writes whole phase chains and re-seeds
    /// them with [`Self::align_transition`].
    pub fn align_next_phase(
        &self,
        plan: &Plan,
        current_phase: &str,
        phase_start: DateTime<Utc>,
        after: DateTime<Utc>,
    ) -> Result<Option<TimedPhase>, EngineError> {
        let index = plan
            .phase_index(current_phase)
            .ok_or_else(|| CatalogError::UnknownPhase(current_phase.to_string()))?;
        Ok(phase_chain(plan, index, phase_start)?
            .into_iter()
            .skip(1)
            .find(|p| p.start_date > after))
    }

    /// Rebuild the phases a recorded transition put in motion. Used to find
    /// the phase events still owed after a repair cut a history short.
    pub fn align_transition(
        &self,
        ctx: &AlignmentContext,
        transition: &SubscriptionTransition,
    ) -> Result<Option<TimedPhases>, EngineError> {
        let Some(target) = transition.next.as_ref() else {
            return Ok(None);
        };
        let date = transition.effective_date;
        let plan = self.catalog.find_plan_by_name(&target.plan, date)?;

        let aligned = match (transition.event_type, transition.previous.as_ref()) {
            (EventType::Phase, _) => None,
            (EventType::Change, Some(previous)) => {
                Some(self.align_on_change(ctx, previous, &plan, &target.price_list, date, date)?)
            }
            (EventType::Change, None) => None,
            _ => Some(self.align_on_create(ctx, &plan, None, &target.price_list, date, date)?),
        };

        // A phase entered by a PHASE event, or one that does not match the
        // recomputed alignment, started exactly at the transition.
        match aligned {
            Some(phases) if phases.current.phase.name == target.phase => Ok(Some(phases)),
            _ => {
                let index = plan
                    .phase_index(&target.phase)
                    .ok_or_else(|| CatalogError::UnknownPhase(target.phase.clone()))?;
                split_at(phase_chain(&plan, index, date)?, date).map(Some)
            }
        }
    }

    /// Synthesize the event history described by migration cases, oldest
    /// first. Catalog lookups use `now`.
    pub fn align_migration(
        &self,
        cases: &[MigrationCase],
        now: DateTime<Utc>,
    ) -> Result<Vec<TimedMigrationEvent>, EngineError> {
        let mut cases = cases.to_vec();
        cases.sort_by_key(|c| c.effective_date);
        let Some(last) = cases.last().cloned() else {
            return Err(EngineError::InvalidMigration("no migration cases".into()));
        };
        for pair in cases.windows(2) {
            if pair[0].end_date != Some(pair[1].effective_date) {
                return Err(EngineError::InvalidMigration(format!(
                    "case on {} starting {} does not end where the next case starts",
                    pair[0].plan, pair[0].effective_date
                )));
            }
        }

        let mut out = Vec::with_capacity(cases.len() + 2);
        let mut previous_plan: Option<String> = None;
        let mut last_plan = None;
        for case in &cases {
            let plan = self.catalog.find_plan_by_name(&case.plan, now)?;
            let index = plan.phase_of_type(case.phase_type).ok_or_else(|| {
                CatalogError::UnknownPhase(format!("{} {}", plan.name, case.phase_type.as_str()))
            })?;
            let target = PlanTarget::new(&plan.name, &plan.phases[index].name, &case.price_list);
            let payload = match previous_plan.as_deref() {
                None => EventPayload::MigrateEntitlement(target),
                Some(name) if name == plan.name => EventPayload::Phase { phase: target.phase },
                Some(_) => EventPayload::Change(target),
            };
            out.push(TimedMigrationEvent {
                effective_date: case.effective_date,
                payload,
            });
            previous_plan = Some(plan.name.clone());
            last_plan = Some((plan, index));
        }

        match (last.end_date, last_plan) {
            (Some(cancelled), _) => out.push(TimedMigrationEvent {
                effective_date: cancelled,
                payload: EventPayload::Cancel,
            }),
            (None, Some((plan, index))) => {
                // The open case continues into the plan's later phases.
                let phases = phase_chain(&plan, index, last.effective_date)?;
                out.extend(phases.into_iter().skip(1).map(|p| TimedMigrationEvent {
                    effective_date: p.start_date,
                    payload: EventPayload::Phase { phase: p.phase.name },
                }));
            }
            (None, None) => {}
        }
        Ok(out)
    }

    /// Catalog position of a recorded plan target.
    pub fn phase_specifier(
        &self,
        target: &PlanTarget,
        date: DateTime<Utc>,
    ) -> Result<PlanPhaseSpecifier, EngineError> {
        let plan = self.catalog.find_plan_by_name(&target.plan, date)?;
        let phase = plan
            .phase(&target.phase)
            .ok_or_else(|| CatalogError::UnknownPhase(target.phase.clone()))?;
        Ok(PlanPhaseSpecifier {
            plan_name: plan.name.clone(),
            product: plan.product.name.clone(),
            category: plan.product.category,
            billing_period: plan.billing_period,
            price_list: target.price_list.clone(),
            phase_type: phase.phase_type,
        })
    }
}

/// Lay out `plan`'s phases from index `from`, the first one starting at
/// `anchor`. Stops after the first unlimited phase.
fn phase_chain(plan: &Plan, from: usize, anchor: DateTime<Utc>) -> Result<Vec<TimedPhase>, EngineError> {
    let phases = plan.phases.get(from..).unwrap_or(&[]);
    if phases.is_empty() {
        return Err(CatalogError::UnknownPhase(format!("{} has no phase #{from}", plan.name)).into());
    }
    let mut out = Vec::with_capacity(phases.len());
    let mut start = anchor;
    for phase in phases {
        out.push(TimedPhase {
            plan: plan.name.clone(),
            phase: phase.clone(),
            start_date: start,
        });
        if phase.duration.is_unlimited() {
            break;
        }
        start = phase.duration.add_to(start).ok_or_else(|| {
            CoreError::InvalidData(format!("phase {} ends beyond the calendar", phase.name))
        })?;
    }
    Ok(out)
}

fn split_at(mut chain: Vec<TimedPhase>, effective_date: DateTime<Utc>) -> Result<TimedPhases, EngineError> {
    let at = chain
        .iter()
        .rposition(|p| p.start_date <= effective_date)
        .unwrap_or(0);
    let mut rest = chain.split_off(at);
    if rest.is_empty() {
        return Err(CoreError::InvalidData("empty phase timeline".into()).into());
    }
    let current = rest.remove(0);
    Ok(TimedPhases { current, upcoming: rest })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{day, TestCatalog};
    use chrono::TimeZone;

    fn ctx(bundle_start: i64, align_start: i64) -> AlignmentContext {
        AlignmentContext {
            category: ProductCategory::Base,
            bundle_start_date: day(bundle_start),
            align_start_date: day(align_start),
        }
    }

    #[test]
    fn create_lays_out_every_phase() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let shotgun = catalog.find_plan_by_name("shotgun-monthly", day(0))?;

        let phases = aligner.align_on_create(&ctx(0, 0), &shotgun, None, "DEFAULT", day(0), day(0))?;
        assert_eq!(phases.current.phase.name, "shotgun-monthly-trial");
        assert_eq!(phases.next().map(|p| p.start_date), Some(day(30)));
        assert_eq!(phases.upcoming.len(), 2);
        // 2024-01-31 plus one month clamps to the end of February.
        assert_eq!(
            phases.upcoming[1].start_date,
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).unwrap()
        );
        Ok(())
    }

    #[test]
    fn bundle_alignment_uses_bundle_start() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfBundle);
        let aligner = PlanAligner::new(&catalog);
        let pistol = catalog.find_plan_by_name("pistol-monthly", day(0))?;

        let phases = aligner.align_on_create(&ctx(0, 10), &pistol, None, "DEFAULT", day(10), day(10))?;
        assert_eq!(phases.current.phase.name, "pistol-monthly-trial");
        assert_eq!(phases.next().map(|p| p.start_date), Some(day(30)));
        Ok(())
    }

    #[test]
    fn explicit_initial_phase_skips_earlier_phases() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let shotgun = catalog.find_plan_by_name("shotgun-monthly", day(0))?;

        let phases = aligner.align_on_create(
            &ctx(0, 0),
            &shotgun,
            Some(PhaseType::Evergreen),
            "DEFAULT",
            day(5),
            day(5),
        )?;
        assert_eq!(phases.current.phase.name, "shotgun-monthly-evergreen");
        assert!(phases.next().is_none());
        Ok(())
    }

    #[test]
    fn change_aligned_to_subscription_start() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let pistol = catalog.find_plan_by_name("pistol-monthly", day(0))?;
        let current = PlanTarget::new("shotgun-monthly", "shotgun-monthly-trial", "DEFAULT");

        let at_30 = aligner.align_on_change(&ctx(0, 0), &current, &pistol, "DEFAULT", day(30), day(30))?;
        assert_eq!(at_30.current.phase.name, "pistol-monthly-evergreen");
        assert!(at_30.next().is_none());

        let at_10 = aligner.align_on_change(&ctx(0, 0), &current, &pistol, "DEFAULT", day(10), day(10))?;
        assert_eq!(at_10.current.phase.name, "pistol-monthly-trial");
        assert_eq!(at_10.next().map(|p| p.start_date), Some(day(30)));
        Ok(())
    }

    #[test]
    fn change_of_plan_restarts_phases() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::ChangeOfPlan);
        let aligner = PlanAligner::new(&catalog);
        let pistol = catalog.find_plan_by_name("pistol-monthly", day(0))?;
        let current = PlanTarget::new("shotgun-monthly", "shotgun-monthly-evergreen", "DEFAULT");

        let phases = aligner.align_on_change(&ctx(0, 0), &current, &pistol, "DEFAULT", day(40), day(40))?;
        assert_eq!(phases.current.start_date, day(40));
        assert_eq!(phases.next().map(|p| p.start_date), Some(day(70)));
        Ok(())
    }

    #[test]
    fn next_phase_is_none_when_terminal() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let pistol = catalog.find_plan_by_name("pistol-monthly", day(0))?;

        let next = aligner.align_next_phase(&pistol, "pistol-monthly-trial", day(0), day(0))?;
        assert_eq!(next.map(|p| p.start_date), Some(day(30)));
        assert!(aligner.align_next_phase(&pistol, "pistol-monthly-evergreen", day(30), day(30))?.is_none());
        Ok(())
    }

    #[test]
    fn unknown_plan_propagates() {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let current = PlanTarget::new("bazooka", "bazooka-trial", "DEFAULT");
        let pistol = catalog.find_plan_by_name("pistol-monthly", day(0)).unwrap();
        let err = aligner
            .align_on_change(&ctx(0, 0), &current, &pistol, "DEFAULT", day(1), day(1))
            .unwrap_err();
        assert!(matches!(err, EngineError::Catalog(CatalogError::UnknownPlan(_))));
    }

    #[test]
    fn migration_cases_become_events() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let cases = vec![
            MigrationCase {
                plan: "pistol-monthly".into(),
                phase_type: PhaseType::Evergreen,
                price_list: "DEFAULT".into(),
                effective_date: day(20),
                end_date: Some(day(50)),
            },
            MigrationCase {
                plan: "pistol-monthly".into(),
                phase_type: PhaseType::Trial,
                price_list: "DEFAULT".into(),
                effective_date: day(0),
                end_date: Some(day(20)),
            },
        ];

        let events = aligner.align_migration(&cases, day(60))?;
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::MigrateEntitlement, EventType::Phase, EventType::Cancel]);
        assert_eq!(events[0].effective_date, day(0));
        assert_eq!(events[2].effective_date, day(50));
        Ok(())
    }

    #[test]
    fn open_migration_case_continues_into_later_phases() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let cases = vec![
            MigrationCase {
                plan: "shotgun-monthly".into(),
                phase_type: PhaseType::Trial,
                price_list: "DEFAULT".into(),
                effective_date: day(0),
                end_date: Some(day(10)),
            },
            MigrationCase {
                plan: "pistol-monthly".into(),
                phase_type: PhaseType::Trial,
                price_list: "DEFAULT".into(),
                effective_date: day(10),
                end_date: None,
            },
        ];

        let events = aligner.align_migration(&cases, day(60))?;
        let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::MigrateEntitlement, EventType::Change, EventType::Phase]);
        assert_eq!(events[2].effective_date, day(40));
        Ok(())
    }

    #[test]
    fn gapped_migration_cases_are_rejected() {
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let aligner = PlanAligner::new(&catalog);
        let cases = vec![
            MigrationCase {
                plan: "pistol-monthly".into(),
                phase_type: PhaseType::Trial,
                price_list: "DEFAULT".into(),
                effective_date: day(0),
                end_date: Some(day(15)),
            },
            MigrationCase {
                plan: "pistol-monthly".into(),
                phase_type: PhaseType::Evergreen,
                price_list: "DEFAULT".into(),
                effective_date: day(20),
                end_date: None,
            },
        ];
        assert!(matches!(
            aligner.align_migration(&cases, day(60)),
            Err(EngineError::InvalidMigration(_))
        ));
    }
}
