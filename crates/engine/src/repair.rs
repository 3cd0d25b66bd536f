//! Bundle repair.
//!
//! A repair deletes a trailing run of each edited subscription's visible
//! events and schedules new ones. Everything here is pure: the engine loads
//! the bundle, calls [`plan_repair`], and hands the resulting
//! [`RepairCommit`] to storage, which swaps it in atomically if the bundle's
//! view has not moved.
//!
//! Validation, in order:
//! 1. the view id matches the bundle's current view;
//! 2. every edited subscription belongs to the bundle;
//! 3. per subscription, deletions form a trailing run of existing events, and
//!    a re-creation starts from nothing while any other edit keeps something;
//! 4. new events are not scheduled before the base plan's or the add-on's own
//!    last remaining event;
//! 5. a re-created base plan drags every add-on into the repair, each
//!    re-created no earlier than the base;
//! 6. add-ons keep nothing at or after the base plan's first deleted event.
//!
//! New events from every subscription are then merged into one queue ordered
//! by effective date and replayed, the aligner supplying implied PHASE
//! events. Ties at one instant go to migration types, then operator events
//! before generated phases, then subscription id, then proposal order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};

use chrono::{DateTime, Utc};

use entitlement_core::{
    catalog::ProductCategory,
    events::{EntitlementEvent, EventPayload, EventType, PlanTarget},
    ids::*,
    model::{CallContext, Subscription, SubscriptionBundle},
    timeline, Catalog,
};
use entitlement_storage::{RepairCommit, RepairedSubscription};

use crate::aligner::{AlignmentContext, PlanAligner, TimedPhases};
use crate::error::{EngineError, RepairError};
use crate::timeline::{BundleRepair, NewEvent, SubscriptionTimeline, TimelineView};

/// A validated repair: the view a dry run reports and the commit a real run
/// writes.
#[derive(Debug, Clone)]
pub struct RepairPlan {
    pub view: TimelineView,
    pub commit: RepairCommit,
}

struct Working<'s> {
    sub: &'s Subscription,
    remaining: Vec<EntitlementEvent>,
    deleted: Vec<EventId>,
    first_deleted: Option<DateTime<Utc>>,
    proposed: Vec<(usize, NewEvent)>,
    recreate: bool,
    new_events: Vec<EntitlementEvent>,
}

impl Working<'_> {
    fn touched(&self) -> bool {
        !self.deleted.is_empty() || !self.proposed.is_empty()
    }

    fn last_remaining(&self) -> Option<DateTime<Utc>> {
        self.remaining.last().map(|e| e.effective_date)
    }

    fn start_date(&self) -> DateTime<Utc> {
        match self.proposed.first() {
            Some((_, first)) if self.recreate => first.effective_date,
            _ => self.sub.start_date,
        }
    }

    fn events(&self) -> Vec<EntitlementEvent> {
        self.remaining
            .iter()
            .chain(self.new_events.iter())
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Operator(NewEvent),
    Phase(String),
}

#[derive(Debug, Clone)]
struct QueueEntry {
    key: (DateTime<Utc>, u8, u8, SubscriptionId, usize),
    slot: usize,
    pending: Pending,
}

impl QueueEntry {
    fn new(slot: usize, sub: SubscriptionId, date: DateTime<Utc>, seq: usize, pending: Pending) -> Self {
        let migration = match &pending {
            Pending::Operator(e) if e.event_type.is_migration() => 0,
            _ => 1,
        };
        let generated = match pending {
            Pending::Operator(_) => 0,
            Pending::Phase(_) => 1,
        };
        Self {
            key: (date, migration, generated, sub, seq),
            slot,
            pending,
        }
    }

    fn date(&self) -> DateTime<Utc> {
        self.key.0
    }
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key.cmp(&other.key)
    }
}

/// Validate `repair` against the bundle as loaded and compute the resulting
/// event sets. `current_view` is the bundle's view at load time.
pub fn plan_repair<C: Catalog + ?Sized>(
    catalog: &C,
    bundle: &SubscriptionBundle,
    current_view: &str,
    subscriptions: &[Subscription],
    repair: &BundleRepair,
    ctx: &CallContext,
    now: DateTime<Utc>,
) -> Result<RepairPlan, EngineError> {
    let bundle_id = bundle.bundle_id;
    if repair.view_id != current_view {
        return Err(RepairError::ViewChanged {
            bundle_id,
            expected: repair.view_id.clone(),
            current: current_view.to_string(),
        }
        .into());
    }
    if subscriptions
        .iter()
        .all(|s| timeline::replay(&s.events, s.category).is_none())
    {
        return Err(RepairError::NoActiveSubscriptions(bundle_id).into());
    }

    // Group edits by subscription position so the base plan is handled first.
    let mut edits: BTreeMap<usize, (Vec<EventId>, Vec<(usize, NewEvent)>)> = BTreeMap::new();
    let mut proposal = 0usize;
    for edit in &repair.subscriptions {
        let slot = subscriptions
            .iter()
            .position(|s| s.subscription_id == edit.subscription_id)
            .ok_or(RepairError::UnknownSubscription {
                bundle_id,
                subscription_id: edit.subscription_id,
            })?;
        let entry = edits.entry(slot).or_default();
        entry.0.extend(edit.deleted_events.iter().copied());
        for event in &edit.new_events {
            entry.1.push((proposal, event.clone()));
            proposal += 1;
        }
    }

    let mut working = Vec::with_capacity(edits.len());
    for (slot, (deleted, proposed)) in edits {
        working.push(prepare(&subscriptions[slot], deleted, proposed)?);
    }

    let base_sub = subscriptions.iter().find(|s| s.category.is_base_like());
    let base = working.iter().find(|w| w.sub.category.is_base_like());
    let base_recreate = base.is_some_and(|b| b.recreate);

    // New events may not land before the base plan's surviving history, nor
    // before the subscription's own. A base plan left out of the edit set
    // survives whole.
    let last_bp_remaining = match (base, base_sub) {
        (Some(b), _) => b.last_remaining(),
        (None, Some(b)) => b.effective_events().last().map(|e| e.effective_date),
        (None, None) => None,
    };
    for w in &working {
        let own_last = w.last_remaining();
        for (_, event) in &w.proposed {
            let date = event.effective_date;
            if let Some(last) = last_bp_remaining.filter(|last| date < *last) {
                return Err(RepairError::NewEventBeforeLastBpRemaining {
                    subscription_id: w.sub.subscription_id,
                    effective_date: date,
                    last_remaining: last,
                }
                .into());
            }
            if let Some(last) = own_last.filter(|last| date < *last) {
                let subscription_id = w.sub.subscription_id;
                return Err(if w.sub.category.is_base_like() {
                    RepairError::NewEventBeforeLastBpRemaining {
                        subscription_id,
                        effective_date: date,
                        last_remaining: last,
                    }
                } else {
                    RepairError::NewEventBeforeLastAoRemaining {
                        subscription_id,
                        effective_date: date,
                        last_remaining: last,
                    }
                }
                .into());
            }
        }
    }

    let add_ons = subscriptions
        .iter()
        .filter(|s| s.category == ProductCategory::AddOn);

    if base_recreate {
        for add_on in add_ons.clone() {
            let edit = working
                .iter()
                .find(|w| w.sub.subscription_id == add_on.subscription_id)
                .ok_or(RepairError::BpRecreateMissingAo(add_on.subscription_id))?;
            if !edit.recreate {
                return Err(RepairError::BpRecreateMissingAoCreate(add_on.subscription_id).into());
            }
        }
    }

    let base_start = base
        .map(Working::start_date)
        .or(base_sub.map(|b| b.start_date));
    if let Some(base_start) = base_start {
        for w in working.iter().filter(|w| w.recreate && w.sub.category == ProductCategory::AddOn) {
            let start = w.start_date();
            if start < base_start {
                return Err(RepairError::AoCreateBeforeBpStart {
                    subscription_id: w.sub.subscription_id,
                    effective_date: start,
                    base_start,
                }
                .into());
            }
        }
    }

    if let Some(first_deleted) = base.and_then(|b| b.first_deleted) {
        for add_on in add_ons {
            let kept: Vec<EntitlementEvent> = match working
                .iter()
                .find(|w| w.sub.subscription_id == add_on.subscription_id)
            {
                Some(w) => w.remaining.clone(),
                None => add_on.effective_events(),
            };
            if let Some(late) = kept.iter().find(|e| e.effective_date >= first_deleted) {
                return Err(RepairError::MissingAoDeleteEvent {
                    subscription_id: add_on.subscription_id,
                    effective_date: late.effective_date,
                    first_deleted,
                }
                .into());
            }
        }
    }

    let bundle_start = match (base, base_sub) {
        (Some(b), _) if b.recreate => b.start_date(),
        (_, Some(b)) => b.bundle_start_date,
        _ => bundle.start_date,
    };

    let mut replay = Replay {
        aligner: PlanAligner::new(catalog),
        catalog,
        bundle_start,
        created_by: &ctx.created_by,
        requested: ctx.requested_date.unwrap_or(now),
        now,
        queue: BinaryHeap::new(),
        seq: proposal,
        next_ordering: subscriptions
            .iter()
            .map(Subscription::max_total_ordering)
            .max()
            .unwrap_or(0)
            + 1,
    };
    replay.run(&mut working)?;

    let touched: HashSet<SubscriptionId> = working
        .iter()
        .filter(|w| w.touched())
        .map(|w| w.sub.subscription_id)
        .collect();

    let view = TimelineView {
        view_id: current_view.to_string(),
        bundle_id,
        subscriptions: subscriptions
            .iter()
            .map(|s| match working.iter().find(|w| w.sub.subscription_id == s.subscription_id) {
                Some(w) if touched.contains(&s.subscription_id) => SubscriptionTimeline {
                    subscription_id: s.subscription_id,
                    category: s.category,
                    active_version: s.active_version,
                    existing_events: w.remaining.clone(),
                    deleted_events: w.deleted.clone(),
                    new_events: w.new_events.clone(),
                },
                _ => SubscriptionTimeline::current(s),
            })
            .collect(),
    };

    let commit = RepairCommit {
        bundle_id,
        expected_view: repair.view_id.clone(),
        bundle_start_date: base_recreate.then_some(bundle_start),
        subscriptions: working
            .iter()
            .filter(|w| w.touched())
            .map(|w| {
                let start = w.start_date();
                RepairedSubscription {
                    subscription_id: w.sub.subscription_id,
                    start_date: start,
                    bundle_start_date: if base_recreate { bundle_start } else { w.sub.bundle_start_date },
                    align_start_date: if w.recreate { start } else { w.sub.align_start_date },
                    events: w.events(),
                }
            })
            .collect(),
        created_by: ctx.created_by.clone(),
    };

    Ok(RepairPlan { view, commit })
}

/// Split one subscription's visible events into kept and deleted, and check
/// the shape of its new events.
fn prepare(
    sub: &Subscription,
    deleted: Vec<EventId>,
    mut proposed: Vec<(usize, NewEvent)>,
) -> Result<Working<'_>, RepairError> {
    let subscription_id = sub.subscription_id;
    let visible = sub.effective_events();
    let deleted_set: HashSet<EventId> = deleted.iter().copied().collect();
    if let Some(missing) = deleted
        .iter()
        .find(|id| !visible.iter().any(|e| e.event_id == **id))
    {
        return Err(RepairError::NonExistentDeleteEvent {
            subscription_id,
            event_id: *missing,
        });
    }

    let mut remaining = Vec::new();
    let mut first_deleted = None;
    for event in &visible {
        if deleted_set.contains(&event.event_id) {
            first_deleted.get_or_insert(event.effective_date);
        } else if first_deleted.is_some() {
            return Err(RepairError::InvalidDeleteSet {
                subscription_id,
                event_id: event.event_id,
                effective_date: event.effective_date,
            });
        } else {
            remaining.push(event.clone());
        }
    }

    proposed.sort_by_key(|(order, e)| (e.effective_date, *order));
    for (i, (_, event)) in proposed.iter().enumerate() {
        let allowed = match event.event_type {
            EventType::Create | EventType::ReCreate => i == 0,
            EventType::Change | EventType::Cancel => true,
            _ => false,
        };
        if !allowed {
            return Err(RepairError::InvalidNewEventType {
                subscription_id,
                event_type: event.event_type,
                effective_date: event.effective_date,
            });
        }
    }

    let recreate = proposed
        .first()
        .is_some_and(|(_, e)| e.event_type.is_recreation());
    match remaining.last() {
        Some(last) if recreate => {
            return Err(RepairError::SubRecreateNotEmpty {
                subscription_id,
                last_remaining: last.effective_date,
            });
        }
        None if !recreate => return Err(RepairError::SubEmpty(subscription_id)),
        _ => {}
    }

    Ok(Working {
        sub,
        remaining,
        deleted,
        first_deleted,
        proposed,
        recreate,
        new_events: Vec::new(),
    })
}

/// The merged, time-ordered replay of every subscription's new events.
struct Replay<'a, C: Catalog + ?Sized> {
    aligner: PlanAligner<'a, C>,
    catalog: &'a C,
    bundle_start: DateTime<Utc>,
    created_by: &'a str,
    requested: DateTime<Utc>,
    now: DateTime<Utc>,
    queue: BinaryHeap<Reverse<QueueEntry>>,
    seq: usize,
    /// Provisional ordering for the next new event. Storage assigns the real
    /// one at commit; until then new events must sort after kept ones.
    next_ordering: u64,
}

impl<C: Catalog + ?Sized> Replay<'_, C> {
    fn run(&mut self, working: &mut [Working<'_>]) -> Result<(), EngineError> {
        for (slot, w) in working.iter().enumerate() {
            let sub_id = w.sub.subscription_id;
            for (order, event) in &w.proposed {
                self.queue.push(Reverse(QueueEntry::new(
                    slot,
                    sub_id,
                    event.effective_date,
                    *order,
                    Pending::Operator(event.clone()),
                )));
            }
            if w.touched() && !w.recreate {
                self.seed_phases(slot, w)?;
            }
        }

        while let Some(Reverse(entry)) = self.queue.pop() {
            self.apply(entry, working)?;
        }
        Ok(())
    }

    fn alignment(&self, w: &Working<'_>) -> AlignmentContext {
        AlignmentContext {
            category: w.sub.category,
            bundle_start_date: self.bundle_start,
            align_start_date: if w.recreate { w.start_date() } else { w.sub.align_start_date },
        }
    }

    /// Phase events the kept history still owes once its tail is gone.
    fn seed_phases(&mut self, slot: usize, w: &Working<'_>) -> Result<(), EngineError> {
        let Some(last_date) = w.last_remaining() else {
            return Ok(());
        };
        let transitions = timeline::transitions(&w.remaining);
        let Some(last) = transitions.last() else {
            return Ok(());
        };
        if last.next_state == timeline::EntitlementState::Cancelled {
            return Ok(());
        }
        if let Some(phases) = self.aligner.align_transition(&self.alignment(w), last)? {
            self.schedule(slot, w.sub.subscription_id, &phases, last_date);
        }
        Ok(())
    }

    fn schedule(&mut self, slot: usize, sub_id: SubscriptionId, phases: &TimedPhases, after: DateTime<Utc>) {
        for phase in phases.upcoming.iter().filter(|p| p.start_date > after) {
            self.queue.push(Reverse(QueueEntry::new(
                slot,
                sub_id,
                phase.start_date,
                self.seq,
                Pending::Phase(phase.phase.name.clone()),
            )));
            self.seq += 1;
        }
    }

    fn drop_pending_phases(&mut self, slot: usize) {
        self.queue
            .retain(|Reverse(e)| !(e.slot == slot && matches!(e.pending, Pending::Phase(_))));
    }

    fn event(&mut self, sub_id: SubscriptionId, date: DateTime<Utc>, payload: EventPayload) -> EntitlementEvent {
        let mut event = EntitlementEvent::new(sub_id, date, self.requested, self.now, payload, self.created_by);
        event.total_ordering = self.next_ordering;
        self.next_ordering += 1;
        event
    }

    fn apply(&mut self, entry: QueueEntry, working: &mut [Working<'_>]) -> Result<(), EngineError> {
        let slot = entry.slot;
        let date = entry.date();
        let sub_id = working[slot].sub.subscription_id;
        let category = working[slot].sub.category;
        let state = timeline::replay_at(&working[slot].events(), category, date);
        let live = state
            .as_ref()
            .filter(|s| s.current_plan.is_some() && !s.is_cancelled);

        let operator = match entry.pending {
            Pending::Phase(phase) => {
                if live.is_some() {
                    let event = self.event(sub_id, date, EventPayload::Phase { phase });
                    working[slot].new_events.push(event);
                }
                return Ok(());
            }
            Pending::Operator(operator) => operator,
        };

        let invalid = |reason: &str| RepairError::InvalidTransition {
            subscription_id: sub_id,
            event_type: operator.event_type,
            effective_date: date,
            reason: reason.to_string(),
        };

        match operator.event_type {
            EventType::Create | EventType::ReCreate => {
                if live.is_some() {
                    return Err(invalid("subscription is still active").into());
                }
                let spec = operator.plan.as_ref().ok_or_else(|| invalid("no plan given"))?;
                let plan = self.catalog.find_plan(spec, date)?;
                if plan.product.category != category {
                    return Err(invalid("plan belongs to another product category").into());
                }
                let phases = self.aligner.align_on_create(
                    &self.alignment(&working[slot]),
                    &plan,
                    operator.phase_type,
                    &spec.price_list,
                    date,
                    date,
                )?;
                let target = PlanTarget::new(&plan.name, &phases.current.phase.name, &spec.price_list);
                let payload = if operator.event_type == EventType::Create {
                    EventPayload::Create(target)
                } else {
                    EventPayload::ReCreate(target)
                };
                let event = self.event(sub_id, date, payload);
                working[slot].new_events.push(event);
                self.drop_pending_phases(slot);
                self.schedule(slot, sub_id, &phases, date);
            }
            EventType::Change => {
                let current = live
                    .and_then(|s| s.current_target())
                    .ok_or_else(|| invalid("subscription is not active"))?;
                let spec = operator.plan.as_ref().ok_or_else(|| invalid("no plan given"))?;
                let plan = self.catalog.find_plan(spec, date)?;
                if plan.product.category != category {
                    return Err(invalid("plan belongs to another product category").into());
                }
                let phases = self.aligner.align_on_change(
                    &self.alignment(&working[slot]),
                    &current,
                    &plan,
                    &spec.price_list,
                    date,
                    date,
                )?;
                let target = PlanTarget::new(&plan.name, &phases.current.phase.name, &spec.price_list);
                let event = self.event(sub_id, date, EventPayload::Change(target));
                working[slot].new_events.push(event);
                self.drop_pending_phases(slot);
                self.schedule(slot, sub_id, &phases, date);
            }
            EventType::Cancel => {
                if live.is_none() {
                    return Err(invalid("subscription is not active").into());
                }
                let event = self.event(sub_id, date, EventPayload::Cancel);
                working[slot].new_events.push(event);
                self.drop_pending_phases(slot);
            }
            other => {
                return Err(RepairError::InvalidNewEventType {
                    subscription_id: sub_id,
                    event_type: other,
                    effective_date: date,
                }
                .into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::timeline::SubscriptionRepair;
    use entitlement_core::catalog::{BillingPeriod, PlanAlignment, PlanSpecifier};

    struct Fixture {
        bundle: SubscriptionBundle,
        subs: Vec<Subscription>,
    }

    impl Fixture {
        fn view(&self) -> String {
            TimelineView::from_bundle(&self.bundle, &self.subs).view_id
        }

        fn plan(&self, edits: Vec<SubscriptionRepair>) -> Result<RepairPlan, EngineError> {
            let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
            let repair = BundleRepair {
                view_id: self.view(),
                subscriptions: edits,
            };
            plan_repair(
                &catalog,
                &self.bundle,
                &self.view(),
                &self.subs,
                &repair,
                &CallContext::new("ops"),
                day(100),
            )
        }
    }

    fn bundle() -> SubscriptionBundle {
        SubscriptionBundle {
            bundle_id: BundleId::new(),
            key: "fixture".into(),
            account_id: AccountId::new(),
            start_date: day(0),
            last_system_update_time: day(0),
        }
    }

    /// Base pistol: CREATE@0 (trial), PHASE@30 (evergreen).
    fn with_base() -> Fixture {
        let bundle = bundle();
        let sub = SubscriptionId::new();
        let base = subscription(
            bundle.bundle_id,
            ProductCategory::Base,
            0,
            vec![
                stored(sub, 0, 1, create("pistol-monthly", "pistol-monthly-trial")),
                stored(sub, 30, 2, phase("pistol-monthly-evergreen")),
            ],
        );
        Fixture {
            bundle,
            subs: vec![base],
        }
    }

    fn with_add_on(mut fixture: Fixture, start: i64) -> Fixture {
        let sub = SubscriptionId::new();
        fixture.subs.push(subscription(
            fixture.bundle.bundle_id,
            ProductCategory::AddOn,
            start,
            vec![stored(
                sub,
                start,
                10,
                create("laser-scope-monthly", "laser-scope-monthly-evergreen"),
            )],
        ));
        fixture
    }

    fn shotgun() -> PlanSpecifier {
        PlanSpecifier::new("shotgun", BillingPeriod::Monthly, "DEFAULT")
    }

    fn code(result: Result<RepairPlan, EngineError>) -> Option<&'static str> {
        result.err().and_then(|e| e.repair_code())
    }

    #[test]
    fn replace_phase_with_change() -> Result<(), Box<dyn std::error::Error>> {
        let f = with_base();
        let base = &f.subs[0];
        let plan = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .delete(base.events[1].event_id)
            .add(NewEvent::change(day(30), shotgun()))])?;

        let timeline = plan.view.subscription(base.subscription_id).unwrap();
        assert_eq!(timeline.existing_events.len(), 1);
        assert_eq!(
            timeline.event_types(),
            vec![EventType::Create, EventType::Change, EventType::Phase]
        );
        // Shotgun aligned to the subscription start is in its discount phase by day 30.
        assert_eq!(
            timeline.new_events[0].payload.phase_name(),
            Some("shotgun-monthly-discount")
        );

        assert_eq!(plan.commit.subscriptions.len(), 1);
        assert_eq!(plan.commit.subscriptions[0].events.len(), 3);
        Ok(())
    }

    #[test]
    fn mid_sequence_delete_is_rejected() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id).delete(base.events[0].event_id)]);
        assert_eq!(code(result), Some("INVALID_DELETE_SET"));
    }

    #[test]
    fn unknown_delete_is_rejected() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id).delete(EventId::new())]);
        assert_eq!(code(result), Some("NON_EXISTENT_DELETE_EVENT"));
    }

    #[test]
    fn recreate_requires_empty_remaining() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .delete(base.events[1].event_id)
            .add(NewEvent::recreate(day(40), shotgun()))]);
        assert_eq!(code(result), Some("SUB_RECREATE_NOT_EMPTY"));
    }

    #[test]
    fn deleting_everything_without_recreate_is_rejected() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .delete(base.events[0].event_id)
            .delete(base.events[1].event_id)]);
        assert_eq!(code(result), Some("SUB_EMPTY"));
    }

    #[test]
    fn uncancel_is_not_a_repair_event() {
        let f = with_base();
        let base = &f.subs[0];
        let mut uncancel = NewEvent::cancel(day(40));
        uncancel.event_type = EventType::Uncancel;
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id).add(uncancel)]);
        assert_eq!(code(result), Some("INVALID_NEW_EVENT_TYPE"));
    }

    #[test]
    fn change_after_cancel_is_an_invalid_transition() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .add(NewEvent::cancel(day(40)))
            .add(NewEvent::change(day(50), shotgun()))]);
        assert_eq!(code(result), Some("INVALID_TRANSITION"));
    }

    #[test]
    fn same_instant_change_after_cancel_is_rejected() {
        let f = with_base();
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .delete(base.events[1].event_id)
            .add(NewEvent::cancel(day(0)))
            .add(NewEvent::change(day(0), shotgun()))]);
        assert_eq!(code(result), Some("INVALID_TRANSITION"));
    }

    #[test]
    fn add_on_edit_respects_unedited_base() -> Result<(), Box<dyn std::error::Error>> {
        let f = with_add_on(with_base(), 5);
        let add_on = &f.subs[1];

        // The base's last event is its PHASE on day 30.
        let early = f.plan(vec![SubscriptionRepair::new(add_on.subscription_id).add(NewEvent::cancel(day(10)))]);
        assert_eq!(code(early), Some("NEW_EVENT_BEFORE_LAST_BP_REMAINING"));

        let plan = f.plan(vec![SubscriptionRepair::new(add_on.subscription_id).add(NewEvent::cancel(day(40)))])?;
        let timeline = plan.view.subscription(add_on.subscription_id).unwrap();
        assert_eq!(timeline.event_types(), vec![EventType::Create, EventType::Cancel]);
        // Provisional ordering sorts after everything already stored.
        assert!(timeline.new_events[0].total_ordering > 10);
        Ok(())
    }

    #[test]
    fn base_recreate_requires_every_add_on() {
        let f = with_add_on(with_base(), 5);
        let base = &f.subs[0];
        let result = f.plan(vec![SubscriptionRepair::new(base.subscription_id)
            .delete(base.events[0].event_id)
            .delete(base.events[1].event_id)
            .add(NewEvent::recreate(day(0), shotgun()))]);
        assert_eq!(code(result), Some("BP_RECREATE_MISSING_AO"));
    }

    #[test]
    fn stale_view_is_rejected_first() -> Result<(), Box<dyn std::error::Error>> {
        let f = with_base();
        let catalog = TestCatalog::new(PlanAlignment::StartOfSubscription);
        let repair = BundleRepair {
            view_id: "0-0".into(),
            subscriptions: vec![],
        };
        let err = plan_repair(&catalog, &f.bundle, &f.view(), &f.subs, &repair, &CallContext::new("ops"), day(1))
            .unwrap_err();
        assert_eq!(err.repair_code(), Some("VIEW_CHANGED"));
        assert!(err.is_retryable());
        Ok(())
    }

    #[test]
    fn dropped_phase_is_seeded_back() -> Result<(), Box<dyn std::error::Error>> {
        let f = with_base();
        let base = &f.subs[0];
        let plan = f.plan(vec![SubscriptionRepair::new(base.subscription_id).delete(base.events[1].event_id)])?;
        let timeline = plan.view.subscription(base.subscription_id).unwrap();
        assert_eq!(timeline.new_events.len(), 1);
        assert_eq!(timeline.new_events[0].effective_date, day(30));
        assert_eq!(timeline.new_events[0].event_type(), EventType::Phase);
        Ok(())
    }

    #[test]
    fn operator_events_win_ties_over_generated_phases() {
        let slot = 0;
        let sub = SubscriptionId::new();
        let phase = QueueEntry::new(slot, sub, day(30), 0, Pending::Phase("p".into()));
        let cancel = QueueEntry::new(slot, sub, day(30), 9, Pending::Operator(NewEvent::cancel(day(30))));
        assert!(cancel < phase);

        let mut migrate = NewEvent::cancel(day(30));
        migrate.event_type = EventType::MigrateBilling;
        let migration = QueueEntry::new(slot, sub, day(30), 10, Pending::Operator(migrate));
        assert!(migration < cancel);
    }

    #[test]
    fn untouched_add_on_is_carried_forward() -> Result<(), Box<dyn std::error::Error>> {
        let f = with_add_on(with_base(), 5);
        let base = &f.subs[0];
        let add_on = &f.subs[1];
        let plan = f.plan(vec![SubscriptionRepair::new(base.subscription_id).add(NewEvent::cancel(day(40)))])?;
        assert_eq!(plan.commit.subscriptions.len(), 1);
        let carried = plan.view.subscription(add_on.subscription_id).unwrap();
        assert!(carried.new_events.is_empty());
        assert_eq!(carried.existing_events.len(), 1);
        Ok(())
    }
}
