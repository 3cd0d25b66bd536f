//! Subscription state as a pure projection of its event sequence.
//!
//! Events are folded left to right in `(effective_date, total_ordering)`
//! order. Nothing here reads a clock or a catalog: the same events always
//! produce the same state.
//!
//! Two kinds of event lose their effect to a later-recorded event:
//! - a PHASE or CHANGE scheduled strictly after the effective date of a CHANGE
//!   recorded after it (the change replaced the plan it was computed for);
//! - a CANCEL whose effective date is not before an UNCANCEL recorded after it.
//!
//! Superseded events stay in storage but are skipped by the fold and hidden
//! from timeline views.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::ProductCategory;
use crate::events::{EntitlementEvent, EventPayload, EventType, PlanTarget};
use crate::ids::EventId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementState {
    Active,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTransition {
    pub event_id: EventId,
    pub event_type: EventType,
    pub effective_date: DateTime<Utc>,
    pub total_ordering: u64,
    pub previous: Option<PlanTarget>,
    pub next: Option<PlanTarget>,
    pub next_state: EntitlementState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionState {
    pub category: ProductCategory,
    pub current_plan: Option<String>,
    pub current_phase: Option<String>,
    pub current_price_list: Option<String>,
    pub is_cancelled: bool,
    pub is_future_cancelled: bool,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub previous_transition: Option<SubscriptionTransition>,
    pub pending_transition: Option<SubscriptionTransition>,
}

impl SubscriptionState {
    /// Plan, phase and price list in force, if any.
    pub fn current_target(&self) -> Option<PlanTarget> {
        Some(PlanTarget {
            plan: self.current_plan.clone()?,
            phase: self.current_phase.clone()?,
            price_list: self.current_price_list.clone()?,
        })
    }

    /// The plan in force, or the one in force just before cancellation.
    pub fn last_active_target(&self) -> Option<&PlanTarget> {
        let previous = self.previous_transition.as_ref()?;
        previous.next.as_ref().or(previous.previous.as_ref())
    }
}

/// Ids of events whose effect was cancelled by a later-recorded event.
pub fn superseded(events: &[EntitlementEvent]) -> HashSet<EventId> {
    let mut out = HashSet::new();
    for e in events {
        let hit = match e.event_type() {
            EventType::Phase | EventType::Change => events.iter().any(|c| {
                c.event_type() == EventType::Change
                    && c.total_ordering > e.total_ordering
                    && c.effective_date < e.effective_date
            }),
            EventType::Cancel => events.iter().any(|u| {
                u.event_type() == EventType::Uncancel
                    && u.total_ordering > e.total_ordering
                    && u.effective_date <= e.effective_date
            }),
            _ => false,
        };
        if hit {
            out.insert(e.event_id);
        }
    }
    out
}

/// Visible, non-superseded events in timeline order.
pub fn effective_events(events: &[EntitlementEvent]) -> Vec<EntitlementEvent> {
    let dead = superseded(events);
    let mut visible: Vec<EntitlementEvent> = events
        .iter()
        .filter(|e| !dead.contains(&e.event_id))
        .cloned()
        .collect();
    visible.sort();
    visible
}

/// Full transition history. UNCANCEL and MIGRATE_BILLING leave no transition
/// of their own; events that make no sense in the current state (a CHANGE
/// before any creation, anything after a CANCEL other than a re-creation) are
/// skipped.
pub fn transitions(events: &[EntitlementEvent]) -> Vec<SubscriptionTransition> {
    let mut out = Vec::new();
    let mut current: Option<PlanTarget> = None;
    let mut cancelled = false;

    for e in effective_events(events) {
        let live = current.is_some() && !cancelled;
        let step = match &e.payload {
            EventPayload::Create(t)
            | EventPayload::ReCreate(t)
            | EventPayload::Transfer(t)
            | EventPayload::MigrateEntitlement(t) => Some((Some(t.clone()), EntitlementState::Active)),
            EventPayload::Change(t) if live => Some((Some(t.clone()), EntitlementState::Active)),
            EventPayload::Phase { phase } if live => {
                let next = current.as_ref().map(|c| PlanTarget {
                    phase: phase.clone(),
                    ..c.clone()
                });
                Some((next, EntitlementState::Active))
            }
            EventPayload::Cancel if live => Some((None, EntitlementState::Cancelled)),
            _ => None,
        };

        let Some((next, next_state)) = step else {
            continue;
        };
        let previous = if cancelled { None } else { current.clone() };
        out.push(SubscriptionTransition {
            event_id: e.event_id,
            event_type: e.event_type(),
            effective_date: e.effective_date,
            total_ordering: e.total_ordering,
            previous: previous.clone(),
            next: next.clone(),
            next_state,
        });

        match next_state {
            EntitlementState::Active => {
                current = next;
                cancelled = false;
            }
            EntitlementState::Cancelled => {
                current = previous;
                cancelled = true;
            }
        }
    }
    out
}

/// Final state after every event has been applied.
pub fn replay(events: &[EntitlementEvent], category: ProductCategory) -> Option<SubscriptionState> {
    replay_at(events, category, DateTime::<Utc>::MAX_UTC)
}

/// State as of `as_of`. `None` when the sequence holds no creation at all.
pub fn replay_at(
    events: &[EntitlementEvent],
    category: ProductCategory,
    as_of: DateTime<Utc>,
) -> Option<SubscriptionState> {
    let all = transitions(events);
    let starts: Vec<usize> = all
        .iter()
        .enumerate()
        .filter(|(_, t)| t.event_type.starts_subscription())
        .map(|(i, _)| i)
        .collect();
    let first_start = *starts.first()?;
    let era_start = starts
        .iter()
        .rev()
        .copied()
        .find(|&i| all[i].effective_date <= as_of)
        .unwrap_or(first_start);
    let era_end = starts
        .iter()
        .copied()
        .find(|&i| i > era_start)
        .unwrap_or(all.len());

    let end_date = all[era_start..era_end]
        .iter()
        .find(|t| t.next_state == EntitlementState::Cancelled)
        .map(|t| t.effective_date);

    let previous = all.iter().rev().find(|t| t.effective_date <= as_of).cloned();
    let pending = all.iter().find(|t| t.effective_date > as_of).cloned();
    let target = previous.as_ref().and_then(|t| t.next.clone());

    Some(SubscriptionState {
        category,
        current_plan: target.as_ref().map(|t| t.plan.clone()),
        current_phase: target.as_ref().map(|t| t.phase.clone()),
        current_price_list: target.map(|t| t.price_list),
        is_cancelled: end_date.is_some_and(|d| d <= as_of),
        is_future_cancelled: end_date.is_some_and(|d| d > as_of),
        start_date: all[era_start].effective_date,
        end_date,
        previous_transition: previous,
        pending_transition: pending,
    })
}

/// Optimistic-concurrency token of a bundle: the highest event ordering across
/// its subscriptions plus the bundle's last system update, in milliseconds.
pub fn view_id(max_total_ordering: u64, last_system_update_time: DateTime<Utc>) -> String {
    format!(
        "{}-{}",
        max_total_ordering,
        last_system_update_time.timestamp_millis()
    )
}
