use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entitlement_core::{
    catalog::{PhaseType, PlanSpecifier, ProductCategory},
    events::{EntitlementEvent, EventType},
    ids::*,
    model::{Subscription, SubscriptionBundle},
    timeline,
};

/// Read-only snapshot of a bundle's timeline, optionally with a proposed or
/// computed repair folded in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineView {
    pub view_id: String,
    pub bundle_id: BundleId,
    pub subscriptions: Vec<SubscriptionTimeline>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionTimeline {
    pub subscription_id: SubscriptionId,
    pub category: ProductCategory,
    pub active_version: u32,
    /// Visible events kept as they are.
    pub existing_events: Vec<EntitlementEvent>,
    pub deleted_events: Vec<EventId>,
    /// Events a repair adds, implied phase events included. Not yet persisted.
    pub new_events: Vec<EntitlementEvent>,
}

impl TimelineView {
    pub fn from_bundle(bundle: &SubscriptionBundle, subscriptions: &[Subscription]) -> Self {
        let max_ordering = subscriptions
            .iter()
            .map(Subscription::max_total_ordering)
            .max()
            .unwrap_or(0);
        Self {
            view_id: timeline::view_id(max_ordering, bundle.last_system_update_time),
            bundle_id: bundle.bundle_id,
            subscriptions: subscriptions.iter().map(SubscriptionTimeline::current).collect(),
        }
    }

    pub fn subscription(&self, subscription_id: SubscriptionId) -> Option<&SubscriptionTimeline> {
        self.subscriptions
            .iter()
            .find(|s| s.subscription_id == subscription_id)
    }
}

impl SubscriptionTimeline {
    pub fn current(subscription: &Subscription) -> Self {
        Self {
            subscription_id: subscription.subscription_id,
            category: subscription.category,
            active_version: subscription.active_version,
            existing_events: subscription.effective_events(),
            deleted_events: Vec::new(),
            new_events: Vec::new(),
        }
    }

    /// Existing and new events merged in timeline order.
    pub fn events(&self) -> Vec<&EntitlementEvent> {
        let mut all: Vec<&EntitlementEvent> = self
            .existing_events
            .iter()
            .chain(self.new_events.iter())
            .collect();
        all.sort_by_key(|e| (e.effective_date, e.total_ordering));
        all
    }

    pub fn event_types(&self) -> Vec<EventType> {
        self.events().iter().map(|e| e.event_type()).collect()
    }
}

/// An operator's retroactive edit of a bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleRepair {
    /// View the edit was prepared against.
    pub view_id: String,
    pub subscriptions: Vec<SubscriptionRepair>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRepair {
    pub subscription_id: SubscriptionId,
    /// Must be a trailing run of the visible events.
    pub deleted_events: Vec<EventId>,
    pub new_events: Vec<NewEvent>,
}

impl SubscriptionRepair {
    pub fn new(subscription_id: SubscriptionId) -> Self {
        Self {
            subscription_id,
            deleted_events: Vec::new(),
            new_events: Vec::new(),
        }
    }

    pub fn delete(mut self, event_id: EventId) -> Self {
        self.deleted_events.push(event_id);
        self
    }

    pub fn add(mut self, event: NewEvent) -> Self {
        self.new_events.push(event);
        self
    }

    pub fn is_noop(&self) -> bool {
        self.deleted_events.is_empty() && self.new_events.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: EventType,
    pub effective_date: DateTime<Utc>,
    /// Required for CREATE, RE_CREATE and CHANGE.
    pub plan: Option<PlanSpecifier>,
    /// Initial phase of a creation; the plan's first phase when absent.
    pub phase_type: Option<PhaseType>,
}

impl NewEvent {
    pub fn create(effective_date: DateTime<Utc>, plan: PlanSpecifier) -> Self {
        Self {
            event_type: EventType::Create,
            effective_date,
            plan: Some(plan),
            phase_type: None,
        }
    }

    pub fn recreate(effective_date: DateTime<Utc>, plan: PlanSpecifier) -> Self {
        Self {
            event_type: EventType::ReCreate,
            effective_date,
            plan: Some(plan),
            phase_type: None,
        }
    }

    pub fn change(effective_date: DateTime<Utc>, plan: PlanSpecifier) -> Self {
        Self {
            event_type: EventType::Change,
            effective_date,
            plan: Some(plan),
            phase_type: None,
        }
    }

    pub fn cancel(effective_date: DateTime<Utc>) -> Self {
        Self {
            event_type: EventType::Cancel,
            effective_date,
            plan: None,
            phase_type: None,
        }
    }

    pub fn with_phase_type(mut self, phase_type: PhaseType) -> Self {
        self.phase_type = Some(phase_type);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use entitlement_core::events::{EventPayload, PlanTarget};

    fn day(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(n)
    }

    #[test]
    fn view_of_stored_bundle() {
        let bundle = SubscriptionBundle {
            bundle_id: BundleId::new(),
            key: "k".into(),
            account_id: AccountId::new(),
            start_date: day(0),
            last_system_update_time: day(1),
        };
        let sub_id = SubscriptionId::new();
        let mut create = EntitlementEvent::new(
            sub_id,
            day(0),
            day(0),
            day(0),
            EventPayload::Create(PlanTarget::new("pistol-monthly", "pistol-monthly-trial", "DEFAULT")),
            "test",
        );
        create.total_ordering = 7;
        let sub = Subscription {
            subscription_id: sub_id,
            bundle_id: bundle.bundle_id,
            category: ProductCategory::Base,
            start_date: day(0),
            bundle_start_date: day(0),
            align_start_date: day(0),
            charged_through_date: None,
            active_version: 1,
            events: vec![create],
        };

        let view = TimelineView::from_bundle(&bundle, &[sub]);
        assert_eq!(view.view_id, timeline::view_id(7, day(1)));
        let timeline = view.subscription(sub_id).unwrap();
        assert_eq!(timeline.event_types(), vec![EventType::Create]);
        assert!(timeline.new_events.is_empty());
    }

    #[test]
    fn builder_collects_edits() {
        let sub_id = SubscriptionId::new();
        let event_id = EventId::new();
        let edit = SubscriptionRepair::new(sub_id)
            .delete(event_id)
            .add(NewEvent::cancel(day(3)));
        assert_eq!(edit.deleted_events, vec![event_id]);
        assert_eq!(edit.new_events[0].event_type, EventType::Cancel);
        assert!(!edit.is_noop());
        assert!(SubscriptionRepair::new(sub_id).is_noop());
    }
}
