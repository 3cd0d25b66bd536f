//! Moving a bundle to another account.
//!
//! The destination gets a fresh bundle whose subscriptions open with a
//! TRANSFER event and carry over the source's scheduled plan changes. The
//! source subscriptions are cancelled, either at the transfer date or at the
//! end of the base plan's paid period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use entitlement_core::{
    events::{EntitlementEvent, EventPayload, EventType},
    ids::*,
    model::{CallContext, Subscription, SubscriptionBundle},
};
use entitlement_storage::BundleImage;

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_account: AccountId,
    pub destination_account: AccountId,
    /// Key of the bundle on the source account; reused on the destination.
    pub bundle_key: String,
    pub transfer_date: DateTime<Utc>,
    pub transfer_add_ons: bool,
    pub cancel_immediately: bool,
}

#[derive(Debug, Clone)]
pub struct TransferPlan {
    pub image: BundleImage,
    /// CANCEL events for the source subscriptions.
    pub cancels: Vec<EntitlementEvent>,
}

pub fn plan_transfer(
    source: &SubscriptionBundle,
    subscriptions: &[Subscription],
    request: &TransferRequest,
    ctx: &CallContext,
    now: DateTime<Utc>,
) -> Result<TransferPlan, EngineError> {
    let date = request.transfer_date;
    let requested = ctx.requested_date.unwrap_or(now);
    let created_by = ctx.created_by.as_str();
    let bundle_id = BundleId::new();

    let carried: Vec<&Subscription> = subscriptions
        .iter()
        .filter(|s| s.category.is_base_like() || request.transfer_add_ons)
        .filter(|s| !s.state_at(date).is_some_and(|state| state.is_cancelled))
        .collect();
    let Some(base) = carried.iter().find(|s| s.category.is_base_like()) else {
        return Err(EngineError::NothingToTransfer(source.bundle_id));
    };

    let mut moved = Vec::with_capacity(carried.len());
    for sub in &carried {
        if let Some(subscription) = transferred(sub, bundle_id, date, requested, now, created_by) {
            moved.push(subscription);
        }
    }

    let cancel_date = match base.charged_through_date {
        Some(ctd) if !request.cancel_immediately => ctd.max(date),
        _ => date,
    };
    let cancels = subscriptions
        .iter()
        .filter_map(|sub| {
            let state = sub.state_at(cancel_date)?;
            if state.end_date.is_some_and(|end| end <= cancel_date) {
                return None;
            }
            let at = cancel_date.max(sub.start_date);
            Some(EntitlementEvent::new(sub.subscription_id, at, requested, now, EventPayload::Cancel, created_by))
        })
        .collect();

    Ok(TransferPlan {
        image: BundleImage {
            bundle: SubscriptionBundle {
                bundle_id,
                key: request.bundle_key.clone(),
                account_id: request.destination_account,
                start_date: date,
                last_system_update_time: now,
            },
            subscriptions: moved,
        },
        cancels,
    })
}

/// The destination copy of one source subscription.
fn transferred(
    sub: &Subscription,
    bundle_id: BundleId,
    date: DateTime<Utc>,
    requested: DateTime<Utc>,
    now: DateTime<Utc>,
    created_by: &str,
) -> Option<Subscription> {
    let visible = sub.effective_events();
    let state = sub.state_at(date);
    let live = state
        .as_ref()
        .filter(|s| s.start_date <= date && !s.is_cancelled)
        .and_then(|s| s.current_target());

    // A subscription that has not started yet moves over at its own start.
    let (start, target) = match live {
        Some(target) => (date, target),
        None => {
            let first = visible.iter().find(|e| e.effective_date > date)?;
            (first.effective_date, first.payload.target()?.clone())
        }
    };

    let subscription_id = SubscriptionId::new();
    let mut events = vec![EntitlementEvent::new(
        subscription_id,
        start,
        requested,
        now,
        EventPayload::Transfer(target),
        created_by,
    )];
    events.extend(
        visible
            .iter()
            .filter(|e| e.effective_date > start)
            .filter(|e| matches!(e.event_type(), EventType::Change | EventType::Phase))
            .map(|e| EntitlementEvent::new(subscription_id, e.effective_date, requested, now, e.payload.clone(), created_by)),
    );

    Some(Subscription {
        subscription_id,
        bundle_id,
        category: sub.category,
        start_date: start,
        bundle_start_date: sub.bundle_start_date,
        align_start_date: sub.align_start_date,
        charged_through_date: sub.charged_through_date,
        active_version: 1,
        events,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use entitlement_core::catalog::ProductCategory;

    fn source() -> (SubscriptionBundle, Vec<Subscription>) {
        let bundle = SubscriptionBundle {
            bundle_id: BundleId::new(),
            key: "shared".into(),
            account_id: AccountId::new(),
            start_date: day(0),
            last_system_update_time: day(0),
        };
        let base_id = SubscriptionId::new();
        let mut base = subscription(
            bundle.bundle_id,
            ProductCategory::Base,
            0,
            vec![
                stored(base_id, 0, 1, create("pistol-monthly", "pistol-monthly-trial")),
                stored(base_id, 30, 2, phase("pistol-monthly-evergreen")),
            ],
        );
        base.charged_through_date = Some(day(45));
        let add_on_id = SubscriptionId::new();
        let add_on = subscription(
            bundle.bundle_id,
            ProductCategory::AddOn,
            5,
            vec![stored(add_on_id, 5, 3, create("laser-scope-monthly", "laser-scope-monthly-evergreen"))],
        );
        (bundle, vec![base, add_on])
    }

    fn request(bundle: &SubscriptionBundle, transfer_add_ons: bool, cancel_immediately: bool) -> TransferRequest {
        TransferRequest {
            source_account: bundle.account_id,
            destination_account: AccountId::new(),
            bundle_key: bundle.key.clone(),
            transfer_date: day(10),
            transfer_add_ons,
            cancel_immediately,
        }
    }

    #[test]
    fn live_base_moves_at_transfer_date() -> Result<(), Box<dyn std::error::Error>> {
        let (bundle, subs) = source();
        let plan = plan_transfer(&bundle, &subs, &request(&bundle, false, true), &CallContext::new("ops"), day(10))?;

        assert_eq!(plan.image.subscriptions.len(), 1);
        let moved = &plan.image.subscriptions[0];
        assert_eq!(moved.start_date, day(10));
        let types: Vec<EventType> = moved.events.iter().map(|e| e.event_type()).collect();
        assert_eq!(types, vec![EventType::Transfer, EventType::Phase]);
        assert_eq!(moved.events[0].payload.phase_name(), Some("pistol-monthly-trial"));

        // Both source subscriptions end at the transfer date.
        assert_eq!(plan.cancels.len(), 2);
        assert!(plan.cancels.iter().all(|e| e.effective_date == day(10)));
        Ok(())
    }

    #[test]
    fn end_of_term_cancel_waits_for_charged_through() -> Result<(), Box<dyn std::error::Error>> {
        let (bundle, subs) = source();
        let plan = plan_transfer(&bundle, &subs, &request(&bundle, true, false), &CallContext::new("ops"), day(10))?;
        assert_eq!(plan.image.subscriptions.len(), 2);
        assert!(plan.cancels.iter().all(|e| e.effective_date == day(45)));
        assert_eq!(plan.image.bundle.start_date, day(10));
        Ok(())
    }

    #[test]
    fn cancelled_base_has_nothing_to_transfer() {
        let (bundle, mut subs) = source();
        let base_id = subs[0].subscription_id;
        subs[0].events.push(stored(base_id, 8, 4, EventPayload::Cancel));
        let err = plan_transfer(&bundle, &subs, &request(&bundle, true, true), &CallContext::new("ops"), day(10))
            .unwrap_err();
        assert_eq!(err.code(), "NOTHING_TO_TRANSFER");
    }
}
