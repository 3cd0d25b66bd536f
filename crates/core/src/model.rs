use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::ProductCategory;
use crate::events::EntitlementEvent;
use crate::ids::*;
use crate::timeline::{self, SubscriptionState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionBundle {
    pub bundle_id: BundleId,
    /// Externally visible identifier, unique per account.
    pub key: String,
    pub account_id: AccountId,
    pub start_date: DateTime<Utc>,
    pub last_system_update_time: DateTime<Utc>,
}

/// A subscription together with its visible events at `active_version`.
/// The bundle is referenced by id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub bundle_id: BundleId,
    pub category: ProductCategory,
    pub start_date: DateTime<Utc>,
    pub bundle_start_date: DateTime<Utc>,
    pub align_start_date: DateTime<Utc>,
    pub charged_through_date: Option<DateTime<Utc>>,
    pub active_version: u32,
    pub events: Vec<EntitlementEvent>,
}

impl Subscription {
    /// Projection of the subscription as of `as_of`.
    pub fn state_at(&self, as_of: DateTime<Utc>) -> Option<SubscriptionState> {
        timeline::replay_at(&self.events, self.category, as_of)
    }

    /// Visible events with superseded ones removed, in timeline order.
    pub fn effective_events(&self) -> Vec<EntitlementEvent> {
        timeline::effective_events(&self.events)
    }

    pub fn max_total_ordering(&self) -> u64 {
        self.events.iter().map(|e| e.total_ordering).max().unwrap_or(0)
    }

    /// Active at `as_of`: started and not yet ended.
    pub fn is_active_at(&self, as_of: DateTime<Utc>) -> bool {
        self.state_at(as_of).is_some_and(|s| s.start_date <= as_of && !s.is_cancelled)
    }
}

/// Audit attribution threaded through every mutation. Not interpreted beyond
/// being copied onto written records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallContext {
    pub user_token: Uuid,
    pub requested_date: Option<DateTime<Utc>>,
    pub created_by: String,
}

impl CallContext {
    pub fn new(created_by: &str) -> Self {
        Self {
            user_token: Uuid::now_v7(),
            requested_date: None,
            created_by: created_by.to_string(),
        }
    }

    pub fn with_requested_date(mut self, date: DateTime<Utc>) -> Self {
        self.requested_date = Some(date);
        self
    }
}
