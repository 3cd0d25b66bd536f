use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    Create,
    ReCreate,
    Change,
    Cancel,
    Uncancel,
    Phase,
    Transfer,
    MigrateEntitlement,
    MigrateBilling,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::ReCreate => "RE_CREATE",
            Self::Change => "CHANGE",
            Self::Cancel => "CANCEL",
            Self::Uncancel => "UNCANCEL",
            Self::Phase => "PHASE",
            Self::Transfer => "TRANSFER",
            Self::MigrateEntitlement => "MIGRATE_ENTITLEMENT",
            Self::MigrateBilling => "MIGRATE_BILLING",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "CREATE" => Ok(Self::Create),
            "RE_CREATE" => Ok(Self::ReCreate),
            "CHANGE" => Ok(Self::Change),
            "CANCEL" => Ok(Self::Cancel),
            "UNCANCEL" => Ok(Self::Uncancel),
            "PHASE" => Ok(Self::Phase),
            "TRANSFER" => Ok(Self::Transfer),
            "MIGRATE_ENTITLEMENT" => Ok(Self::MigrateEntitlement),
            "MIGRATE_BILLING" => Ok(Self::MigrateBilling),
            _ => Err(CoreError::InvalidData(format!("unknown event type: {s}"))),
        }
    }

    /// Event types a repair may use to rebuild a subscription from nothing.
    pub fn is_recreation(&self) -> bool {
        matches!(self, Self::Create | Self::ReCreate)
    }

    /// Event types that open a subscription's history.
    pub fn starts_subscription(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::ReCreate | Self::Transfer | Self::MigrateEntitlement
        )
    }

    pub fn is_migration(&self) -> bool {
        matches!(self, Self::MigrateEntitlement | Self::MigrateBilling)
    }
}

/// Plan, phase and price list an event moves the subscription onto.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanTarget {
    pub plan: String,
    pub phase: String,
    pub price_list: String,
}

impl PlanTarget {
    pub fn new(plan: &str, phase: &str, price_list: &str) -> Self {
        Self {
            plan: plan.to_string(),
            phase: phase.to_string(),
            price_list: price_list.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    Create(PlanTarget),
    ReCreate(PlanTarget),
    Change(PlanTarget),
    Transfer(PlanTarget),
    MigrateEntitlement(PlanTarget),
    MigrateBilling(PlanTarget),
    Phase { phase: String },
    Cancel,
    Uncancel,
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Create(_) => EventType::Create,
            Self::ReCreate(_) => EventType::ReCreate,
            Self::Change(_) => EventType::Change,
            Self::Transfer(_) => EventType::Transfer,
            Self::MigrateEntitlement(_) => EventType::MigrateEntitlement,
            Self::MigrateBilling(_) => EventType::MigrateBilling,
            Self::Phase { .. } => EventType::Phase,
            Self::Cancel => EventType::Cancel,
            Self::Uncancel => EventType::Uncancel,
        }
    }

    pub fn target(&self) -> Option<&PlanTarget> {
        match self {
            Self::Create(t)
            | Self::ReCreate(t)
            | Self::Change(t)
            | Self::Transfer(t)
            | Self::MigrateEntitlement(t)
            | Self::MigrateBilling(t) => Some(t),
            Self::Phase { .. } | Self::Cancel | Self::Uncancel => None,
        }
    }

    pub fn plan_name(&self) -> Option<&str> {
        self.target().map(|t| t.plan.as_str())
    }

    pub fn phase_name(&self) -> Option<&str> {
        match self {
            Self::Phase { phase } => Some(phase),
            other => other.target().map(|t| t.phase.as_str()),
        }
    }

    pub fn price_list(&self) -> Option<&str> {
        self.target().map(|t| t.price_list.as_str())
    }

    pub fn to_msgpack(&self) -> Result<Vec<u8>, CoreError> {
        rmp_serde::to_vec(self).map_err(|e| CoreError::Serialization(e.to_string()))
    }

    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CoreError> {
        rmp_serde::from_slice(bytes).map_err(|e| CoreError::Serialization(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementEvent {
    pub event_id: EventId,
    pub subscription_id: SubscriptionId,
    pub effective_date: DateTime<Utc>,
    pub processed_date: DateTime<Utc>,
    pub requested_date: DateTime<Utc>,
    pub payload: EventPayload,
    pub active_version: u32,
    /// Assigned by storage at insert; zero until then.
    pub total_ordering: u64,
    pub from_disk: bool,
    pub created_by: String,
}

impl EntitlementEvent {
    /// A fresh in-memory event, not yet persisted.
    pub fn new(
        subscription_id: SubscriptionId,
        effective_date: DateTime<Utc>,
        requested_date: DateTime<Utc>,
        processed_date: DateTime<Utc>,
        payload: EventPayload,
        created_by: &str,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            subscription_id,
            effective_date,
            processed_date,
            requested_date,
            payload,
            active_version: 0,
            total_ordering: 0,
            from_disk: false,
            created_by: created_by.to_string(),
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

impl Ord for EntitlementEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.effective_date
            .cmp(&other.effective_date)
            .then(self.total_ordering.cmp(&other.total_ordering))
            .then(self.event_id.cmp(&other.event_id))
    }
}

impl PartialOrd for EntitlementEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn payload_msgpack_roundtrip() -> Result<(), Box<dyn std::error::Error>> {
        let payload = EventPayload::Change(PlanTarget::new(
            "pistol-monthly",
            "pistol-monthly-evergreen",
            "DEFAULT",
        ));
        let bytes = payload.to_msgpack()?;
        assert_eq!(EventPayload::from_msgpack(&bytes)?, payload);
        Ok(())
    }

    #[test]
    fn phase_name_covers_phase_events() {
        let phase = EventPayload::Phase { phase: "shotgun-monthly-evergreen".into() };
        assert_eq!(phase.phase_name(), Some("shotgun-monthly-evergreen"));
        assert_eq!(phase.plan_name(), None);
        assert_eq!(EventPayload::Cancel.phase_name(), None);
    }

    #[test]
    fn events_sort_by_effective_date_then_ordering() {
        let sub = SubscriptionId::new();
        let day0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let day1 = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let mut late = EntitlementEvent::new(sub, day1, day0, day0, EventPayload::Cancel, "t");
        late.total_ordering = 1;
        let mut early_second = EntitlementEvent::new(sub, day0, day0, day0, EventPayload::Uncancel, "t");
        early_second.total_ordering = 3;
        let mut early_first = EntitlementEvent::new(sub, day0, day0, day0, EventPayload::Cancel, "t");
        early_first.total_ordering = 2;

        let mut events = vec![late.clone(), early_second.clone(), early_first.clone()];
        events.sort();
        assert_eq!(events, vec![early_first, early_second, late]);
    }

    #[test]
    fn event_type_names_parse_back() {
        for t in [
            EventType::Create,
            EventType::ReCreate,
            EventType::Change,
            EventType::Cancel,
            EventType::Uncancel,
            EventType::Phase,
            EventType::Transfer,
            EventType::MigrateEntitlement,
            EventType::MigrateBilling,
        ] {
            assert_eq!(EventType::parse(t.as_str()).unwrap(), t);
        }
    }
}
