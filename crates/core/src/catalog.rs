//! The catalog contract consumed by the engine.
//!
//! A catalog resolves plan and phase names to their definitions and answers
//! policy questions (cancel timing, change alignment). Implementations must be
//! deterministic for a given date: the engine replays and re-aligns history
//! and expects identical answers each time.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductCategory {
    Base,
    AddOn,
    Standalone,
}

impl ProductCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Base => "BASE",
            Self::AddOn => "ADD_ON",
            Self::Standalone => "STANDALONE",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CoreError> {
        match s {
            "BASE" => Ok(Self::Base),
            "ADD_ON" => Ok(Self::AddOn),
            "STANDALONE" => Ok(Self::Standalone),
            _ => Err(CoreError::InvalidData(format!("unknown product category: {s}"))),
        }
    }

    /// Base and standalone subscriptions anchor a bundle; add-ons hang off them.
    pub fn is_base_like(&self) -> bool {
        matches!(self, Self::Base | Self::Standalone)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BillingPeriod {
    Monthly,
    Quarterly,
    Annual,
    NoBillingPeriod,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "MONTHLY",
            Self::Quarterly => "QUARTERLY",
            Self::Annual => "ANNUAL",
            Self::NoBillingPeriod => "NO_BILLING_PERIOD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PhaseType {
    Trial,
    Discount,
    FixedTerm,
    Evergreen,
}

impl PhaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "TRIAL",
            Self::Discount => "DISCOUNT",
            Self::FixedTerm => "FIXEDTERM",
            Self::Evergreen => "EVERGREEN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeUnit {
    Days,
    Months,
    Years,
    Unlimited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Duration {
    pub unit: TimeUnit,
    pub number: u32,
}

impl Duration {
    pub fn days(number: u32) -> Self {
        Self { unit: TimeUnit::Days, number }
    }

    pub fn months(number: u32) -> Self {
        Self { unit: TimeUnit::Months, number }
    }

    pub fn years(number: u32) -> Self {
        Self { unit: TimeUnit::Years, number }
    }

    pub fn unlimited() -> Self {
        Self { unit: TimeUnit::Unlimited, number: 0 }
    }

    pub fn is_unlimited(&self) -> bool {
        self.unit == TimeUnit::Unlimited
    }

    /// Calendar-correct end of a period starting at `start`; `None` for an
    /// unlimited duration or an overflow.
    pub fn add_to(&self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.unit {
            TimeUnit::Days => start.checked_add_signed(chrono::Duration::days(self.number as i64)),
            TimeUnit::Months => start.checked_add_months(Months::new(self.number)),
            TimeUnit::Years => start.checked_add_months(Months::new(self.number.checked_mul(12)?)),
            TimeUnit::Unlimited => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    pub category: ProductCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhase {
    pub name: String,
    pub phase_type: PhaseType,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub product: Product,
    pub billing_period: BillingPeriod,
    pub price_list: String,
    pub phases: Vec<PlanPhase>,
}

impl Plan {
    pub fn phase(&self, name: &str) -> Option<&PlanPhase> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.name == name)
    }

    pub fn phase_of_type(&self, phase_type: PhaseType) -> Option<usize> {
        self.phases.iter().position(|p| p.phase_type == phase_type)
    }

    pub fn initial_phase(&self) -> Option<&PlanPhase> {
        self.phases.first()
    }
}

/// What a caller asks for: a product on a billing period from a price list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlanSpecifier {
    pub product: String,
    pub billing_period: BillingPeriod,
    pub price_list: String,
}

impl PlanSpecifier {
    pub fn new(product: &str, billing_period: BillingPeriod, price_list: &str) -> Self {
        Self {
            product: product.to_string(),
            billing_period,
            price_list: price_list.to_string(),
        }
    }
}

/// A concrete position inside the catalog: plan plus the phase in force.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanPhaseSpecifier {
    pub plan_name: String,
    pub product: String,
    pub category: ProductCategory,
    pub billing_period: BillingPeriod,
    pub price_list: String,
    pub phase_type: PhaseType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionPolicy {
    Immediate,
    EndOfTerm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanAlignment {
    StartOfBundle,
    StartOfSubscription,
    ChangeOfPlan,
    ChangeOfPriceList,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanChangeResult {
    pub policy: ActionPolicy,
    pub alignment: PlanAlignment,
    pub new_price_list: String,
}

pub trait Catalog {
    fn find_plan(&self, spec: &PlanSpecifier, date: DateTime<Utc>) -> Result<Plan, CatalogError>;

    fn find_plan_by_name(&self, plan_name: &str, date: DateTime<Utc>) -> Result<Plan, CatalogError>;

    fn find_phase(
        &self,
        phase_name: &str,
        date: DateTime<Utc>,
        subscription_start: DateTime<Utc>,
    ) -> Result<PlanPhase, CatalogError>;

    fn plan_cancel_policy(
        &self,
        current: &PlanPhaseSpecifier,
        date: DateTime<Utc>,
    ) -> Result<ActionPolicy, CatalogError>;

    fn plan_change(
        &self,
        from: &PlanPhaseSpecifier,
        to: &PlanSpecifier,
        date: DateTime<Utc>,
    ) -> Result<PlanChangeResult, CatalogError>;

    fn plan_creation_alignment(
        &self,
        spec: &PlanSpecifier,
        date: DateTime<Utc>,
    ) -> Result<PlanAlignment, CatalogError>;
}
