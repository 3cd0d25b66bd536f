use chrono::{DateTime, Utc};
use entitlement_core::{
    catalog::{
        ActionPolicy, BillingPeriod, Duration, Plan, PlanAlignment, PlanChangeResult, PlanPhase,
        PlanPhaseSpecifier, PlanSpecifier, PhaseType, Product, ProductCategory,
    },
    Catalog, CatalogError,
};

pub const PRICE_LIST: &str = "DEFAULT";

/// A small fixed catalog.
///
/// Base plans (`shotgun`, `pistol`) open with a 30 day trial, `assault-rifle`
/// is evergreen only. Add-ons: `laser-scope` has a one month discount phase,
/// `telescopic-scope` is evergreen only. Base plans align on their own start,
/// add-ons on the bundle start.
#[derive(Debug, Clone)]
pub struct FixtureCatalog {
    plans: Vec<Plan>,
    pub cancel_policy: ActionPolicy,
    pub change_policy: ActionPolicy,
}

impl Default for FixtureCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl FixtureCatalog {
    pub fn new() -> Self {
        let trial = || phase(PhaseType::Trial, Duration::days(30));
        let evergreen = || phase(PhaseType::Evergreen, Duration::unlimited());
        Self {
            plans: vec![
                plan("shotgun", ProductCategory::Base, vec![trial(), evergreen()]),
                plan("pistol", ProductCategory::Base, vec![trial(), evergreen()]),
                plan("assault-rifle", ProductCategory::Base, vec![evergreen()]),
                plan(
                    "laser-scope",
                    ProductCategory::AddOn,
                    vec![phase(PhaseType::Discount, Duration::months(1)), evergreen()],
                ),
                plan("telescopic-scope", ProductCategory::AddOn, vec![evergreen()]),
            ],
            cancel_policy: ActionPolicy::Immediate,
            change_policy: ActionPolicy::Immediate,
        }
    }

    pub fn with_end_of_term_policies(mut self) -> Self {
        self.cancel_policy = ActionPolicy::EndOfTerm;
        self.change_policy = ActionPolicy::EndOfTerm;
        self
    }

    fn alignment_for(&self, product: &str) -> Result<PlanAlignment, CatalogError> {
        let plan = self
            .plans
            .iter()
            .find(|p| p.product.name == product)
            .ok_or_else(|| CatalogError::UnknownPlan(product.to_string()))?;
        Ok(match plan.product.category {
            ProductCategory::AddOn => PlanAlignment::StartOfBundle,
            _ => PlanAlignment::StartOfSubscription,
        })
    }
}

fn phase(phase_type: PhaseType, duration: Duration) -> PlanPhase {
    PlanPhase {
        // Renamed once the plan is known.
        name: String::new(),
        phase_type,
        duration,
    }
}

fn plan(product: &str, category: ProductCategory, phases: Vec<PlanPhase>) -> Plan {
    let name = format!("{product}-monthly");
    let phases = phases
        .into_iter()
        .map(|mut p| {
            p.name = format!("{name}-{}", p.phase_type.as_str().to_lowercase());
            p
        })
        .collect();
    Plan {
        name,
        product: Product {
            name: product.to_string(),
            category,
        },
        billing_period: BillingPeriod::Monthly,
        price_list: PRICE_LIST.to_string(),
        phases,
    }
}

impl Catalog for FixtureCatalog {
    fn find_plan(&self, spec: &PlanSpecifier, _date: DateTime<Utc>) -> Result<Plan, CatalogError> {
        self.plans
            .iter()
            .find(|p| p.product.name == spec.product && p.billing_period == spec.billing_period)
            .cloned()
            .ok_or_else(|| CatalogError::NoMatchingPlan {
                product: spec.product.clone(),
                billing_period: spec.billing_period.as_str().to_string(),
                price_list: spec.price_list.clone(),
            })
    }

    fn find_plan_by_name(&self, plan_name: &str, _date: DateTime<Utc>) -> Result<Plan, CatalogError> {
        self.plans
            .iter()
            .find(|p| p.name == plan_name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownPlan(plan_name.to_string()))
    }

    fn find_phase(
        &self,
        phase_name: &str,
        _date: DateTime<Utc>,
        _subscription_start: DateTime<Utc>,
    ) -> Result<PlanPhase, CatalogError> {
        self.plans
            .iter()
            .flat_map(|p| p.phases.iter())
            .find(|p| p.name == phase_name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownPhase(phase_name.to_string()))
    }

    fn plan_cancel_policy(
        &self,
        _current: &PlanPhaseSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<ActionPolicy, CatalogError> {
        Ok(self.cancel_policy)
    }

    fn plan_change(
        &self,
        from: &PlanPhaseSpecifier,
        to: &PlanSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<PlanChangeResult, CatalogError> {
        if from.product == to.product && from.price_list == to.price_list {
            return Err(CatalogError::IllegalPlanChange {
                from: from.plan_name.clone(),
                to: to.product.clone(),
            });
        }
        Ok(PlanChangeResult {
            policy: self.change_policy,
            alignment: self.alignment_for(&to.product)?,
            new_price_list: to.price_list.clone(),
        })
    }

    fn plan_creation_alignment(
        &self,
        spec: &PlanSpecifier,
        _date: DateTime<Utc>,
    ) -> Result<PlanAlignment, CatalogError> {
        self.alignment_for(&spec.product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_names_follow_plan_names() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = FixtureCatalog::new();
        let plan = catalog.find_plan_by_name("laser-scope-monthly", Utc::now())?;
        let names: Vec<&str> = plan.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["laser-scope-monthly-discount", "laser-scope-monthly-evergreen"]);
        Ok(())
    }

    #[test]
    fn same_product_change_is_illegal() -> Result<(), Box<dyn std::error::Error>> {
        let catalog = FixtureCatalog::new();
        let from = PlanPhaseSpecifier {
            plan_name: "pistol-monthly".into(),
            product: "pistol".into(),
            category: ProductCategory::Base,
            billing_period: BillingPeriod::Monthly,
            price_list: PRICE_LIST.into(),
            phase_type: PhaseType::Trial,
        };
        let to = PlanSpecifier::new("pistol", BillingPeriod::Monthly, PRICE_LIST);
        assert!(matches!(
            catalog.plan_change(&from, &to, Utc::now()),
            Err(CatalogError::IllegalPlanChange { .. })
        ));
        Ok(())
    }
}
