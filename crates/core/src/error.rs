use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),
}

/// Failures of the catalog lookup service. These are caller-input problems
/// and are never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("unknown plan: {0}")]
    UnknownPlan(String),

    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("unknown price list: {0}")]
    UnknownPriceList(String),

    #[error("no plan for product {product} ({billing_period}) in price list {price_list}")]
    NoMatchingPlan {
        product: String,
        billing_period: String,
        price_list: String,
    },

    #[error("plan change from {from} to {to} is not allowed")]
    IllegalPlanChange { from: String, to: String },

    #[error("catalog has no version effective at {0}")]
    NoEffectiveVersion(String),
}
