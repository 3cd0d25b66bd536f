pub mod catalog;
pub mod clock;
pub mod error;
pub mod events;
pub mod ids;
pub mod model;
pub mod timeline;

pub use catalog::Catalog;
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CatalogError, CoreError};
pub use events::{EntitlementEvent, EventPayload, EventType, PlanTarget};
pub use ids::*;
pub use model::{CallContext, Subscription, SubscriptionBundle};
pub use timeline::SubscriptionState;
