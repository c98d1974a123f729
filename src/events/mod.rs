//! Typed event fanout for pipeline observers.

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use types::{EventKind, PipelineEvent};
