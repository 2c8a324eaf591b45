//! Subscriber bookkeeping for the emitter.
//!
//! Subscribers are plain callbacks keyed by channel. Dispatch always works
//! on a snapshot of a channel's subscribers, so callbacks may subscribe or
//! unsubscribe (themselves included) while an event is being delivered.

mod registry;
mod types;

pub use registry::SubscriberRegistry;
pub use types::{Callback, Subscriber, SubscriptionId};
