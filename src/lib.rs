//! # Replay Bus
//!
//! An in-process publish/subscribe bus where late subscribers still receive
//! recent events.
//!
//! ## Core Concepts
//!
//! - **Channels**: String keys partitioning events, subscribers and buffers
//! - **Replay**: Subscribing first delivers a channel's buffered events
//! - **Eviction**: Bounded buffers with FIFO, LRU or priority eviction
//! - **Expiry**: Per-entry time-to-live with a background sweep
//! - **Middleware**: Async interceptors run before buffering and dispatch
//!
//! ## Example
//!
//! ```ignore
//! use replay_bus::{BufferConfig, Emitter, StrategyKind};
//!
//! let bus = Emitter::with_buffer(BufferConfig::new(StrategyKind::Fifo, 3, 0))?;
//!
//! for n in ["A", "B", "C", "D"] {
//!     bus.emit("x", n.to_string())?;
//! }
//!
//! // Late subscriber receives B, C, D
//! let handle = bus.on("x", |event| println!("{}", event.data()))?;
//! handle.unsubscribe();
//! ```

pub mod buffer;
pub mod clock;
pub mod config;
pub mod emitter;
pub mod error;
pub mod middleware;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use async_trait::async_trait;
pub use buffer::{
    BufferManager, BufferMetrics, ChannelSequence, EvictionStrategy, FifoStrategy, LruStrategy,
    PriorityStrategy, TtlManager,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BufferConfig, BufferConfigUpdate, EmitterConfig, ErrorObserver, StrategyKind};
pub use emitter::{Emitter, EmitterMetrics, SubscriptionHandle};
pub use error::{BusError, MiddlewareError, Result};
pub use middleware::{filter, inspect, Middleware, MiddlewareResult, Next};
pub use subscriptions::SubscriptionId;
pub use types::*;
