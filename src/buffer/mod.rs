//! Bounded per-channel replay buffers.
//!
//! - [`BufferManager`] owns one [`ChannelSequence`] per channel
//! - [`EvictionStrategy`] decides placement and eviction (FIFO, LRU, priority)
//! - [`TtlManager`] expires entries on read and on a background sweep

mod manager;
mod sequence;
mod strategy;
mod ttl;

pub use manager::{BufferManager, BufferMetrics};
pub use sequence::ChannelSequence;
pub use strategy::{strategy_for, EvictionStrategy, FifoStrategy, LruStrategy, PriorityStrategy};
pub use ttl::{Sweeper, TtlManager};
