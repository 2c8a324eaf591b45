//! Eviction strategies.
//!
//! A strategy decides where a new entry goes in a channel's sequence and
//! which entry leaves when the sequence is over capacity. The buffer manager
//! only ever talks to the [`EvictionStrategy`] trait.

use super::sequence::ChannelSequence;
use crate::config::StrategyKind;
use crate::types::BufferedEvent;
use std::fmt;

/// Placement and eviction policy for one buffer.
pub trait EvictionStrategy<T>: Send + Sync + fmt::Debug {
    fn kind(&self) -> StrategyKind;

    /// Insert `entry` into `seq` in this strategy's order.
    fn add(&self, seq: &mut ChannelSequence<T>, entry: BufferedEvent<T>);

    /// Whether `seq` holds more than `max_size` entries and must give one up.
    fn should_evict(&self, seq: &ChannelSequence<T>, max_size: usize) -> bool {
        seq.len() > max_size
    }

    /// Remove and return exactly one entry chosen by this strategy.
    fn evict_oldest(&self, seq: &mut ChannelSequence<T>) -> Option<BufferedEvent<T>>;

    /// Record a read of the entry at `index`.
    fn on_access(&self, seq: &mut ChannelSequence<T>, index: usize) {
        seq.touch(index);
    }

    /// Restore this strategy's ordering after a strategy switch.
    fn rebalance(&self, _seq: &mut ChannelSequence<T>) {}
}

/// Build the strategy for `kind`.
pub fn strategy_for<T: 'static>(kind: StrategyKind) -> Box<dyn EvictionStrategy<T>> {
    match kind {
        StrategyKind::Fifo => Box::new(FifoStrategy),
        StrategyKind::Lru => Box::new(LruStrategy),
        StrategyKind::Priority => Box::new(PriorityStrategy),
    }
}

/// First in, first out.
#[derive(Clone, Copy, Debug, Default)]
pub struct FifoStrategy;

impl<T> EvictionStrategy<T> for FifoStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Fifo
    }

    fn add(&self, seq: &mut ChannelSequence<T>, entry: BufferedEvent<T>) {
        seq.push_back(entry);
    }

    fn evict_oldest(&self, seq: &mut ChannelSequence<T>) -> Option<BufferedEvent<T>> {
        seq.pop_front()
    }

    fn rebalance(&self, seq: &mut ChannelSequence<T>) {
        seq.sort_by_insertion();
    }
}

/// Least recently used. Entries never read since insertion leave in
/// insertion order.
#[derive(Clone, Copy, Debug, Default)]
pub struct LruStrategy;

impl<T> EvictionStrategy<T> for LruStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Lru
    }

    fn add(&self, seq: &mut ChannelSequence<T>, entry: BufferedEvent<T>) {
        seq.push_back(entry);
    }

    fn evict_oldest(&self, seq: &mut ChannelSequence<T>) -> Option<BufferedEvent<T>> {
        match seq.least_recent() {
            Some(index) => seq.remove(index),
            None => seq.pop_front(),
        }
    }

    fn rebalance(&self, seq: &mut ChannelSequence<T>) {
        seq.sort_by_insertion();
    }
}

/// Highest priority first; the tail is evicted.
#[derive(Clone, Copy, Debug, Default)]
pub struct PriorityStrategy;

impl PriorityStrategy {
    fn sort<T>(seq: &mut ChannelSequence<T>) {
        seq.sort_by(|a, b| {
            b.event()
                .effective_priority()
                .weight()
                .cmp(&a.event().effective_priority().weight())
        });
    }
}

impl<T> EvictionStrategy<T> for PriorityStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Priority
    }

    fn add(&self, seq: &mut ChannelSequence<T>, entry: BufferedEvent<T>) {
        seq.push_back(entry);
        Self::sort(seq);
    }

    fn evict_oldest(&self, seq: &mut ChannelSequence<T>) -> Option<BufferedEvent<T>> {
        seq.pop_back()
    }

    fn rebalance(&self, seq: &mut ChannelSequence<T>) {
        Self::sort(seq);
    }
}
