//! Buffer manager owning every channel's replay sequence.

use super::sequence::ChannelSequence;
use super::strategy::{strategy_for, EvictionStrategy};
use super::ttl::{Sweeper, TtlManager};
use crate::clock::Clock;
use crate::config::{BufferConfig, BufferConfigUpdate, StrategyKind};
use crate::error::Result;
use crate::types::{BufferedEvent, Event, EventId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Point-in-time statistics for a buffer.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferMetrics {
    pub strategy: StrategyKind,
    pub max_size: usize,
    pub channel_count: usize,
    pub total_events: usize,
    /// Fraction of the capacity of non-empty channels currently in use.
    pub utilization: f64,
    /// Approximate bytes held by buffered entries.
    pub memory_usage: usize,
    /// Entries removed to honour `max_size` since creation.
    pub evicted_total: u64,
    /// Entries removed because they expired since creation.
    pub expired_total: u64,
}

struct BufferState<T> {
    config: BufferConfig,
    channels: HashMap<String, ChannelSequence<T>>,
    strategy: Box<dyn EvictionStrategy<T>>,
    ttl: TtlManager,
    evicted_total: u64,
    expired_total: u64,
}

impl<T> BufferState<T> {
    fn trim(&mut self, channel: &str) -> usize {
        let max_size = self.config.max_size;
        let Some(seq) = self.channels.get_mut(channel) else {
            return 0;
        };
        let mut evicted = 0;
        while self.strategy.should_evict(seq, max_size) {
            match self.strategy.evict_oldest(seq) {
                Some(entry) => {
                    debug!(channel, event_id = %entry.id(), "evicted buffered event");
                    evicted += 1;
                }
                None => break,
            }
        }
        self.evicted_total += evicted as u64;
        evicted
    }

    fn expire_channel(&mut self, channel: &str) -> usize {
        let Some(seq) = self.channels.get_mut(channel) else {
            return 0;
        };
        let removed = self.ttl.cleanup_channel(seq);
        if seq.is_empty() {
            self.channels.remove(channel);
        }
        self.expired_total += removed as u64;
        removed
    }
}

/// Per-channel bounded replay buffers.
///
/// Placement and eviction go through the configured [`EvictionStrategy`];
/// expiry goes through the [`TtlManager`].
pub struct BufferManager<T> {
    state: Mutex<BufferState<T>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<T: Clone + Send + 'static> BufferManager<T> {
    /// Create a buffer manager and start its expiry sweeper.
    pub fn new(config: BufferConfig, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        config.validate()?;

        let state = BufferState {
            strategy: strategy_for(config.strategy),
            ttl: TtlManager::new(clock, config.ttl),
            channels: HashMap::new(),
            config,
            evicted_total: 0,
            expired_total: 0,
        };

        let manager = Arc::new(Self {
            state: Mutex::new(state),
            sweeper: Mutex::new(None),
        });
        manager.restart_sweeper();
        Ok(manager)
    }

    /// Buffer `event`, evicting as needed. Returns how many entries were evicted.
    pub fn add(&self, event: Event<T>, ttl: Option<u64>) -> usize {
        let mut state = self.state.lock();
        let channel = event.channel().to_string();
        let entry = BufferedEvent::new(event, state.ttl.now(), state.ttl.ttl_for(ttl));

        let BufferState {
            channels, strategy, ..
        } = &mut *state;
        strategy.add(channels.entry(channel.clone()).or_default(), entry);

        state.trim(&channel)
    }

    /// Current non-expired entries of `channel`, in buffer order.
    ///
    /// Reading a channel counts as a use of its most recent entry.
    pub fn get(&self, channel: &str) -> Vec<BufferedEvent<T>> {
        let mut state = self.state.lock();
        state.expire_channel(channel);

        let BufferState {
            channels, strategy, ..
        } = &mut *state;
        match channels.get_mut(channel) {
            Some(seq) => {
                if let Some(last) = seq.len().checked_sub(1) {
                    strategy.on_access(seq, last);
                }
                seq.to_vec()
            }
            None => Vec::new(),
        }
    }

    /// One entry by id, marking it as used.
    pub fn get_event(&self, channel: &str, id: &EventId) -> Option<BufferedEvent<T>> {
        let mut state = self.state.lock();
        state.expire_channel(channel);

        let BufferState {
            channels, strategy, ..
        } = &mut *state;
        let seq = channels.get_mut(channel)?;
        let index = seq.position(id)?;
        strategy.on_access(seq, index);
        seq.get(index).cloned()
    }

    pub fn has(&self, channel: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(channel)
            .is_some_and(|seq| !seq.is_empty())
    }

    pub fn len(&self, channel: &str) -> usize {
        self.state
            .lock()
            .channels
            .get(channel)
            .map_or(0, ChannelSequence::len)
    }

    pub fn total_len(&self) -> usize {
        self.state.lock().channels.values().map(ChannelSequence::len).sum()
    }

    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().channels.keys().cloned().collect();
        names.sort();
        names
    }

    /// Empty one channel, or all of them.
    pub fn clear(&self, channel: Option<&str>) {
        let mut state = self.state.lock();
        match channel {
            Some(channel) => {
                state.channels.remove(channel);
            }
            None => state.channels.clear(),
        }
    }

    pub fn config(&self) -> BufferConfig {
        self.state.lock().config.clone()
    }

    /// Apply a partial configuration change.
    pub fn configure(self: &Arc<Self>, update: BufferConfigUpdate) -> Result<()> {
        let ttl_changed = {
            let mut state = self.state.lock();
            let merged = state.config.merged(&update)?;
            let ttl_changed = merged.ttl != state.config.ttl;

            if merged.strategy != state.config.strategy {
                state.strategy = strategy_for(merged.strategy);
                let BufferState {
                    channels, strategy, ..
                } = &mut *state;
                for seq in channels.values_mut() {
                    strategy.rebalance(seq);
                }
            }

            state.ttl.set_ttl(merged.ttl);
            state.config = merged;

            let names: Vec<String> = state.channels.keys().cloned().collect();
            for name in names {
                state.trim(&name);
            }
            ttl_changed
        };

        if ttl_changed {
            self.restart_sweeper();
        }
        Ok(())
    }

    /// Sweep every channel for expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let mut state = self.state.lock();
        let BufferState {
            channels, ttl, ..
        } = &mut *state;
        let removed = ttl.cleanup(channels);
        state.expired_total += removed as u64;
        removed
    }

    pub fn metrics(&self) -> BufferMetrics {
        let state = self.state.lock();
        let channel_count = state.channels.len();
        let total_events = state.channels.values().map(ChannelSequence::len).sum::<usize>();
        let capacity = state.config.max_size * channel_count;

        BufferMetrics {
            strategy: state.config.strategy,
            max_size: state.config.max_size,
            channel_count,
            total_events,
            utilization: if capacity == 0 {
                0.0
            } else {
                total_events as f64 / capacity as f64
            },
            memory_usage: state
                .channels
                .iter()
                .map(|(name, seq)| name.len() + seq.estimated_bytes())
                .sum(),
            evicted_total: state.evicted_total,
            expired_total: state.expired_total,
        }
    }

    /// Stop the background sweeper.
    pub fn shutdown(&self) {
        self.sweeper.lock().take();
    }

    fn restart_sweeper(self: &Arc<Self>) {
        let interval = self.state.lock().ttl.sweep_interval();
        let mut sweeper = self.sweeper.lock();
        *sweeper = None;

        let Some(interval) = interval else {
            return;
        };

        let weak = Arc::downgrade(self);
        match Sweeper::spawn(interval, move || match weak.upgrade() {
            Some(buffer) => {
                let removed = buffer.evict_expired();
                if removed > 0 {
                    debug!(removed, "expired buffered events");
                }
                true
            }
            None => false,
        }) {
            Ok(spawned) => *sweeper = Some(spawned),
            Err(e) => warn!(error = %e, "failed to start ttl sweeper; expiry runs on read only"),
        }
    }
}
