//! Time-to-live bookkeeping and the background expiry sweeper.

use super::sequence::ChannelSequence;
use crate::clock::Clock;
use crate::types::{BufferedEvent, Timestamp};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Decides when buffered entries expire and removes them.
#[derive(Debug)]
pub struct TtlManager {
    clock: Arc<dyn Clock>,
    /// Default ttl (ms) stamped on new entries; 0 disables expiry.
    default_ttl: u64,
}

impl TtlManager {
    pub fn new(clock: Arc<dyn Clock>, default_ttl: u64) -> Self {
        Self { clock, default_ttl }
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn ttl(&self) -> u64 {
        self.default_ttl
    }

    /// Change the default for entries buffered from now on.
    pub fn set_ttl(&mut self, ttl: u64) {
        self.default_ttl = ttl;
    }

    /// Ttl to stamp on a new entry. An explicit value wins, and an explicit
    /// zero opts the entry out of expiry.
    pub fn ttl_for(&self, explicit: Option<u64>) -> Option<u64> {
        explicit
            .or(Some(self.default_ttl))
            .filter(|ttl| *ttl > 0)
    }

    pub fn is_expired<T>(&self, entry: &BufferedEvent<T>) -> bool {
        self.is_expired_at(entry, self.now())
    }

    fn is_expired_at<T>(&self, entry: &BufferedEvent<T>, now: Timestamp) -> bool {
        match entry.ttl() {
            Some(ttl) => now.millis_since(entry.buffered_at()) > ttl,
            None => false,
        }
    }

    /// Drop expired entries from one channel.
    pub fn cleanup_channel<T>(&self, seq: &mut ChannelSequence<T>) -> usize {
        let now = self.now();
        seq.retain(|entry| !self.is_expired_at(entry, now))
    }

    /// Drop expired entries from every channel, and channels left empty.
    pub fn cleanup<T>(&self, channels: &mut HashMap<String, ChannelSequence<T>>) -> usize {
        let now = self.now();
        let mut removed = 0;
        for seq in channels.values_mut() {
            removed += seq.retain(|entry| !self.is_expired_at(entry, now));
        }
        channels.retain(|_, seq| !seq.is_empty());
        removed
    }

    /// Interval of the periodic sweep, or `None` when expiry is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        if self.default_ttl == 0 {
            None
        } else {
            Some(Duration::from_millis((self.default_ttl / 4).max(1)))
        }
    }
}

/// Background thread running a sweep on a fixed interval.
///
/// The thread stops when the sweeper is dropped or when `tick` returns false.
#[derive(Debug)]
pub struct Sweeper {
    _stop: Sender<()>,
}

impl Sweeper {
    pub fn spawn<F>(interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (stop, stopped) = bounded::<()>(1);
        thread::Builder::new()
            .name("replay-bus-ttl".to_string())
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick() {
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { _stop: stop })
    }
}
