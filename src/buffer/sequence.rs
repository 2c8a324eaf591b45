//! Ordered per-channel entry list with recency tracking.

use crate::types::{BufferedEvent, EventId};
use lru::LruCache;
use std::collections::VecDeque;
use std::fmt;

/// A buffered entry plus its slot key in the recency index.
#[derive(Clone, Debug)]
struct Slot<T> {
    key: u64,
    entry: BufferedEvent<T>,
}

/// The buffered events of one channel.
///
/// Order is whatever the active strategy made it. Every slot is also tracked
/// in a recency index; insertion counts as a use.
pub struct ChannelSequence<T> {
    slots: VecDeque<Slot<T>>,
    recency: LruCache<u64, ()>,
    next_key: u64,
}

impl<T> ChannelSequence<T> {
    pub fn new() -> Self {
        Self {
            slots: VecDeque::new(),
            recency: LruCache::unbounded(),
            next_key: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BufferedEvent<T>> {
        self.slots.iter().map(|s| &s.entry)
    }

    pub fn get(&self, index: usize) -> Option<&BufferedEvent<T>> {
        self.slots.get(index).map(|s| &s.entry)
    }

    pub fn position(&self, id: &EventId) -> Option<usize> {
        self.slots.iter().position(|s| s.entry.id() == id)
    }

    /// Append at the tail and mark as most recently used.
    pub fn push_back(&mut self, entry: BufferedEvent<T>) {
        let key = self.next_key;
        self.next_key += 1;
        self.recency.put(key, ());
        self.slots.push_back(Slot { key, entry });
    }

    pub fn pop_front(&mut self) -> Option<BufferedEvent<T>> {
        let slot = self.slots.pop_front()?;
        self.recency.pop(&slot.key);
        Some(slot.entry)
    }

    pub fn pop_back(&mut self) -> Option<BufferedEvent<T>> {
        let slot = self.slots.pop_back()?;
        self.recency.pop(&slot.key);
        Some(slot.entry)
    }

    pub fn remove(&mut self, index: usize) -> Option<BufferedEvent<T>> {
        let slot = self.slots.remove(index)?;
        self.recency.pop(&slot.key);
        Some(slot.entry)
    }

    /// Mark the entry at `index` as most recently used.
    pub fn touch(&mut self, index: usize) -> bool {
        match self.slots.get(index) {
            Some(slot) => {
                self.recency.promote(&slot.key);
                true
            }
            None => false,
        }
    }

    /// Index of the least recently used entry.
    ///
    /// O(log n) while entries are in insertion order (FIFO and LRU keep
    /// them that way); a full scan after a custom sort.
    pub fn least_recent(&self) -> Option<usize> {
        let (key, _) = self.recency.peek_lru()?;
        match self.slots.binary_search_by_key(key, |s| s.key) {
            Ok(index) => Some(index),
            Err(_) => self.slots.iter().position(|s| s.key == *key),
        }
    }

    /// Stable sort of the entries; recency is untouched.
    pub fn sort_by<F>(&mut self, mut compare: F)
    where
        F: FnMut(&BufferedEvent<T>, &BufferedEvent<T>) -> std::cmp::Ordering,
    {
        self.slots
            .make_contiguous()
            .sort_by(|a, b| compare(&a.entry, &b.entry));
    }

    /// Put entries back in insertion order.
    pub fn sort_by_insertion(&mut self) {
        self.slots.make_contiguous().sort_by_key(|s| s.key);
    }

    /// Drop every entry for which `keep` is false. Returns how many were dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&BufferedEvent<T>) -> bool,
    {
        let before = self.slots.len();
        let recency = &mut self.recency;
        self.slots.retain(|slot| {
            let kept = keep(&slot.entry);
            if !kept {
                recency.pop(&slot.key);
            }
            kept
        });
        before - self.slots.len()
    }

    /// Rough heap footprint in bytes.
    pub fn estimated_bytes(&self) -> usize {
        self.slots
            .iter()
            .map(|s| {
                std::mem::size_of::<Slot<T>>()
                    + s.entry.id().as_str().len()
                    + s.entry.event().channel().len()
                    + s.entry.event().event_type().map_or(0, str::len)
            })
            .sum::<usize>()
            + self.recency.len() * std::mem::size_of::<(u64, ())>()
    }
}

impl<T: Clone> ChannelSequence<T> {
    pub fn to_vec(&self) -> Vec<BufferedEvent<T>> {
        self.iter().cloned().collect()
    }
}

impl<T> Default for ChannelSequence<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for ChannelSequence<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{EmitOptions, Event, Timestamp};

    pub(crate) fn entry(data: &'static str, options: EmitOptions) -> BufferedEvent<&'static str> {
        let event = Event::new(
            EventId(data.to_string()),
            "test".to_string(),
            data,
            Timestamp(0),
            &options,
        );
        BufferedEvent::new(event, Timestamp(0), options.ttl)
    }

    pub(crate) fn data_of(seq: &ChannelSequence<&'static str>) -> Vec<&'static str> {
        seq.iter().map(|e| *e.event().data()).collect()
    }

    #[test]
    fn test_push_and_pop_keep_recency_in_sync() {
        let mut seq = ChannelSequence::new();
        seq.push_back(entry("a", EmitOptions::default()));
        seq.push_back(entry("b", EmitOptions::default()));
        seq.push_back(entry("c", EmitOptions::default()));

        assert_eq!(seq.least_recent(), Some(0));
        assert_eq!(seq.pop_front().map(|e| *e.event().data()), Some("a"));
        assert_eq!(seq.least_recent(), Some(0));
        assert_eq!(seq.pop_back().map(|e| *e.event().data()), Some("c"));
        assert_eq!(data_of(&seq), vec!["b"]);
    }

    #[test]
    fn test_touch_changes_least_recent() {
        let mut seq = ChannelSequence::new();
        seq.push_back(entry("a", EmitOptions::default()));
        seq.push_back(entry("b", EmitOptions::default()));

        assert!(seq.touch(0));
        assert_eq!(seq.least_recent(), Some(1));
        assert!(!seq.touch(7));
    }

    #[test]
    fn test_retain_reports_removed() {
        let mut seq = ChannelSequence::new();
        for d in ["a", "b", "c", "d"] {
            seq.push_back(entry(d, EmitOptions::default()));
        }

        let removed = seq.retain(|e| *e.event().data() != "b" && *e.event().data() != "d");
        assert_eq!(removed, 2);
        assert_eq!(data_of(&seq), vec!["a", "c"]);
        assert_eq!(seq.least_recent(), Some(0));
        assert!(seq.estimated_bytes() > 0);
    }

    #[test]
    fn test_least_recent_after_reordering() {
        let mut seq = ChannelSequence::new();
        for d in ["a", "b", "c"] {
            seq.push_back(entry(d, EmitOptions::default()));
        }
        seq.touch(0);

        // Reverse order: lookup falls back to a scan
        seq.sort_by(|x, y| y.event().data().cmp(x.event().data()));
        assert_eq!(data_of(&seq), vec!["c", "b", "a"]);
        assert_eq!(seq.least_recent(), Some(1));

        seq.sort_by_insertion();
        assert_eq!(data_of(&seq), vec!["a", "b", "c"]);
        assert_eq!(seq.least_recent(), Some(1));
    }

    #[test]
    fn test_position_by_id() {
        let mut seq = ChannelSequence::new();
        seq.push_back(entry("a", EmitOptions::default()));
        seq.push_back(entry("b", EmitOptions::default()));
        assert_eq!(seq.position(&EventId("b".to_string())), Some(1));
        assert_eq!(seq.position(&EventId("z".to_string())), None);
    }
}
