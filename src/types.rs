//! Core types for the replay bus.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque identifier of an emitted event.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub String);

impl EventId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        EventId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Milliseconds since the clock's epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    pub fn millis_since(self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0).max(0) as u64
    }

    pub fn plus_millis(self, ms: u64) -> Self {
        Timestamp(self.0.saturating_add(ms as i64))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({}ms)", self.0)
    }
}

/// Eviction priority of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    /// Ordering weight; higher survives longer.
    pub fn weight(self) -> u8 {
        match self {
            Priority::High => 3,
            Priority::Medium => 2,
            Priority::Low => 1,
        }
    }
}

impl FromStr for Priority {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(()),
        }
    }
}

/// A published event. Immutable once created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event<T> {
    id: EventId,
    channel: String,
    data: T,
    timestamp: Timestamp,
    event_type: Option<String>,
    priority: Option<Priority>,
}

impl<T> Event<T> {
    pub(crate) fn new(
        id: EventId,
        channel: String,
        data: T,
        timestamp: Timestamp,
        options: &EmitOptions,
    ) -> Self {
        Self {
            id,
            channel,
            data,
            timestamp,
            event_type: options.event_type.clone(),
            priority: options.priority,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Optional free-form type tag.
    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// Priority supplied at emit time, if any.
    pub fn priority(&self) -> Option<Priority> {
        self.priority
    }

    /// Priority used for eviction ordering.
    ///
    /// An explicit priority wins; otherwise a type tag of `"high"`, `"medium"`
    /// or `"low"` is honoured; otherwise the event counts as medium.
    pub fn effective_priority(&self) -> Priority {
        self.priority
            .or_else(|| self.event_type.as_deref().and_then(|t| t.parse().ok()))
            .unwrap_or_default()
    }
}

/// An event as held in a channel buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BufferedEvent<T> {
    event: Event<T>,
    buffered_at: Timestamp,
    ttl: Option<u64>,
}

impl<T> BufferedEvent<T> {
    pub(crate) fn new(event: Event<T>, buffered_at: Timestamp, ttl: Option<u64>) -> Self {
        Self {
            event,
            buffered_at,
            ttl,
        }
    }

    pub fn event(&self) -> &Event<T> {
        &self.event
    }

    pub fn into_event(self) -> Event<T> {
        self.event
    }

    pub fn buffered_at(&self) -> Timestamp {
        self.buffered_at
    }

    /// Time-to-live in milliseconds for this entry, if it expires at all.
    pub fn ttl(&self) -> Option<u64> {
        self.ttl
    }

    pub fn id(&self) -> &EventId {
        self.event.id()
    }
}

/// Per-emit options.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmitOptions {
    /// Eviction priority for the priority strategy.
    pub priority: Option<Priority>,

    /// Entry-specific time-to-live in milliseconds, overriding the buffer default.
    pub ttl: Option<u64>,

    /// Type tag carried on the event.
    pub event_type: Option<String>,

    /// Skip the middleware chain. Channel ordering still applies.
    pub immediate: bool,
}

impl EmitOptions {
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn ttl(ttl_ms: u64) -> Self {
        Self {
            ttl: Some(ttl_ms),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn immediate(mut self) -> Self {
        self.immediate = true;
        self
    }
}
