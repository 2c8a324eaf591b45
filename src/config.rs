//! Emitter and buffer configuration.

use crate::clock::{Clock, SystemClock};
use crate::error::{BusError, Result};
use crate::middleware::Middleware;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Default per-channel capacity.
pub const DEFAULT_MAX_SIZE: usize = 1000;

/// Default time-to-live for buffered events (ms).
pub const DEFAULT_TTL_MS: u64 = 30_000;

/// Which eviction strategy a buffer uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    #[default]
    Fifo,
    Lru,
    Priority,
}

impl FromStr for StrategyKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fifo" => Ok(StrategyKind::Fifo),
            "lru" => Ok(StrategyKind::Lru),
            "priority" => Ok(StrategyKind::Priority),
            other => Err(BusError::InvalidConfiguration(format!(
                "unknown strategy {other:?}, expected fifo, lru or priority"
            ))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StrategyKind::Fifo => "fifo",
            StrategyKind::Lru => "lru",
            StrategyKind::Priority => "priority",
        };
        f.write_str(name)
    }
}

/// Buffer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferConfig {
    /// Eviction strategy.
    /// Default: fifo
    pub strategy: StrategyKind,

    /// Max buffered events per channel.
    /// Default: 1000
    pub max_size: usize,

    /// Default time-to-live in ms; 0 disables expiry.
    /// Default: 30000
    pub ttl: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Fifo,
            max_size: DEFAULT_MAX_SIZE,
            ttl: DEFAULT_TTL_MS,
        }
    }
}

impl BufferConfig {
    pub fn new(strategy: StrategyKind, max_size: usize, ttl: u64) -> Self {
        Self {
            strategy,
            max_size,
            ttl,
        }
    }

    /// Parse a JSON document such as `{"strategy":"lru","maxSize":50}`.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: BufferConfig = serde_json::from_str(json)
            .map_err(|e| BusError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(BusError::InvalidConfiguration(
                "maxSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Merge a partial update, validating the result.
    pub fn merged(&self, update: &BufferConfigUpdate) -> Result<Self> {
        let merged = Self {
            strategy: update.strategy.unwrap_or(self.strategy),
            max_size: update.max_size.unwrap_or(self.max_size),
            ttl: update.ttl.unwrap_or(self.ttl),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial runtime change to a [`BufferConfig`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BufferConfigUpdate {
    pub strategy: Option<StrategyKind>,
    pub max_size: Option<usize>,
    pub ttl: Option<u64>,
}

/// Hook receiving runtime failures (middleware and subscriber errors).
pub type ErrorObserver = Arc<dyn Fn(&BusError) + Send + Sync>;

/// Emitter configuration.
pub struct EmitterConfig<T> {
    pub buffer: BufferConfig,

    /// Initial middleware stages, in execution order.
    pub middleware: Vec<Arc<dyn Middleware<T>>>,

    /// Receives runtime failures. When unset they are logged.
    pub observer: Option<ErrorObserver>,

    pub clock: Arc<dyn Clock>,

    /// Runtime for middleware chains that suspend. Defaults to the runtime
    /// current at construction, if any.
    pub runtime: Option<tokio::runtime::Handle>,
}

impl<T> Default for EmitterConfig<T> {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            middleware: Vec::new(),
            observer: None,
            clock: Arc::new(SystemClock),
            runtime: None,
        }
    }
}

impl<T> fmt::Debug for EmitterConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmitterConfig")
            .field("buffer", &self.buffer)
            .field("middleware", &self.middleware.len())
            .field("observer", &self.observer.is_some())
            .field("clock", &self.clock)
            .field("runtime", &self.runtime.is_some())
            .finish()
    }
}

impl<T> EmitterConfig<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer(mut self, buffer: BufferConfig) -> Self {
        self.buffer = buffer;
        self
    }

    pub fn with_middleware(mut self, stage: impl Middleware<T>) -> Self {
        self.middleware.push(Arc::new(stage));
        self
    }

    pub fn with_observer(mut self, observer: impl Fn(&BusError) + Send + Sync + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_runtime(mut self, runtime: tokio::runtime::Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}
