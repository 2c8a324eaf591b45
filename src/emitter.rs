//! The event emitter: publish, subscribe with replay, middleware.

use crate::buffer::{BufferManager, BufferMetrics};
use crate::clock::Clock;
use crate::config::{BufferConfig, BufferConfigUpdate, EmitterConfig, ErrorObserver};
use crate::error::{panic_message, BusError, Result};
use crate::middleware::{run_chain, Middleware};
use crate::subscriptions::{Callback, Subscriber, SubscriberRegistry, SubscriptionId};
use crate::types::{BufferedEvent, EmitOptions, Event, EventId, Timestamp};
use futures::future::BoxFuture;
use futures::task::noop_waker;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

/// Window over which `events_per_second` is measured.
const RATE_WINDOW_MS: u64 = 1_000;

/// Number of chain timings averaged into `middleware_latency`.
const LATENCY_SAMPLES: usize = 100;

/// Snapshot of emitter statistics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitterMetrics {
    /// Emits accepted during the last second.
    pub events_per_second: f64,
    /// Fraction of the capacity of non-empty channels in use.
    pub buffer_utilization: f64,
    /// Approximate bytes held by the buffer.
    pub memory_usage: usize,
    pub active_subscriptions: usize,
    /// Mean middleware chain duration over recent emits, in milliseconds.
    pub middleware_latency: f64,
    pub buffer: BufferMetrics,
}

impl EmitterMetrics {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

type Stages<T> = Arc<Vec<Arc<dyn Middleware<T>>>>;

/// An emit waiting for its turn on a channel.
struct Emission<T> {
    event: Event<T>,
    ttl: Option<u64>,
    stages: Stages<T>,
}

/// Work serialized on a channel's pending queue.
enum Job<T> {
    Emit(Emission<T>),
    /// Register a subscriber and replay the buffer to it.
    Replay {
        id: SubscriptionId,
        callback: Callback<T>,
    },
}

impl<T> Job<T> {
    fn is_replay_for(&self, subscription: SubscriptionId) -> bool {
        matches!(self, Job::Replay { id, .. } if *id == subscription)
    }
}

/// Result of running one job's chain.
struct Settled<T> {
    channel: String,
    event_id: EventId,
    ttl: Option<u64>,
    /// `Some` when the event made it through every stage.
    result: std::result::Result<Option<Event<T>>, String>,
}

struct EmitterState<T> {
    registry: SubscriberRegistry<T>,
    middleware: Stages<T>,
    /// Pending emits per channel. A channel has an entry exactly while a
    /// drain owns it.
    pending: HashMap<String, VecDeque<Job<T>>>,
    emit_times: VecDeque<Timestamp>,
    latencies: VecDeque<Duration>,
}

impl<T> EmitterState<T> {
    /// Remove a subscriber, or its replay if that has not run yet.
    fn unsubscribe(&mut self, channel: &str, id: SubscriptionId) {
        self.registry.remove(channel, id);
        if let Some(queue) = self.pending.get_mut(channel) {
            queue.retain(|job| !job.is_replay_for(id));
        }
    }

    fn queued_replays(&self, channel: &str) -> usize {
        self.pending.get(channel).map_or(0, |queue| {
            queue
                .iter()
                .filter(|job| matches!(job, Job::Replay { .. }))
                .count()
        })
    }

    fn is_subscribed(&self, channel: &str, id: SubscriptionId) -> bool {
        self.registry.contains(channel, id)
            || self
                .pending
                .get(channel)
                .is_some_and(|queue| queue.iter().any(|job| job.is_replay_for(id)))
    }
}

struct Inner<T> {
    state: Mutex<EmitterState<T>>,
    buffer: Arc<BufferManager<T>>,
    destroyed: AtomicBool,
    observer: Option<ErrorObserver>,
    clock: Arc<dyn Clock>,
    runtime: Option<Handle>,
}

/// In-process publish/subscribe bus with replay for late subscribers.
///
/// Emits on the same channel are buffered and dispatched in submission
/// order, even when middleware suspends. Cloning an `Emitter` yields another
/// handle to the same bus.
pub struct Emitter<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Emitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("destroyed", &self.inner.destroyed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`Emitter::on`] and [`Emitter::once`].
///
/// Dropping the handle does not unsubscribe.
pub struct SubscriptionHandle<T> {
    id: SubscriptionId,
    channel: String,
    emitter: Weak<Inner<T>>,
}

impl<T> SubscriptionHandle<T> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop future deliveries. Safe to call repeatedly, and after destroy.
    pub fn unsubscribe(&self) {
        if let Some(inner) = self.emitter.upgrade() {
            inner.state.lock().unsubscribe(&self.channel, self.id);
        }
    }

    /// True while registered, including while the replay is still queued.
    pub fn is_active(&self) -> bool {
        self.emitter.upgrade().is_some_and(|inner| {
            let state = inner.state.lock();
            state.is_subscribed(&self.channel, self.id)
        })
    }
}

impl<T> fmt::Debug for SubscriptionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(BusError::InvalidChannel(channel.to_string()));
    }
    Ok(())
}

impl<T: Clone + Send + Sync + 'static> Emitter<T> {
    /// Create an emitter. Fails on invalid buffer configuration.
    pub fn new(config: EmitterConfig<T>) -> Result<Self> {
        let EmitterConfig {
            buffer,
            middleware,
            observer,
            clock,
            runtime,
        } = config;

        info!(
            strategy = %buffer.strategy,
            max_size = buffer.max_size,
            ttl_ms = buffer.ttl,
            stages = middleware.len(),
            "Replay emitter initialized"
        );

        let buffer = BufferManager::new(buffer, Arc::clone(&clock))?;

        let state = EmitterState {
            registry: SubscriberRegistry::new(),
            middleware: Arc::new(middleware),
            pending: HashMap::new(),
            emit_times: VecDeque::new(),
            latencies: VecDeque::new(),
        };

        Ok(Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                buffer,
                destroyed: AtomicBool::new(false),
                observer,
                clock,
                runtime: runtime.or_else(|| Handle::try_current().ok()),
            }),
        })
    }

    /// Emitter with default configuration.
    pub fn with_defaults() -> Result<Self> {
        Self::new(EmitterConfig::default())
    }

    /// Emitter with the given buffer settings and no middleware.
    pub fn with_buffer(buffer: BufferConfig) -> Result<Self> {
        Self::new(EmitterConfig::new().with_buffer(buffer))
    }

    /// Publish `data` on `channel`.
    pub fn emit(&self, channel: &str, data: T) -> Result<()> {
        self.emit_with(channel, data, EmitOptions::default())
    }

    /// Publish `data` on `channel` with per-event options.
    ///
    /// Returns once the event is queued. Middleware failures are reported to
    /// the observer, never returned here.
    pub fn emit_with(&self, channel: &str, data: T, options: EmitOptions) -> Result<()> {
        validate_channel(channel)?;
        let inner = &self.inner;

        let idle = {
            let mut state = inner.state.lock();
            inner.ensure_active()?;

            let now = inner.clock.now();
            let event = Event::new(EventId::generate(), channel.to_string(), data, now, &options);
            let stages = if options.immediate {
                Arc::new(Vec::new())
            } else {
                Arc::clone(&state.middleware)
            };

            state.emit_times.push_back(now);
            while state
                .emit_times
                .front()
                .is_some_and(|t| now.millis_since(*t) > RATE_WINDOW_MS)
            {
                state.emit_times.pop_front();
            }

            let idle = !state.pending.contains_key(channel);
            let queue = state.pending.entry(channel.to_string()).or_default();
            queue.push_back(Job::Emit(Emission {
                event,
                ttl: options.ttl,
                stages,
            }));
            if !idle {
                debug!(channel, queued = queue.len(), "emit queued behind pending chain");
            }
            idle
        };

        if idle {
            inner.drain(channel);
        }
        Ok(())
    }

    /// Subscribe to `channel`, replaying its buffered events first.
    ///
    /// Replay is ordered with the channel's emits. On an idle channel it runs
    /// before this returns. When an emit is still in flight, or when called
    /// from a callback on the same channel, the replay is queued and runs
    /// right after the work ahead of it; the handle is active meanwhile.
    pub fn on<F>(&self, channel: &str, callback: F) -> Result<SubscriptionHandle<T>>
    where
        F: Fn(&Event<T>) + Send + Sync + 'static,
    {
        self.subscribe(channel, move |_| Arc::new(callback))
    }

    /// Subscribe for a single event, replayed or live.
    pub fn once<F>(&self, channel: &str, callback: F) -> Result<SubscriptionHandle<T>>
    where
        F: Fn(&Event<T>) + Send + Sync + 'static,
    {
        let emitter = Arc::downgrade(&self.inner);
        let owned = channel.to_string();
        self.subscribe(channel, move |id| {
            let fired = AtomicBool::new(false);
            Arc::new(move |event: &Event<T>| {
                if fired.swap(true, Ordering::SeqCst) {
                    return;
                }
                if let Some(inner) = emitter.upgrade() {
                    inner.state.lock().registry.remove(&owned, id);
                }
                callback(event);
            })
        })
    }

    /// Remove one subscription, or every subscription of `channel`.
    pub fn off(&self, channel: &str, id: Option<SubscriptionId>) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.ensure_active()?;
        match id {
            Some(id) => state.unsubscribe(channel, id),
            None => {
                state.registry.remove_channel(channel);
                if let Some(queue) = state.pending.get_mut(channel) {
                    queue.retain(|job| !matches!(job, Job::Replay { .. }));
                }
            }
        }
        Ok(())
    }

    /// Append a middleware stage. Emits already queued keep the chain they
    /// were submitted with.
    pub fn use_middleware(&self, stage: impl Middleware<T>) -> Result<()> {
        let mut state = self.inner.state.lock();
        self.inner.ensure_active()?;
        Arc::make_mut(&mut state.middleware).push(Arc::new(stage));
        Ok(())
    }

    /// Empty one channel's buffer, or every buffer.
    pub fn clear(&self, channel: Option<&str>) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.buffer.clear(channel);
        Ok(())
    }

    /// Currently buffered, non-expired events of `channel`.
    ///
    /// Under LRU eviction this counts as a use of the newest entry only; the
    /// older entries keep their recency. Use [`Emitter::get_event`] to mark a
    /// specific entry as used.
    pub fn get_buffered(&self, channel: &str) -> Result<Vec<BufferedEvent<T>>> {
        self.inner.ensure_active()?;
        Ok(self.inner.buffer.get(channel))
    }

    /// One buffered event. Counts as a use for LRU eviction.
    pub fn get_event(&self, channel: &str, id: &EventId) -> Result<Option<BufferedEvent<T>>> {
        self.inner.ensure_active()?;
        Ok(self.inner.buffer.get_event(channel, id))
    }

    pub fn has_buffered(&self, channel: &str) -> Result<bool> {
        self.inner.ensure_active()?;
        Ok(self.inner.buffer.has(channel))
    }

    /// Force an expiry sweep. Returns how many events were removed.
    pub fn evict_expired(&self) -> Result<usize> {
        self.inner.ensure_active()?;
        Ok(self.inner.buffer.evict_expired())
    }

    /// Change buffer settings at runtime.
    pub fn configure_buffer(&self, update: BufferConfigUpdate) -> Result<()> {
        self.inner.ensure_active()?;
        self.inner.buffer.configure(update)
    }

    pub fn buffer_config(&self) -> Result<BufferConfig> {
        self.inner.ensure_active()?;
        Ok(self.inner.buffer.config())
    }

    /// Subscribers of `channel`, counting those whose replay is queued.
    pub fn listener_count(&self, channel: &str) -> Result<usize> {
        let state = self.inner.state.lock();
        self.inner.ensure_active()?;
        Ok(state.registry.count(channel) + state.queued_replays(channel))
    }

    pub fn get_metrics(&self) -> Result<EmitterMetrics> {
        let inner = &self.inner;
        let (events_per_second, active_subscriptions, middleware_latency) = {
            let state = inner.state.lock();
            inner.ensure_active()?;

            let now = inner.clock.now();
            let recent = state
                .emit_times
                .iter()
                .filter(|t| now.millis_since(**t) <= RATE_WINDOW_MS)
                .count();
            let latency = if state.latencies.is_empty() {
                0.0
            } else {
                let total: Duration = state.latencies.iter().sum();
                total.as_secs_f64() * 1_000.0 / state.latencies.len() as f64
            };
            let queued: usize = state
                .pending
                .keys()
                .map(|channel| state.queued_replays(channel))
                .sum();
            (recent as f64, state.registry.total() + queued, latency)
        };

        let buffer = inner.buffer.metrics();
        Ok(EmitterMetrics {
            events_per_second,
            buffer_utilization: buffer.utilization,
            memory_usage: buffer.memory_usage,
            active_subscriptions,
            middleware_latency,
            buffer,
        })
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down subscribers, pending emits, middleware and buffers.
    /// Idempotent.
    pub fn destroy(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.lock();
            if inner.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
            state.registry.clear();
            state.pending.clear();
            state.middleware = Arc::new(Vec::new());
            state.emit_times.clear();
            state.latencies.clear();
        }
        inner.buffer.clear(None);
        inner.buffer.shutdown();
        info!("Replay emitter destroyed");
    }

    fn subscribe<M>(&self, channel: &str, make_callback: M) -> Result<SubscriptionHandle<T>>
    where
        M: FnOnce(SubscriptionId) -> Callback<T>,
    {
        validate_channel(channel)?;
        let inner = &self.inner;

        let (id, idle) = {
            let mut state = inner.state.lock();
            inner.ensure_active()?;
            let id = state.registry.allocate_id();
            let callback = make_callback(id);

            let idle = !state.pending.contains_key(channel);
            let queue = state.pending.entry(channel.to_string()).or_default();
            queue.push_back(Job::Replay { id, callback });
            if !idle {
                debug!(channel, subscription = %id, "replay queued behind pending work");
            }
            (id, idle)
        };

        if idle {
            inner.drain(channel);
        }

        Ok(SubscriptionHandle {
            id,
            channel: channel.to_string(),
            emitter: Arc::downgrade(inner),
        })
    }
}

impl<T> Inner<T> {
    fn ensure_active(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            Err(BusError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn report(&self, error: BusError) {
        match &self.observer {
            Some(observer) => {
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| observer(&error))) {
                    warn!(
                        error = %error,
                        panic = %panic_message(panic.as_ref()),
                        "error observer panicked"
                    );
                }
            }
            None => warn!(error = %error, "replay bus runtime failure"),
        }
    }

    fn invoke(&self, subscriber: &Subscriber<T>, event: &Event<T>) {
        let callback = &subscriber.callback;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
            self.report(BusError::SubscriberFailure {
                channel: event.channel().to_string(),
                event_id: event.id().clone(),
                subscription: subscriber.id,
                reason: panic_message(panic.as_ref()),
            });
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Inner<T> {
    /// Process queued work for `channel` until the queue is empty or a
    /// chain suspends, in which case the rest moves onto the runtime.
    fn drain(self: &Arc<Self>, channel: &str) {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        loop {
            let job = {
                let mut state = self.state.lock();
                let Some(queue) = state.pending.get_mut(channel) else {
                    return;
                };
                match queue.pop_front() {
                    Some(job) => job,
                    None => {
                        state.pending.remove(channel);
                        return;
                    }
                }
            };

            let emission = match job {
                Job::Emit(emission) => emission,
                Job::Replay { id, callback } => {
                    self.replay(channel, id, callback);
                    continue;
                }
            };

            let event_id = emission.event.id().clone();
            let started = Instant::now();
            let mut chain = Self::chain(emission);
            let polled = {
                let _runtime = self.runtime.as_ref().map(Handle::enter);
                chain.as_mut().poll(&mut cx)
            };
            match polled {
                Poll::Ready(settled) => self.settle(settled, started),
                Poll::Pending => match &self.runtime {
                    Some(runtime) => {
                        let inner = Arc::clone(self);
                        let channel = channel.to_string();
                        runtime.spawn(async move {
                            let settled = chain.await;
                            inner.settle(settled, started);
                            inner.drain(&channel);
                        });
                        return;
                    }
                    None => {
                        // The chain is dropped; its event never reaches the buffer.
                        drop(chain);
                        self.report(BusError::MiddlewareFailure {
                            channel: channel.to_string(),
                            event_id,
                            reason: "middleware suspended without an async runtime".to_string(),
                        });
                    }
                },
            }
        }
    }

    fn chain(emission: Emission<T>) -> BoxFuture<'static, Settled<T>> {
        let Emission { event, ttl, stages } = emission;
        let channel = event.channel().to_string();
        let event_id = event.id().clone();

        async move {
            let run = async move {
                let accepted = run_chain(&stages, &event).await;
                accepted.map(|passed| passed.then_some(event))
            };
            let result = match AssertUnwindSafe(run).catch_unwind().await {
                Ok(Ok(accepted)) => Ok(accepted),
                Ok(Err(e)) => Err(e.to_string()),
                Err(panic) => Err(format!(
                    "middleware panicked: {}",
                    panic_message(panic.as_ref())
                )),
            };
            Settled {
                channel,
                event_id,
                ttl,
                result,
            }
        }
        .boxed()
    }

    fn settle(&self, settled: Settled<T>, started: Instant) {
        {
            let mut state = self.state.lock();
            state.latencies.push_back(started.elapsed());
            if state.latencies.len() > LATENCY_SAMPLES {
                state.latencies.pop_front();
            }
        }

        let Settled {
            channel,
            event_id,
            ttl,
            result,
        } = settled;

        match result {
            Ok(Some(event)) => self.deliver(event, ttl),
            Ok(None) => debug!(channel, event_id = %event_id, "event stopped by middleware"),
            Err(reason) => self.report(BusError::MiddlewareFailure {
                channel,
                event_id,
                reason,
            }),
        }
    }

    /// Register a subscriber and hand it the channel's buffer.
    fn replay(&self, channel: &str, id: SubscriptionId, callback: Callback<T>) {
        let (subscriber, entries) = {
            let mut state = self.state.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            let subscriber = state.registry.insert(channel, id, callback);
            // Same lock as `deliver`: an event is replayed or sent live, never both.
            (subscriber, self.buffer.get(channel))
        };

        debug!(channel, subscription = %id, replay = entries.len(), "subscribed");
        for entry in &entries {
            self.invoke(&subscriber, entry.event());
        }
    }

    /// Buffer `event` and hand it to a snapshot of the channel's subscribers.
    fn deliver(&self, event: Event<T>, ttl: Option<u64>) {
        let subscribers = {
            let state = self.state.lock();
            if self.destroyed.load(Ordering::SeqCst) {
                return;
            }
            self.buffer.add(event.clone(), ttl);
            state.registry.snapshot(event.channel())
        };

        for subscriber in &subscribers {
            self.invoke(subscriber, &event);
        }
    }
}
