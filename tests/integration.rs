//! Integration tests for the replay bus.

use parking_lot::Mutex;
use replay_bus::{
    filter, BufferConfig, BufferConfigUpdate, EmitOptions, Emitter, EmitterConfig, Event,
    ManualClock, Priority, StrategyKind, SubscriptionHandle,
};
use std::sync::Arc;

fn bus(strategy: StrategyKind, max_size: usize, ttl: u64) -> Emitter<String> {
    Emitter::with_buffer(BufferConfig::new(strategy, max_size, ttl)).unwrap()
}

/// Subscribe and collect every delivered payload.
fn collect(
    bus: &Emitter<String>,
    channel: &str,
) -> (Arc<Mutex<Vec<String>>>, SubscriptionHandle<String>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = bus
        .on(channel, move |event: &Event<String>| {
            sink.lock().push(event.data().clone())
        })
        .unwrap();
    (seen, handle)
}

fn payloads(bus: &Emitter<String>, channel: &str) -> Vec<String> {
    bus.get_buffered(channel)
        .unwrap()
        .iter()
        .map(|e| e.event().data().clone())
        .collect()
}

// --- Replay ---

#[test]
fn test_late_subscriber_gets_latest_fifo() {
    let bus = bus(StrategyKind::Fifo, 3, 0);
    for n in ["A", "B", "C", "D"] {
        bus.emit("x", n.to_string()).unwrap();
    }

    let (seen, _handle) = collect(&bus, "x");
    assert_eq!(*seen.lock(), vec!["B", "C", "D"]);
}

#[test]
fn test_replay_then_live() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("chat", "early".to_string()).unwrap();

    let (seen, _handle) = collect(&bus, "chat");
    assert_eq!(*seen.lock(), vec!["early"]);

    bus.emit("chat", "live".to_string()).unwrap();
    assert_eq!(*seen.lock(), vec!["early", "live"]);

    // Other channels are not delivered
    bus.emit("other", "nope".to_string()).unwrap();
    assert_eq!(seen.lock().len(), 2);
}

#[test]
fn test_every_subscriber_gets_replay() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("x", "1".to_string()).unwrap();

    let (first, _a) = collect(&bus, "x");
    let (second, _b) = collect(&bus, "x");
    bus.emit("x", "2".to_string()).unwrap();

    assert_eq!(*first.lock(), vec!["1", "2"]);
    assert_eq!(*second.lock(), vec!["1", "2"]);
    assert_eq!(bus.listener_count("x").unwrap(), 2);
}

#[test]
fn test_event_fields() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit_with(
        "orders",
        "created".to_string(),
        EmitOptions::default().with_type("order.created"),
    )
    .unwrap();
    bus.emit("orders", "paid".to_string()).unwrap();

    let buffered = bus.get_buffered("orders").unwrap();
    assert_eq!(buffered.len(), 2);
    assert_eq!(buffered[0].event().channel(), "orders");
    assert_eq!(buffered[0].event().event_type(), Some("order.created"));
    assert_ne!(buffered[0].id(), buffered[1].id());
    assert!(buffered[0].event().timestamp() <= buffered[1].event().timestamp());
}

// --- Strategies ---

#[test]
fn test_lru_keeps_recently_read() {
    let bus = bus(StrategyKind::Lru, 2, 0);
    bus.emit("x", "A".to_string()).unwrap();
    bus.emit("x", "B".to_string()).unwrap();

    let a = bus.get_buffered("x").unwrap()[0].id().clone();
    assert!(bus.get_event("x", &a).unwrap().is_some());

    bus.emit("x", "C".to_string()).unwrap();
    assert_eq!(payloads(&bus, "x"), vec!["A", "C"]);
}

#[test]
fn test_lru_read_all_touches_newest_only() {
    let bus = bus(StrategyKind::Lru, 2, 0);
    bus.emit("x", "A".to_string()).unwrap();
    bus.emit("x", "B".to_string()).unwrap();

    // A full read does not refresh the oldest entry
    assert_eq!(payloads(&bus, "x"), vec!["A", "B"]);

    bus.emit("x", "C".to_string()).unwrap();
    assert_eq!(payloads(&bus, "x"), vec!["B", "C"]);
}

#[test]
fn test_priority_evicts_low_first() {
    let bus = bus(StrategyKind::Priority, 3, 0);
    for n in ["low-1", "low-2", "low-3"] {
        bus.emit_with("x", n.to_string(), EmitOptions::priority(Priority::Low))
            .unwrap();
    }
    bus.emit_with("x", "high".to_string(), EmitOptions::priority(Priority::High))
        .unwrap();

    assert_eq!(payloads(&bus, "x"), vec!["high", "low-1", "low-2"]);
}

#[test]
fn test_priority_from_type_tag() {
    let bus = bus(StrategyKind::Priority, 2, 0);
    bus.emit_with("x", "a".to_string(), EmitOptions::default().with_type("low"))
        .unwrap();
    bus.emit_with("x", "b".to_string(), EmitOptions::default().with_type("high"))
        .unwrap();
    bus.emit("x", "c".to_string()).unwrap();

    assert_eq!(payloads(&bus, "x"), vec!["b", "c"]);
}

// --- Expiry ---

#[test]
fn test_expired_events_are_not_replayed() {
    let clock = Arc::new(ManualClock::new(10_000));
    let bus: Emitter<String> = Emitter::new(
        EmitterConfig::new()
            .with_buffer(BufferConfig::new(StrategyKind::Fifo, 10, 0))
            .with_clock(clock.clone()),
    )
    .unwrap();

    bus.emit_with("x", "short".to_string(), EmitOptions::ttl(100))
        .unwrap();
    bus.emit("x", "forever".to_string()).unwrap();

    clock.advance(50);
    assert_eq!(payloads(&bus, "x"), vec!["short", "forever"]);

    clock.advance(100);
    let (seen, _handle) = collect(&bus, "x");
    assert_eq!(*seen.lock(), vec!["forever"]);
}

#[test]
fn test_evict_expired_counts() {
    let clock = Arc::new(ManualClock::new(0));
    let bus: Emitter<String> = Emitter::new(
        EmitterConfig::new()
            .with_buffer(BufferConfig::new(StrategyKind::Fifo, 10, 0))
            .with_clock(clock.clone()),
    )
    .unwrap();

    bus.emit_with("a", "1".to_string(), EmitOptions::ttl(10)).unwrap();
    bus.emit_with("b", "2".to_string(), EmitOptions::ttl(10)).unwrap();
    bus.emit_with("b", "3".to_string(), EmitOptions::ttl(1_000)).unwrap();

    clock.advance(20);
    assert_eq!(bus.evict_expired().unwrap(), 2);
    assert!(!bus.has_buffered("a").unwrap());
    assert_eq!(payloads(&bus, "b"), vec!["3"]);
}

// --- Clear / configure ---

#[test]
fn test_clear_twice() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("a", "1".to_string()).unwrap();
    bus.emit("b", "2".to_string()).unwrap();

    bus.clear(Some("a")).unwrap();
    assert!(payloads(&bus, "a").is_empty());
    assert_eq!(payloads(&bus, "b"), vec!["2"]);

    bus.clear(None).unwrap();
    bus.clear(None).unwrap();
    assert_eq!(bus.get_metrics().unwrap().buffer.total_events, 0);
}

#[test]
fn test_configure_buffer_at_runtime() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    for n in ["A", "B", "C", "D"] {
        bus.emit("x", n.to_string()).unwrap();
    }

    bus.configure_buffer(BufferConfigUpdate {
        max_size: Some(2),
        ..Default::default()
    })
    .unwrap();
    assert_eq!(payloads(&bus, "x"), vec!["C", "D"]);
    assert_eq!(bus.buffer_config().unwrap().max_size, 2);
}

// --- Subscription management ---

#[test]
fn test_once_satisfied_by_replay() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("x", "first".to_string()).unwrap();
    bus.emit("x", "second".to_string()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handle = bus
        .once("x", move |event: &Event<String>| {
            sink.lock().push(event.data().clone())
        })
        .unwrap();
    bus.emit("x", "third".to_string()).unwrap();

    assert_eq!(*seen.lock(), vec!["first"]);
    assert!(!handle.is_active());
}

#[test]
fn test_once_live() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    bus.once("x", move |event: &Event<String>| {
        sink.lock().push(event.data().clone())
    })
    .unwrap();

    bus.emit("x", "a".to_string()).unwrap();
    bus.emit("x", "b".to_string()).unwrap();
    assert_eq!(*seen.lock(), vec!["a"]);
    assert_eq!(bus.listener_count("x").unwrap(), 0);
}

#[test]
fn test_unsubscribe_is_idempotent() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let (seen, handle) = collect(&bus, "x");

    handle.unsubscribe();
    handle.unsubscribe();
    bus.emit("x", "ignored".to_string()).unwrap();

    assert!(seen.lock().is_empty());
    assert!(!handle.is_active());
}

#[test]
fn test_off_one_and_all() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let (first, a) = collect(&bus, "x");
    let (second, _b) = collect(&bus, "x");
    let (third, _c) = collect(&bus, "x");

    bus.off("x", Some(a.id())).unwrap();
    bus.emit("x", "1".to_string()).unwrap();
    assert!(first.lock().is_empty());
    assert_eq!(*second.lock(), vec!["1"]);

    bus.off("x", None).unwrap();
    bus.emit("x", "2".to_string()).unwrap();
    assert_eq!(*third.lock(), vec!["1"]);
    assert_eq!(bus.listener_count("x").unwrap(), 0);
}

#[test]
fn test_unsubscribe_during_dispatch_keeps_current_pass() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let victim: Arc<Mutex<Option<SubscriptionHandle<String>>>> = Arc::new(Mutex::new(None));

    let calls = Arc::new(Mutex::new(Vec::new()));
    let log = calls.clone();
    let target = victim.clone();
    bus.on("x", move |event: &Event<String>| {
        log.lock().push(format!("killer:{}", event.data()));
        if let Some(handle) = target.lock().as_ref() {
            handle.unsubscribe();
        }
    })
    .unwrap();

    let log = calls.clone();
    let handle = bus
        .on("x", move |event: &Event<String>| {
            log.lock().push(format!("victim:{}", event.data()))
        })
        .unwrap();
    *victim.lock() = Some(handle);

    bus.emit("x", "1".to_string()).unwrap();
    bus.emit("x", "2".to_string()).unwrap();

    assert_eq!(*calls.lock(), vec!["killer:1", "victim:1", "killer:2"]);
}

#[test]
fn test_self_unsubscribe_from_callback() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let slot: Arc<Mutex<Option<SubscriptionHandle<String>>>> = Arc::new(Mutex::new(None));
    let seen = Arc::new(Mutex::new(0));

    let own = slot.clone();
    let count = seen.clone();
    let handle = bus
        .on("x", move |_: &Event<String>| {
            *count.lock() += 1;
            if let Some(handle) = own.lock().as_ref() {
                handle.unsubscribe();
            }
        })
        .unwrap();
    *slot.lock() = Some(handle);

    bus.emit("x", "1".to_string()).unwrap();
    bus.emit("x", "2".to_string()).unwrap();
    assert_eq!(*seen.lock(), 1);
}

#[test]
fn test_emit_from_callback_keeps_channel_order() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    let republisher = bus.clone();
    bus.on("x", move |event: &Event<String>| {
        if event.data() == "ping" {
            republisher.emit("x", "pong".to_string()).unwrap();
        }
    })
    .unwrap();

    let (seen, _handle) = collect(&bus, "x");
    bus.emit("x", "ping".to_string()).unwrap();

    assert_eq!(*seen.lock(), vec!["ping", "pong"]);
    assert_eq!(payloads(&bus, "x"), vec!["ping", "pong"]);
}

#[test]
fn test_emit_from_replay_callback_waits_for_replay() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("x", "1".to_string()).unwrap();
    bus.emit("x", "2".to_string()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let republisher = bus.clone();
    bus.on("x", move |event: &Event<String>| {
        sink.lock().push(event.data().clone());
        if event.data() == "1" {
            republisher.emit("x", "99".to_string()).unwrap();
        }
    })
    .unwrap();

    assert_eq!(*seen.lock(), vec!["1", "2", "99"]);
    assert_eq!(payloads(&bus, "x"), vec!["1", "2", "99"]);
}

#[test]
fn test_subscribe_from_callback_replays_after_current_event() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("x", "old".to_string()).unwrap();

    let late = Arc::new(Mutex::new(Vec::new()));
    let sink = late.clone();
    let subscriber = bus.clone();
    let subscribed = Arc::new(Mutex::new(false));
    let once_only = subscribed.clone();
    bus.on("x", move |event: &Event<String>| {
        let mut done = once_only.lock();
        if event.data() == "new" && !*done {
            *done = true;
            let sink = sink.clone();
            subscriber
                .on("x", move |event: &Event<String>| {
                    sink.lock().push(event.data().clone())
                })
                .unwrap();
        }
    })
    .unwrap();

    bus.emit("x", "new".to_string()).unwrap();
    bus.emit("x", "later".to_string()).unwrap();

    // "new" reaches the late subscriber by replay only
    assert_eq!(*late.lock(), vec!["old", "new", "later"]);
}

// --- Middleware ---

#[test]
fn test_filter_middleware_drops_silently() {
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let bus: Emitter<String> = Emitter::new(
        EmitterConfig::new()
            .with_buffer(BufferConfig::new(StrategyKind::Fifo, 10, 0))
            .with_middleware(filter(|e: &Event<String>| !e.data().starts_with("spam")))
            .with_observer(move |e| sink.lock().push(e.clone())),
    )
    .unwrap();

    let (seen, _handle) = collect(&bus, "x");
    bus.emit("x", "hello".to_string()).unwrap();
    bus.emit("x", "spam offer".to_string()).unwrap();

    assert_eq!(*seen.lock(), vec!["hello"]);
    assert_eq!(payloads(&bus, "x"), vec!["hello"]);
    assert!(errors.lock().is_empty());
}

#[test]
fn test_use_middleware_appends_stage() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.emit("x", "before".to_string()).unwrap();

    bus.use_middleware(filter(|e: &Event<String>| e.data() != "blocked"))
        .unwrap();
    bus.emit("x", "blocked".to_string()).unwrap();
    bus.emit("x", "after".to_string()).unwrap();

    assert_eq!(payloads(&bus, "x"), vec!["before", "after"]);
}

#[test]
fn test_immediate_skips_middleware() {
    let bus = bus(StrategyKind::Fifo, 10, 0);
    bus.use_middleware(filter(|_: &Event<String>| false)).unwrap();

    bus.emit("x", "filtered".to_string()).unwrap();
    bus.emit_with("x", "urgent".to_string(), EmitOptions::default().immediate())
        .unwrap();

    assert_eq!(payloads(&bus, "x"), vec!["urgent"]);
}

// --- Metrics ---

#[test]
fn test_metrics_snapshot() {
    let bus = bus(StrategyKind::Fifo, 4, 0);
    let (_seen, _handle) = collect(&bus, "x");
    bus.emit("x", "1".to_string()).unwrap();
    bus.emit("x", "2".to_string()).unwrap();

    let metrics = bus.get_metrics().unwrap();
    assert_eq!(metrics.active_subscriptions, 1);
    assert!(metrics.events_per_second >= 2.0);
    assert!((metrics.buffer_utilization - 0.5).abs() < f64::EPSILON);
    assert!(metrics.memory_usage > 0);
    assert!(metrics.middleware_latency >= 0.0);

    let json = metrics.to_json().unwrap();
    assert!(json.contains("\"activeSubscriptions\":1"));

    // A snapshot does not track later changes
    bus.emit("x", "3".to_string()).unwrap();
    assert_eq!(metrics.buffer.total_events, 2);
}
