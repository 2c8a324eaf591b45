//! Middleware stages run before an event is buffered and dispatched.
//!
//! Stages run in registration order. Each stage receives the event and a
//! [`Next`] continuation; awaiting `next.run()` runs the remaining stages.
//! A stage that returns without calling `next` drops the event, and a stage
//! that returns an error aborts processing of that one event.
//!
//! # Example
//!
//! ```ignore
//! struct Audit;
//!
//! #[async_trait]
//! impl Middleware<String> for Audit {
//!     async fn handle(&self, event: &Event<String>, next: Next<'_, String>) -> MiddlewareResult {
//!         tracing::info!(channel = event.channel(), "emitting");
//!         next.run().await
//!     }
//! }
//! ```

use crate::error::MiddlewareError;
use crate::types::Event;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of a stage.
pub type MiddlewareResult = Result<(), MiddlewareError>;

/// One interceptor in the chain.
#[async_trait]
pub trait Middleware<T>: Send + Sync + 'static {
    async fn handle(&self, event: &Event<T>, next: Next<'_, T>) -> MiddlewareResult;
}

/// Continuation to the rest of the chain.
pub struct Next<'a, T> {
    stages: &'a [Arc<dyn Middleware<T>>],
    event: &'a Event<T>,
    completed: &'a AtomicBool,
}

impl<'a, T: Sync + 'static> Next<'a, T> {
    /// Run the remaining stages. After the last stage this marks the event
    /// as accepted.
    pub fn run(self) -> BoxFuture<'a, MiddlewareResult> {
        match self.stages.split_first() {
            Some((stage, rest)) => stage.handle(
                self.event,
                Next {
                    stages: rest,
                    event: self.event,
                    completed: self.completed,
                },
            ),
            None => {
                self.completed.store(true, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            }
        }
    }
}

/// Run `event` through `stages`.
///
/// `Ok(true)` means every stage passed the event on; `Ok(false)` means a
/// stage stopped it without error.
pub async fn run_chain<T: Send + Sync + 'static>(
    stages: &[Arc<dyn Middleware<T>>],
    event: &Event<T>,
) -> Result<bool, MiddlewareError> {
    let completed = AtomicBool::new(false);
    Next {
        stages,
        event,
        completed: &completed,
    }
    .run()
    .await?;
    Ok(completed.load(Ordering::SeqCst))
}

/// Stage built from a synchronous check; `Ok` passes the event on.
pub struct Inspect<F>(F);

/// Wrap a synchronous check as a stage.
pub fn inspect<T, F>(check: F) -> Inspect<F>
where
    F: Fn(&Event<T>) -> MiddlewareResult + Send + Sync + 'static,
{
    Inspect(check)
}

#[async_trait]
impl<T, F> Middleware<T> for Inspect<F>
where
    T: Send + Sync + 'static,
    F: Fn(&Event<T>) -> MiddlewareResult + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event<T>, next: Next<'_, T>) -> MiddlewareResult {
        (self.0)(event)?;
        next.run().await
    }
}

/// Stage that silently drops events failing a predicate.
pub struct Filter<F>(F);

/// Keep only events for which `keep` returns true.
pub fn filter<T, F>(keep: F) -> Filter<F>
where
    F: Fn(&Event<T>) -> bool + Send + Sync + 'static,
{
    Filter(keep)
}

#[async_trait]
impl<T, F> Middleware<T> for Filter<F>
where
    T: Send + Sync + 'static,
    F: Fn(&Event<T>) -> bool + Send + Sync + 'static,
{
    async fn handle(&self, event: &Event<T>, next: Next<'_, T>) -> MiddlewareResult {
        if (self.0)(event) {
            next.run().await
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EmitOptions, EventId, Timestamp};
    use futures::executor::block_on;
    use parking_lot::Mutex;

    fn event(channel: &str, data: u32) -> Event<u32> {
        Event::new(
            EventId::generate(),
            channel.to_string(),
            data,
            Timestamp(0),
            &EmitOptions::default(),
        )
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware<u32> for Record {
        async fn handle(&self, _event: &Event<u32>, next: Next<'_, u32>) -> MiddlewareResult {
            self.log.lock().push(format!("{} before", self.name));
            let result = next.run().await;
            self.log.lock().push(format!("{} after", self.name));
            result
        }
    }

    #[test]
    fn test_empty_chain_accepts() {
        let accepted = block_on(run_chain::<u32>(&[], &event("c", 1))).unwrap();
        assert!(accepted);
    }

    #[test]
    fn test_stages_nest_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let stages: Vec<Arc<dyn Middleware<u32>>> = vec![
            Arc::new(Record {
                name: "a",
                log: log.clone(),
            }),
            Arc::new(Record {
                name: "b",
                log: log.clone(),
            }),
        ];

        assert!(block_on(run_chain(&stages, &event("c", 1))).unwrap());
        assert_eq!(
            *log.lock(),
            vec!["a before", "b before", "b after", "a after"]
        );
    }

    #[test]
    fn test_filter_stops_chain() {
        let stages: Vec<Arc<dyn Middleware<u32>>> = vec![Arc::new(filter(|e: &Event<u32>| {
            *e.data() > 10
        }))];

        assert!(!block_on(run_chain(&stages, &event("c", 1))).unwrap());
        assert!(block_on(run_chain(&stages, &event("c", 11))).unwrap());
    }

    #[test]
    fn test_inspect_error_aborts() {
        let stages: Vec<Arc<dyn Middleware<u32>>> = vec![
            Arc::new(inspect(|e: &Event<u32>| {
                if e.channel() == "blocked" {
                    Err("channel is blocked".into())
                } else {
                    Ok(())
                }
            })),
            Arc::new(filter(|_: &Event<u32>| true)),
        ];

        let err = block_on(run_chain(&stages, &event("blocked", 1))).unwrap_err();
        assert_eq!(err.to_string(), "channel is blocked");
        assert!(block_on(run_chain(&stages, &event("open", 1))).unwrap());
    }
}
