//! External event sources the running engine polls into its queue.

use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use evsched_event::Event;
use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::Context;
use crate::error::panic_message;

/// Produces events from outside the engine
///
/// Each source is polled on its own task every `source_poll_interval` while the
/// engine runs. Returned events are submitted to the local queue.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Events that became available since the previous call.
    async fn fetch(&self, ctx: &Context) -> anyhow::Result<Vec<Event>>;
}

/// Adapts an async closure into an [`EventSource`]; see [`source_fn`].
pub struct FnSource<F> {
    name: String,
    f: F,
}

impl<F> Debug for FnSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnSource")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> EventSource for FnSource<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Event>>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &Context) -> anyhow::Result<Vec<Event>> {
        (self.f)(ctx.clone()).await
    }
}

/// Wrap an async closure as a named source.
pub fn source_fn<F, Fut>(name: impl Into<String>, f: F) -> FnSource<F>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Vec<Event>>> + Send + 'static,
{
    FnSource {
        name: name.into(),
        f,
    }
}

/// Poll `source` until `cancel` fires. Failures and panics are logged and the
/// next poll goes ahead.
pub(crate) async fn poll_source(
    source: Arc<dyn EventSource>,
    ctx: Context,
    period: Duration,
    cancel: CancellationToken,
) {
    info!("Polling event source {}", source.name());
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            fetched = AssertUnwindSafe(source.fetch(&ctx)).catch_unwind() => fetched,
        };

        match fetched {
            Ok(Ok(events)) => {
                if !events.is_empty() {
                    debug!("Event source {} produced {} events", source.name(), events.len());
                }
                for event in events {
                    ctx.submit(event);
                }
            }
            Ok(Err(e)) => error!("Event source {} failed: {:#}", source.name(), e),
            Err(panic) => error!(
                "Event source {} panicked: {}",
                source.name(),
                panic_message(panic.as_ref())
            ),
        }
    }

    info!("Stopped polling event source {}", source.name());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineState;
    use crate::queue::{EventQueue, ReplyQueue};
    use parking_lot::RwLock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn context(queue: Arc<EventQueue>) -> Context {
        Context::new(
            "sourced".to_string(),
            "rpc_sourced".to_string(),
            queue,
            Arc::new(ReplyQueue::new()),
            false,
            Arc::new(RwLock::new(EngineState::Active)),
            CancellationToken::new(),
        )
    }

    #[traced_test]
    #[tokio::test]
    async fn test_failures_and_panics_do_not_stop_polling() {
        let queue = Arc::new(EventQueue::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let source = source_fn("flaky", move |_ctx| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                match call {
                    0 => anyhow::bail!("feed offline"),
                    1 => panic!("feed corrupted"),
                    _ => anyhow::Ok(vec![Event::new("quote", json!(call))?]),
                }
            }
        });
        let cancel = CancellationToken::new();
        let polling = tokio::spawn(poll_source(
            Arc::new(source),
            context(queue.clone()),
            Duration::from_millis(5),
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        polling.await.unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert!(logs_contain("feed offline"));
        assert!(logs_contain("feed corrupted"));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_slow_fetch() {
        let source = source_fn("stuck", |_ctx| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        });
        let cancel = CancellationToken::new();
        let polling = tokio::spawn(poll_source(
            Arc::new(source),
            context(Arc::new(EventQueue::new())),
            Duration::from_millis(5),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), polling)
            .await
            .unwrap()
            .unwrap();
    }
}
