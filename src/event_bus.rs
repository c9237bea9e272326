//! Typed publish/subscribe over [`Event`](crate::model::Event).
//!
//! `publish` awaits all handlers registered for the event's kind concurrently and
//! isolates failures: a handler that errors is logged and does not prevent the
//! others from observing the event.

use crate::model::{Event, EventKind};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::error;

pub type HandlerResult = Result<(), String>;
pub type BoxedHandler =
    Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<HashMap<EventKind, Vec<BoxedHandler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every event of a given kind. Handlers for the same
    /// kind are invoked in subscription order, but may run concurrently with each
    /// other — no ordering is provided across handlers of one event.
    pub async fn subscribe(&self, kind: EventKind, handler: BoxedHandler) {
        self.handlers.write().await.entry(kind).or_default().push(handler);
    }

    /// Fans `event` out to every handler subscribed to its kind and awaits them
    /// all. A handler returning `Err` is logged with context; it never prevents
    /// sibling handlers from running, nor does it propagate to the publisher.
    pub async fn publish(&self, event: Event) {
        let kind = event.kind();
        let subscribers = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned().unwrap_or_default()
        };
        if subscribers.is_empty() {
            return;
        }

        let mut set = JoinSet::new();
        for handler in subscribers {
            let event = event.clone();
            set.spawn(async move { handler(event).await });
        }

        while let Some(outcome) = set.join_next().await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(message)) => {
                    error!(file_identity = %event.file_identity(), %message, "event handler failed");
                }
                Err(join_error) => {
                    error!(file_identity = %event.file_identity(), %join_error, "event handler panicked");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileId;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn discovered_event(file_identity: FileId) -> Event {
        Event::FileDiscovered {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            file_identity,
        }
    }

    #[tokio::test]
    async fn all_handlers_run_despite_one_failing() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let c1 = calls.clone();
        bus.subscribe(
            EventKind::FileDiscovered,
            Arc::new(move |_event| {
                let c1 = c1.clone();
                Box::pin(async move {
                    c1.fetch_add(1, Ordering::SeqCst);
                    Err("boom".to_string())
                })
            }),
        )
        .await;

        let c2 = calls.clone();
        bus.subscribe(
            EventKind::FileDiscovered,
            Arc::new(move |_event| {
                let c2 = c2.clone();
                Box::pin(async move {
                    c2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await;

        bus.publish(discovered_event(Uuid::new_v4())).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.publish(discovered_event(Uuid::new_v4())).await;
    }
}
