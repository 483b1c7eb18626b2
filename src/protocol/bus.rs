//! In-process publish/subscribe bus.
//!
//! Dispatch is direct and synchronous: `publish` runs every handler
//! registered for the event's type in registration order, awaited inline on
//! the publishing task. There is deliberately no intermediate queue: with a
//! single consumer draining a channel, a handler that publishes while the
//! consumer is blocked enqueueing deadlocks the whole service. The price is
//! that handlers must stay short and must not block on long I/O.
//!
//! No handler outcome propagates to the publisher; handlers act through
//! their own side effects (responding, closing a connection).

use std::collections::HashMap;
use std::future::Future;
use std::sync::RwLock;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::{error, trace};

use crate::error::constants::ERR_BUS_LOCK;
use crate::protocol::event::{Event, EventType};

type EventHandler = Box<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Event-type → ordered handler list.
pub struct Bus {
    handlers: RwLock<HashMap<EventType, Vec<EventHandler>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Append a handler to the given event type's dispatch list.
    pub fn register<F, Fut>(&self, event_type: EventType, handler: F)
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: EventHandler = Box::new(move |event| handler(event).boxed());
        match self.handlers.write() {
            Ok(mut handlers) => handlers.entry(event_type).or_default().push(boxed),
            Err(_) => error!(event_type = %event_type, "{ERR_BUS_LOCK}"),
        }
    }

    /// Invoke every handler registered for the event's type, in
    /// registration order, on the caller's task. Fire-and-forget.
    pub async fn publish(&self, event: Event) {
        trace!(event_type = %event.event_type, peer = %event.context.peer(), "publish");

        // Futures are collected with the lock held, awaited without it, so
        // a handler may publish (or register) without self-deadlocking.
        let pending: Vec<BoxFuture<'static, ()>> = match self.handlers.read() {
            Ok(handlers) => match handlers.get(&event.event_type) {
                Some(list) => list.iter().map(|h| h(event.clone())).collect(),
                None => return,
            },
            Err(_) => {
                error!(event_type = %event.event_type, "{ERR_BUS_LOCK}");
                return;
            }
        };

        for fut in pending {
            fut.await;
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}
