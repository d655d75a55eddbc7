//! Small typed publish/subscribe used to surface mesh events.
//!
//! Handlers run synchronously in registration order on the emitting task. A
//! panicking handler is caught and logged; delivery always completes for the
//! remaining handlers. Subscriptions are RAII: dropping the [`Subscription`]
//! deregisters the handler, or tie one to a [`CancellationToken`] with
//! [`EventBus::on_until`].

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct HandlerSlot<E> {
    id: u64,
    token: Option<CancellationToken>,
    handler: Arc<dyn Fn(&E) + Send + Sync>,
}

struct BusShared<E> {
    handlers: Mutex<Vec<HandlerSlot<E>>>,
    next_id: AtomicU64,
}

/// Typed event bus. Cheap to clone; clones share the handler list.
pub struct EventBus<E> {
    shared: Arc<BusShared<E>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(BusShared {
                handlers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<E: 'static> EventBus<E> {
    /// Register a handler. The returned [`Subscription`] deregisters it on
    /// drop; call [`Subscription::detach`] to keep it for the bus lifetime.
    pub fn on<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(None, handler)
    }

    /// Register a handler whose lifetime is bounded by `token`: once the
    /// token is cancelled the handler is dropped at the next emit.
    pub fn on_until<F>(&self, token: &CancellationToken, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.register(Some(token.clone()), handler)
    }

    fn register<F>(&self, token: Option<CancellationToken>, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        self.shared.handlers.lock().push(HandlerSlot {
            id,
            token,
            handler: Arc::new(handler),
        });

        let weak: Weak<BusShared<E>> = Arc::downgrade(&self.shared);
        Subscription {
            cancel: Some(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.handlers.lock().retain(|slot| slot.id != id);
                }
            })),
        }
    }

    /// Deliver `event` to every live handler, in registration order.
    pub fn emit(&self, event: &E) {
        // Snapshot outside the lock so handlers may subscribe re-entrantly.
        let handlers: Vec<Arc<dyn Fn(&E) + Send + Sync>> = {
            let mut slots = self.shared.handlers.lock();
            slots.retain(|slot| slot.token.as_ref().is_none_or(|t| !t.is_cancelled()));
            slots.iter().map(|slot| slot.handler.clone()).collect()
        };
        for handler in handlers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::error!("event handler panicked; continuing delivery");
            }
        }
    }

    /// Number of live handlers (mainly for diagnostics and tests).
    pub fn handler_count(&self) -> usize {
        self.shared.handlers.lock().len()
    }
}

impl<E: Clone + Send + 'static> EventBus<E> {
    /// Bridge the bus into a channel for await-style consumers.
    pub fn stream(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.on(move |event: &E| {
            let _ = tx.send(event.clone());
        });
        EventStream {
            rx,
            _subscription: subscription,
        }
    }
}

/// Owns one handler registration; dropping it deregisters the handler.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Deregister now.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }

    /// Keep the handler registered for the lifetime of the bus.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// Receiver side of [`EventBus::stream`]; holds the subscription alive.
pub struct EventStream<E> {
    rx: mpsc::UnboundedReceiver<E>,
    _subscription: Subscription,
}

impl<E> EventStream<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}
