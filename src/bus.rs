//! Synchronous publish/subscribe fan-out.
//!
//! All components talk through one [`Bus`]. Handlers run on the publishing
//! thread, in registration order. A handler may itself publish: nested
//! publishes are queued and drained by the outermost `publish` frame after
//! the current event has reached every handler, so every subscriber observes
//! the same total event order.
//!
//! Handler failures (an `Err` return or a panic) never abort dispatch of the
//! current event; they are delivered to the error subscribers, or logged if
//! there are none.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::error;

use crate::error::{MarlinError, Result};
use crate::events::Event;

type Handler = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&MarlinError) + Send + Sync>;

thread_local! {
    /// Deferred-publish queues of the dispatch loops active on this thread,
    /// keyed per bus so independent buses never drain each other's events.
    static PENDING: RefCell<Vec<(usize, VecDeque<Event>)>> = const { RefCell::new(Vec::new()) };
}

#[derive(Default)]
struct Registry {
    handlers: Vec<(u64, Handler)>,
    error_handlers: Vec<(u64, ErrorHandler)>,
}

#[derive(Default)]
struct BusInner {
    registry: Mutex<Registry>,
    /// Serializes dispatch loops across threads so the total event order is
    /// the same for every subscriber.
    dispatch: Mutex<()>,
    next_id: AtomicU64,
}

/// Cheaply clonable handle to the shared bus.
#[derive(Clone, Default)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event handler. Dropping the returned [`Subscription`]
    /// unregisters it.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_registry().handlers.push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: SubKind::Event,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Register a handler for faults raised by event handlers.
    #[must_use = "dropping the subscription unregisters the handler"]
    pub fn subscribe_errors<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&MarlinError) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock_registry()
            .error_handlers
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: SubKind::Error,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber.
    ///
    /// When called from inside a handler the event is queued and dispatched
    /// by the outermost `publish` on this thread, after the in-flight event
    /// has reached all handlers.
    pub fn publish(&self, event: Event) {
        let key = Arc::as_ptr(&self.inner) as usize;
        let nested = PENDING.with(|p| {
            let mut frames = p.borrow_mut();
            match frames.iter_mut().find(|(k, _)| *k == key) {
                Some((_, queue)) => {
                    queue.push_back(event.clone());
                    true
                }
                None => {
                    frames.push((key, VecDeque::new()));
                    false
                }
            }
        });
        if nested {
            return;
        }

        // Removes the frame even if dispatch unwinds, so a panicking
        // handler cannot leave the thread treating every later publish as
        // nested.
        let _frame = FrameGuard { key };
        let _guard = self
            .inner
            .dispatch
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        self.dispatch_one(&event);
        loop {
            let next = PENDING.with(|p| {
                p.borrow_mut()
                    .iter_mut()
                    .find(|(k, _)| *k == key)
                    .and_then(|(_, queue)| queue.pop_front())
            });
            match next {
                Some(event) => self.dispatch_one(&event),
                None => break,
            }
        }
    }

    fn dispatch_one(&self, event: &Event) {
        // Snapshot under the lock, call outside it: handlers may subscribe
        // or unsubscribe while running.
        let handlers: Vec<Handler> = self
            .lock_registry()
            .handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(event)));
            let fault = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(panic) => MarlinError::Handler(panic_message(panic)),
            };
            self.deliver_fault(&fault);
        }
    }

    fn deliver_fault(&self, fault: &MarlinError) {
        let error_handlers: Vec<ErrorHandler> = self
            .lock_registry()
            .error_handlers
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();
        if error_handlers.is_empty() {
            error!(%fault, "unhandled event handler fault");
            return;
        }
        for handler in error_handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(fault))) {
                error!(message = %panic_message(panic), "error subscriber panicked");
            }
        }
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Removes this thread's deferred-publish frame for one bus on drop, so the
/// frame never outlives its dispatch loop.
struct FrameGuard {
    key: usize,
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        PENDING.with(|p| p.borrow_mut().retain(|(k, _)| *k != self.key));
    }
}

#[derive(Clone, Copy)]
enum SubKind {
    Event,
    Error,
}

/// RAII registration handle; dropping it removes the handler.
pub struct Subscription {
    id: u64,
    kind: SubKind,
    bus: Weak<BusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut registry = inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        match self.kind {
            SubKind::Event => registry.handlers.retain(|(id, _)| *id != self.id),
            SubKind::Error => registry.error_handlers.retain(|(id, _)| *id != self.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn seen(log: &Mutex<Vec<Event>>) -> Vec<Event> {
        log.lock().unwrap().clone()
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = Bus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = Arc::clone(&order);
        let o2 = Arc::clone(&order);
        let _a = bus.subscribe(move |_| {
            o1.lock().unwrap().push(1);
            Ok(())
        });
        let _b = bus.subscribe(move |_| {
            o2.lock().unwrap().push(2);
            Ok(())
        });
        bus.publish(Event::Connected);
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn nested_publish_is_deferred_until_current_event_completes() {
        let bus = Bus::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let republisher = {
            let bus = bus.clone();
            let log = Arc::clone(&log);
            bus.clone().subscribe(move |event| {
                log.lock().unwrap().push(event.clone());
                if *event == Event::Connected {
                    bus.publish(Event::BookChanged);
                }
                Ok(())
            })
        };
        let observer = {
            let log = Arc::clone(&log);
            bus.subscribe(move |event| {
                log.lock().unwrap().push(event.clone());
                Ok(())
            })
        };

        bus.publish(Event::Connected);

        // Both handlers see Connected before either sees the nested event.
        assert_eq!(
            seen(&log),
            vec![
                Event::Connected,
                Event::Connected,
                Event::BookChanged,
                Event::BookChanged,
            ]
        );
        drop((republisher, observer));
    }

    #[test]
    fn failing_handler_does_not_stop_dispatch() {
        let bus = Bus::new();
        let delivered = Arc::new(AtomicUsize::new(0));
        let faults = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(|_| Err(MarlinError::Handler("boom".to_string())));
        let _good = {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        let _errs = {
            let faults = Arc::clone(&faults);
            bus.subscribe_errors(move |_| {
                faults.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.publish(Event::Connected);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(faults.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_handler_is_reported_as_fault() {
        let bus = Bus::new();
        let faults = Arc::new(Mutex::new(Vec::new()));

        let _bad = bus.subscribe(|_| panic!("handler exploded"));
        let _errs = {
            let faults = Arc::clone(&faults);
            bus.subscribe_errors(move |fault| {
                faults.lock().unwrap().push(fault.to_string());
            })
        };

        bus.publish(Event::Connected);
        let faults = faults.lock().unwrap();
        assert_eq!(faults.len(), 1);
        assert!(faults[0].contains("handler exploded"));
    }

    #[test]
    fn publish_survives_panicking_error_subscriber() {
        let bus = Bus::new();
        let _bad = bus.subscribe(|_| panic!("handler exploded"));
        let _worse = bus.subscribe_errors(|_| panic!("error subscriber exploded"));
        bus.publish(Event::Connected);

        // The thread must still dispatch normally afterwards.
        let delivered = Arc::new(AtomicUsize::new(0));
        let _good = {
            let delivered = Arc::clone(&delivered);
            bus.subscribe(move |_| {
                delivered.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        bus.publish(Event::BookChanged);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_subscription_unregisters_handler() {
        let bus = Bus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sub = {
            let count = Arc::clone(&count);
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        };
        bus.publish(Event::Connected);
        drop(sub);
        bus.publish(Event::Connected);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn handler_may_subscribe_during_dispatch() {
        let bus = Bus::new();
        let extra: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let _sub = {
            let bus = bus.clone();
            let extra = Arc::clone(&extra);
            let count = Arc::clone(&count);
            bus.clone().subscribe(move |_| {
                let count = Arc::clone(&count);
                extra.lock().unwrap().push(bus.subscribe(move |_| {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }));
                Ok(())
            })
        };

        bus.publish(Event::Connected);
        // The handler registered mid-dispatch only sees later events.
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.publish(Event::BookChanged);
        assert!(count.load(Ordering::SeqCst) >= 1);
    }
}
