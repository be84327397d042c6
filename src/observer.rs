use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

pub(crate) type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

type HandlerList<E> = Mutex<Vec<(u64, Handler<E>)>>;

/// Ordered list of callbacks for one event type.
pub(crate) struct Observers<E> {
    next_id: AtomicU64,
    handlers: Arc<HandlerList<E>>,
}

impl<E: 'static> Observers<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            handlers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn subscribe(&self, handler: Handler<E>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().push((id, handler));

        let list: Weak<HandlerList<E>> = Arc::downgrade(&self.handlers);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(list) = list.upgrade() {
                    list.lock().retain(|(existing, _)| *existing != id);
                }
            })),
        }
    }

    /// Calls every handler in subscription order.
    ///
    /// The list is snapshotted first so handlers may subscribe or unsubscribe.
    pub(crate) fn notify(&self, event: &E) {
        let snapshot: Vec<Handler<E>> = self
            .handlers
            .lock()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in snapshot {
            handler(event);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.handlers.lock().len()
    }
}

/// Handle to a registered callback. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Remove the callback now.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }

    /// Keep the callback registered for the lifetime of the source.
    pub fn detach(mut self) {
        self.remove = None;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_subscription_order() {
        let observers = Observers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = {
            let seen = seen.clone();
            observers.subscribe(Arc::new(move |v: &u32| seen.lock().push(("first", *v))))
        };
        let s2 = {
            let seen = seen.clone();
            observers.subscribe(Arc::new(move |v: &u32| seen.lock().push(("second", *v))))
        };

        observers.notify(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
        drop((s1, s2));
    }

    #[test]
    fn unsubscribe_and_drop_remove_only_their_handler() {
        let observers = Observers::<()>::new();
        let a = observers.subscribe(Arc::new(|_| {}));
        let b = observers.subscribe(Arc::new(|_| {}));
        let c = observers.subscribe(Arc::new(|_| {}));
        assert_eq!(observers.len(), 3);

        a.unsubscribe();
        drop(c);
        assert_eq!(observers.len(), 1);

        b.detach();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn subscription_outliving_source_is_harmless() {
        let observers = Observers::<()>::new();
        let sub = observers.subscribe(Arc::new(|_| {}));
        drop(observers);
        sub.unsubscribe();
    }
}
