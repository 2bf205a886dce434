//! A small synchronous observer bus (§9 "Async/coroutines"): `subscribe`
//! returns an `Unsubscribe` handle; there is no async/await anywhere in the
//! engine, matching the single-threaded cooperative scheduling model (§5).

use std::sync::{Arc, Mutex};

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Slot<E> {
    id: u64,
    listener: Listener<E>,
}

/// A typed publish/subscribe channel. Cloning an `EventBus` shares the same
/// listener list (it's an `Arc<Mutex<_>>` underneath), matching the engine's
/// single-owned-instance model (§9): every clone of an `Engine` still notifies
/// the same subscribers.
pub struct EventBus<E> {
    listeners: Arc<Mutex<Vec<Slot<E>>>>,
    next_id: Arc<Mutex<u64>>,
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            listeners: self.listeners.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<E> Default for EventBus<E> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
            next_id: Arc::new(Mutex::new(0)),
        }
    }
}

impl<E> EventBus<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`, returning a handle that removes it when dropped
    /// or when `unsubscribe()` is called explicitly.
    pub fn subscribe<F>(&self, handler: F) -> Unsubscribe<E>
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let mut next_id = self.next_id.lock().unwrap();
        let id = *next_id;
        *next_id += 1;
        drop(next_id);

        self.listeners.lock().unwrap().push(Slot {
            id,
            listener: Arc::new(handler),
        });

        Unsubscribe {
            id,
            listeners: self.listeners.clone(),
            armed: true,
        }
    }

    pub fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.listener.clone())
            .collect();
        for listener in snapshot {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

/// Drop-to-unsubscribe handle; calling `unsubscribe()` early is equivalent
/// and idempotent.
pub struct Unsubscribe<E> {
    id: u64,
    listeners: Arc<Mutex<Vec<Slot<E>>>>,
    armed: bool,
}

impl<E> Unsubscribe<E> {
    pub fn unsubscribe(mut self) {
        self.remove();
        self.armed = false;
    }

    fn remove(&mut self) {
        self.listeners.lock().unwrap().retain(|s| s.id != self.id);
    }
}

impl<E> Drop for Unsubscribe<E> {
    fn drop(&mut self) {
        if self.armed {
            self.remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emitted_events_reach_every_live_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let _sub = bus.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        bus.emit(&5);
        bus.emit(&7);
        assert_eq!(count.load(Ordering::SeqCst), 12);
    }

    #[test]
    fn dropping_the_handle_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c1 = count.clone();
        let sub = bus.subscribe(move |v| {
            c1.fetch_add(*v as usize, Ordering::SeqCst);
        });
        drop(sub);
        bus.emit(&5);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(bus.listener_count(), 0);
    }
}
