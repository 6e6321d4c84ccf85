//! Generic subscription list with idempotent disposer handles, used by the transport contract
//! (C2) and the peer facade's state-change/notification subscriptions (C11). Modeled as "event
//! emitters": a list of callbacks invoked in registration order; an exception in one callback must
//! not affect the others (§9 design notes).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Slot<T> {
    id: u64,
    callback: Callback<T>,
}

/// An ordered list of subscribers to events of type `T`.
pub struct EventEmitter<T> {
    next_id: AtomicU64,
    slots: Mutex<Vec<Slot<T>>>,
}

impl<T> EventEmitter<T> {
    pub fn new() -> Self {
        EventEmitter { next_id: AtomicU64::new(0), slots: Mutex::new(Vec::new()) }
    }

    /// Registers `callback`, returning a [`Disposer`] that removes it. Calling the disposer more
    /// than once, or after the emitter itself is gone, is a no-op.
    pub async fn subscribe<F>(self: &Arc<Self>, callback: F) -> Disposer
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.slots.lock().await.push(Slot { id, callback: Arc::new(callback) });

        let emitter = Arc::downgrade(self);
        Disposer::new(move || {
            if let Some(emitter) = emitter.upgrade() {
                let emitter = emitter.clone();
                tokio::spawn(async move {
                    emitter.slots.lock().await.retain(|slot| slot.id != id);
                });
            }
        })
    }

    /// Invokes every subscriber in registration order. A panicking callback is not caught here —
    /// callbacks are expected to be plain, infallible sinks (event emitters, not handlers).
    pub async fn emit(&self, event: &T) {
        let callbacks: Vec<Callback<T>> = self.slots.lock().await.iter().map(|s| s.callback.clone()).collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }
}

impl<T> Default for EventEmitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle that removes its associated subscription when invoked. Idempotent: calling `dispose`
/// (or dropping and discarding) more than once has no additional effect.
pub struct Disposer {
    fired: AtomicBool,
    dispose: Box<dyn Fn() + Send + Sync>,
}

impl Disposer {
    fn new<F: Fn() + Send + Sync + 'static>(dispose: F) -> Self {
        Disposer { fired: AtomicBool::new(false), dispose: Box::new(dispose) }
    }

    pub fn dispose(&self) {
        if !self.fired.swap(true, Ordering::SeqCst) {
            (self.dispose)();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test]
    async fn subscribers_invoked_in_registration_order() {
        let emitter = Arc::new(EventEmitter::<i32>::new());
        let log = Arc::new(StdMutex::new(Vec::new()));

        let log_a = log.clone();
        let _d1 = emitter.subscribe(move |v| log_a.lock().unwrap().push(("a", *v))).await;
        let log_b = log.clone();
        let _d2 = emitter.subscribe(move |v| log_b.lock().unwrap().push(("b", *v))).await;

        emitter.emit(&1).await;
        assert_eq!(*log.lock().unwrap(), vec![("a", 1), ("b", 1)]);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let emitter = Arc::new(EventEmitter::<i32>::new());
        let called = Arc::new(StdMutex::new(0));
        let called_clone = called.clone();
        let disposer = emitter.subscribe(move |_| *called_clone.lock().unwrap() += 1).await;

        disposer.dispose();
        disposer.dispose();
        tokio::task::yield_now().await;
        emitter.emit(&1).await;
        assert_eq!(*called.lock().unwrap(), 0);
    }
}
