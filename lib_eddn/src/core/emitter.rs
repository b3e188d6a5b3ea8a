//! # Typed Event Emitter
//!
//! Small synchronous observable used at every seam of the ingestion pipeline:
//! the transport, the ingestion client and the router all expose their event
//! streams through an `Emitter`. Listeners are plain closures invoked in
//! registration order; registration hands back a [`Cancellation`] handle, and
//! a listener can alternatively be bound to a `CancellationToken` so that a
//! whole group of handlers is severed in one call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio_util::sync::CancellationToken;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Listener<E> {
    id: u64,
    token: Option<CancellationToken>,
    callback: Callback<E>,
}

struct Shared<E> {
    listeners: Mutex<Vec<Listener<E>>>,
    next_id: AtomicU64,
}

/// Handle returned by [`Emitter::on`]. Dropping it does nothing; calling
/// [`Cancellation::cancel`] removes the listener. Cancelling twice is a no-op.
pub struct Cancellation {
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl Cancellation {
    pub fn cancel(&self) {
        (self.cancel)()
    }
}

/// A typed, thread-safe event emitter.
///
/// `emit` runs every live listener synchronously on the calling task, which
/// preserves the arrival-order processing guarantee of the pipeline: a frame
/// is handled to completion before the next one is looked at.
pub struct Emitter<E> {
    shared: Arc<Shared<E>>,
}

impl<E: 'static> Clone for Emitter<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E: 'static> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

// The cancellation handle holds a `Weak` to the listener table inside an
// owned closure, so the event type must not borrow.
impl<E: 'static> Emitter<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                listeners: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Registers a listener and returns its cancellation handle.
    pub fn on<F>(&self, callback: F) -> Cancellation
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(None, Arc::new(callback))
    }

    /// Registers a listener tied to a `CancellationToken`. Once the token is
    /// cancelled the listener stops firing and is pruned on the next emit.
    pub fn on_with_token<F>(&self, token: CancellationToken, callback: F) -> Cancellation
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.insert(Some(token), Arc::new(callback))
    }

    fn insert(&self, token: Option<CancellationToken>, callback: Callback<E>) -> Cancellation {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut listeners = self.shared.listeners.lock().expect("Emitter lock poisoned");
            listeners.push(Listener {
                id,
                token,
                callback,
            });
        }

        let weak: Weak<Shared<E>> = Arc::downgrade(&self.shared);
        Cancellation {
            cancel: Arc::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let mut listeners = shared.listeners.lock().expect("Emitter lock poisoned");
                    listeners.retain(|l| l.id != id);
                }
            }),
        }
    }

    /// Dispatches `event` to every live listener, in registration order.
    ///
    /// Listeners whose token has been cancelled are removed here rather than
    /// eagerly; the callback snapshot is taken under the lock and invoked
    /// outside it, so a listener may re-register or cancel without deadlock.
    pub fn emit(&self, event: &E) {
        let callbacks: Vec<Callback<E>> = {
            let mut listeners = self.shared.listeners.lock().expect("Emitter lock poisoned");
            listeners.retain(|l| l.token.as_ref().map_or(true, |t| !t.is_cancelled()));
            listeners.iter().map(|l| Arc::clone(&l.callback)).collect()
        };

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        let mut listeners = self.shared.listeners.lock().expect("Emitter lock poisoned");
        listeners.retain(|l| l.token.as_ref().map_or(true, |t| !t.is_cancelled()));
        listeners.len()
    }

    /// Drops every registered listener.
    pub fn clear(&self) {
        self.shared
            .listeners
            .lock()
            .expect("Emitter lock poisoned")
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn listeners_fire_in_registration_order() {
        let emitter: Emitter<u32> = Emitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["a", "b", "c"] {
            let seen = Arc::clone(&seen);
            emitter.on(move |v: &u32| seen.lock().unwrap().push(format!("{tag}{v}")));
        }

        emitter.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["a7", "b7", "c7"]);
    }

    #[test]
    fn cancellation_removes_listener_and_is_idempotent() {
        let emitter: Emitter<()> = Emitter::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        let cancel = emitter.on(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        emitter.emit(&());
        cancel.cancel();
        cancel.cancel();
        emitter.emit(&());

        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert_eq!(emitter.listener_count(), 0);
    }

    #[test]
    fn token_cancellation_silences_listener() {
        let emitter: Emitter<()> = Emitter::new();
        let token = CancellationToken::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = Arc::clone(&hits);
        emitter.on_with_token(token.clone(), move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        emitter.emit(&());
        token.cancel();
        emitter.emit(&());

        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
