//! # Topic Router
//!
//! Fans normalized events out to subscribers keyed by event type. A handler
//! subscribes to one or more topics; the topic `"*"` receives every event.
//! Wildcard handlers run before topic handlers, each inside a panic guard so
//! one misbehaving subscriber cannot take down the dispatch path or its
//! peers. Topics are case-insensitive and normalized to lowercase at the
//! registration boundary.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::core::client::ClientEvent;
use crate::core::emitter::Emitter;
use crate::core::event::NormalizedEvent;

/// A subscriber callback. Identity is the `Arc` allocation: registering the
/// same `Arc` on the same topic twice is a no-op, and the same `Arc` must be
/// passed back to unregister.
pub type Handler = Arc<dyn Fn(&Arc<NormalizedEvent>) + Send + Sync>;

#[derive(Default)]
struct Subscriptions {
    wildcards: Vec<Handler>,
    by_topic: HashMap<String, Vec<Handler>>,
}

struct Inner {
    subs: Mutex<Subscriptions>,
    detached: AtomicBool,
    token: CancellationToken,
}

pub struct Router {
    inner: Arc<Inner>,
}

impl Clone for Router {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subs: Mutex::new(Subscriptions::default()),
                detached: AtomicBool::new(false),
                token: CancellationToken::new(),
            }),
        }
    }

    /// Builds a router fed by an ingestion client's event stream. Only
    /// `Message` events reach subscribers; the rest of the stream is the
    /// client's concern.
    pub fn attach(events: &Emitter<ClientEvent>) -> Self {
        let router = Self::new();
        let feed = router.clone();
        events.on_with_token(router.inner.token.clone(), move |ev: &ClientEvent| {
            if let ClientEvent::Message(event) = ev {
                feed.dispatch(event);
            }
        });
        router
    }

    /// Severs the feed and disables further registration. Terminal.
    pub fn detach(&self) {
        self.inner.detached.store(true, Ordering::SeqCst);
        self.inner.token.cancel();
    }

    /// Subscribes `handler` to each topic in `topics`. `"*"` subscribes to
    /// everything. Duplicate `(handler, topic)` pairs are ignored.
    pub fn register<I, S>(&self, topics: I, handler: &Handler)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.inner.detached.load(Ordering::SeqCst) {
            log::warn!("Router is detached; ignoring registration");
            return;
        }

        let mut subs = self.inner.subs.lock().expect("Router lock poisoned");
        for topic in topics {
            let topic = topic.as_ref().to_lowercase();
            let slot = if topic == "*" {
                &mut subs.wildcards
            } else {
                subs.by_topic.entry(topic).or_default()
            };
            if !slot.iter().any(|h| Arc::ptr_eq(h, handler)) {
                slot.push(Arc::clone(handler));
            }
        }
    }

    /// Like [`register`](Self::register), but the subscription is dropped
    /// when `token` is cancelled.
    pub fn register_with_token<I, S>(&self, token: CancellationToken, topics: I, handler: &Handler)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let topics: Vec<String> = topics
            .into_iter()
            .map(|t| t.as_ref().to_lowercase())
            .collect();
        self.register(topics.iter(), handler);

        let router = self.clone();
        let handler = Arc::clone(handler);
        tokio::spawn(async move {
            token.cancelled().await;
            router.unregister(&handler, Some(topics.iter()));
        });
    }

    /// Removes `handler` from the given topics, or from every topic when
    /// `topics` is `None`. Topic lists emptied by the removal are pruned.
    pub fn unregister<I, S>(&self, handler: &Handler, topics: Option<I>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut subs = self.inner.subs.lock().expect("Router lock poisoned");
        match topics {
            Some(topics) => {
                for topic in topics {
                    let topic = topic.as_ref().to_lowercase();
                    if topic == "*" {
                        subs.wildcards.retain(|h| !Arc::ptr_eq(h, handler));
                    } else if let Some(slot) = subs.by_topic.get_mut(&topic) {
                        slot.retain(|h| !Arc::ptr_eq(h, handler));
                        if slot.is_empty() {
                            subs.by_topic.remove(&topic);
                        }
                    }
                }
            }
            None => {
                subs.wildcards.retain(|h| !Arc::ptr_eq(h, handler));
                subs.by_topic.retain(|_, slot| {
                    slot.retain(|h| !Arc::ptr_eq(h, handler));
                    !slot.is_empty()
                });
            }
        }
    }

    /// Delivers `event` to every wildcard handler, then to the handlers
    /// subscribed to its event type. Handler panics are contained and logged.
    pub fn dispatch(&self, event: &Arc<NormalizedEvent>) {
        if self.inner.detached.load(Ordering::SeqCst) {
            return;
        }

        let handlers: Vec<Handler> = {
            let subs = self.inner.subs.lock().expect("Router lock poisoned");
            let mut handlers: Vec<Handler> = subs.wildcards.iter().cloned().collect();
            if let Some(slot) = subs.by_topic.get(event.event_type()) {
                handlers.extend(slot.iter().cloned());
            }
            handlers
        };

        for handler in handlers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(event))) {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                log::error!(
                    "Subscriber panicked while handling {}: {detail}",
                    event.event_type()
                );
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let subs = self.inner.subs.lock().expect("Router lock poisoned");
        subs.wildcards.len() + subs.by_topic.values().map(Vec::len).sum::<usize>()
    }
}
