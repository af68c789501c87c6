//! Broadcast points that turn one-shot adapter callbacks into streams with
//! any number of subscribers.

use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;

use crate::util::{Inboxes, SharedState, SubId};

/// Source of events that can be observed by multiple independent subscribers.
/// A subscription receives every event published after it was created, in
/// publication order, and unsubscribes when dropped.
pub trait EventSource<T> {
    /// Registers a new subscriber.
    fn subscribe(&self) -> Subscription<T>;
}

/// Publish-only broadcast point. Events are not replayed to late subscribers.
pub struct Broadcast<T>(Arc<SharedState<Inboxes<T>>>);

impl<T: Clone> Broadcast<T> {
    /// Creates a broadcast point with no subscribers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(SharedState::new(Inboxes::new())))
    }

    /// Delivers `v` to all current subscribers.
    pub fn publish(&self, v: &T) {
        self.0.write(|ibs| ibs.push_every(v));
    }

    /// Delivers `v` to all current subscribers if `f` returns `true`. `f` is
    /// called while subscriptions are blocked, so no subscriber can observe
    /// its effect without also receiving `v`.
    pub fn publish_if(&self, v: &T, f: impl FnOnce() -> bool) -> bool {
        self.0.write(|ibs| {
            let ok = f();
            if ok {
                ibs.push_every(v);
            }
            ok
        })
    }

    /// Registers a new subscriber and calls `f` before any other event can be
    /// published. This allows reading a current value that is consistent with
    /// the events received afterwards.
    pub fn subscribe_with<R>(&self, f: impl FnOnce() -> R) -> (Subscription<T>, R) {
        let (id, r) = self.0.write(|ibs| (ibs.open(), f()));
        let sub = Subscription {
            src: Arc::clone(&self.0),
            id,
        };
        (sub, r)
    }

    /// Returns the number of current subscribers.
    #[inline]
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.0.read(Inboxes::len)
    }
}

impl<T: Clone> EventSource<T> for Broadcast<T> {
    fn subscribe(&self) -> Subscription<T> {
        Subscription {
            src: Arc::clone(&self.0),
            id: self.0.write(Inboxes::open),
        }
    }
}

impl<T: Clone> Default for Broadcast<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for Broadcast<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("subscribers", &self.0.read(Inboxes::len))
            .finish()
    }
}

/// Subscription to a [`Broadcast`]. The stream never ends on its own.
#[must_use = "streams do nothing unless polled"]
pub struct Subscription<T> {
    src: Arc<SharedState<Inboxes<T>>>,
    id: SubId,
}

impl<T> Stream for Subscription<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let id = self.id;
        self.src.write(|ibs| ibs.poll(id, cx))
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let id = self.id;
        self.src.write(|ibs| ibs.remove(id));
    }
}

impl<T> Debug for Subscription<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
