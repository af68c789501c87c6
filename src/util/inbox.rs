use std::collections::{BTreeMap, VecDeque};
use std::task::{Context, Poll, Waker};

use crate::{Error, Result};

/// Subscriber identifier, unique within one [`Inboxes`] collection.
pub(crate) type SubId = u64;

/// Delivery queue of a single logical subscriber. Items are received in the
/// order they were pushed. Once closed, the queue is drained and then reports
/// the end of the stream.
#[derive(Debug)]
pub(crate) struct Inbox<T> {
    items: VecDeque<T>,
    waker: Option<Waker>,
    closed: bool,
}

impl<T> Inbox<T> {
    /// Creates an empty, open inbox.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
            waker: None,
            closed: false,
        }
    }

    #[cfg(test)]
    /// Returns whether the inbox no longer accepts new items.
    #[inline(always)]
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Appends an item and wakes the receiver. Items pushed after the inbox is
    /// closed are discarded.
    #[inline]
    pub fn push(&mut self, v: T) {
        if !self.closed {
            self.items.push_back(v);
            self.wake();
        }
    }

    /// Marks the end of the stream.
    #[inline]
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.wake();
        }
    }

    /// Wakes the receiver without delivering an item.
    #[inline]
    pub fn wake(&mut self) {
        if let Some(w) = self.waker.take() {
            w.wake();
        }
    }

    /// Returns the next item, `None` at the end of the stream, or registers
    /// the waker of `cx` for the next change.
    pub fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Option<T>> {
        if let Some(v) = self.items.pop_front() {
            return Poll::Ready(Some(v));
        }
        if self.closed {
            return Poll::Ready(None);
        }
        match self.waker {
            Some(ref w) if w.will_wake(cx.waker()) => {}
            _ => self.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Default for Inbox<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

/// Inboxes of all subscribers attached to one coordinator. An inbox stays here
/// after its stream is terminated so that the subscriber can drain it, and is
/// only removed when the subscriber handle is dropped.
#[derive(Debug)]
pub(crate) struct Inboxes<T> {
    map: BTreeMap<SubId, Inbox<T>>,
    next_id: SubId,
}

impl<T> Inboxes<T> {
    /// Creates an empty collection.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Creates a new inbox and returns its subscriber ID.
    #[inline]
    pub fn open(&mut self) -> SubId {
        let id = self.next_id;
        self.next_id += 1;
        self.map.insert(id, Inbox::new());
        id
    }

    /// Returns the inbox of subscriber `id`.
    #[inline]
    pub fn get_mut(&mut self, id: SubId) -> Option<&mut Inbox<T>> {
        self.map.get_mut(&id)
    }

    /// Delivers `v` to subscriber `id`.
    #[inline]
    pub fn push(&mut self, id: SubId, v: T) {
        if let Some(ib) = self.map.get_mut(&id) {
            ib.push(v);
        }
    }

    /// Delivers a clone of `v` to each subscriber in `ids`, preserving the order
    /// of earlier deliveries.
    pub fn push_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a SubId>, v: &T)
    where
        T: Clone,
    {
        for &id in ids {
            self.push(id, v.clone());
        }
    }

    /// Delivers a clone of `v` to every subscriber.
    pub fn push_every(&mut self, v: &T)
    where
        T: Clone,
    {
        for ib in self.map.values_mut() {
            ib.push(v.clone());
        }
    }

    /// Closes the inbox of subscriber `id`.
    #[inline]
    pub fn close(&mut self, id: SubId) {
        if let Some(ib) = self.map.get_mut(&id) {
            ib.close();
        }
    }

    /// Polls the inbox of subscriber `id`. A missing inbox is reported as the
    /// end of the stream.
    #[inline]
    pub fn poll(&mut self, id: SubId, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.map.get_mut(&id).map_or(Poll::Ready(None), |ib| ib.poll(cx))
    }

    /// Removes the inbox of subscriber `id`, returning whether it existed.
    #[inline]
    pub fn remove(&mut self, id: SubId) -> bool {
        self.map.remove(&id).is_some()
    }

    /// Returns the number of inboxes, including closed ones.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Returns whether there are no inboxes.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<T> Inboxes<Result<T>> {
    /// Delivers error `e` to subscriber `id` and terminates its stream.
    #[inline]
    pub fn fail(&mut self, id: SubId, e: Error) {
        if let Some(ib) = self.map.get_mut(&id) {
            ib.push(Err(e));
            ib.close();
        }
    }

    /// Delivers a clone of error `e` to each subscriber in `ids` and terminates
    /// their streams.
    pub fn fail_all<'a>(&mut self, ids: impl IntoIterator<Item = &'a SubId>, e: &Error) {
        for &id in ids {
            self.fail(id, e.clone());
        }
    }
}

impl<T> Default for Inboxes<T> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
