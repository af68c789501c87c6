//! Subscription serializer.
//!
//! Runs at most one underlying hardware operation at a time on behalf of any
//! number of logical subscribers. A subscriber either attaches to the active
//! operation and shares its output, or waits in a FIFO queue until the active
//! operation ends. The serializer does not lock anything itself; it is always
//! embedded in coordinator state guarded by [`crate::util::SharedState`].

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Debug;
use std::task::{Context, Poll};

use crate::util::{Inboxes, SubId};
use crate::{Error, Result};

/// Operation request managed by a [`Serializer`].
pub(crate) trait Request: Clone + Debug {
    /// Item type delivered to subscribers.
    type Output: Clone + Debug;

    /// Returns whether this request can be satisfied by the already active
    /// request `active` instead of waiting for its own turn.
    fn joins(&self, active: &Self) -> bool;

    /// Returns whether the underlying operation can be stopped once it has no
    /// subscribers. Operations that cannot be stopped keep the serializer busy
    /// until they complete.
    fn is_stoppable(&self) -> bool;
}

/// Side effects of a state transition that the owner must apply to the
/// adapter.
#[derive(Debug)]
#[must_use]
pub(crate) struct Step<R> {
    /// Active request that lost its last subscriber and must be stopped.
    pub stop: Option<R>,
    /// Request that became active and must be started.
    pub start: Option<R>,
}

impl<R> Default for Step<R> {
    #[inline]
    fn default() -> Self {
        Self {
            stop: None,
            start: None,
        }
    }
}

/// Active operation with its attached subscribers.
#[derive(Debug)]
struct Active<R> {
    req: R,
    subs: BTreeSet<SubId>,
}

/// Serializer state machine: idle when `active` is `None`.
#[derive(Debug)]
pub(crate) struct Serializer<R: Request> {
    active: Option<Active<R>>,
    queue: VecDeque<(SubId, R)>,
    inboxes: Inboxes<Result<R::Output>>,
}

impl<R: Request> Serializer<R> {
    /// Creates an idle serializer.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: None,
            queue: VecDeque::new(),
            inboxes: Inboxes::new(),
        }
    }

    /// Returns the active request.
    #[inline]
    #[must_use]
    pub fn active(&self) -> Option<&R> {
        self.active.as_ref().map(|a| &a.req)
    }

    #[cfg(test)]
    /// Returns the number of subscribers attached to the active request.
    #[inline]
    #[must_use]
    pub fn active_subs(&self) -> usize {
        self.active.as_ref().map_or(0, |a| a.subs.len())
    }

    #[cfg(test)]
    /// Returns the number of queued requests.
    #[inline]
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Returns whether the serializer has no active or queued requests and no
    /// undrained subscriber inboxes.
    #[inline]
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty() && self.inboxes.is_empty()
    }

    /// Adds a subscriber for request `req`. The returned step contains `req` in
    /// `start` if it became the active request.
    pub fn subscribe(&mut self, req: R) -> (SubId, Step<R>) {
        let id = self.inboxes.open();
        let mut step = Step::default();
        match self.active {
            None => {
                step.start = Some(req.clone());
                self.active = Some(Active {
                    req,
                    subs: BTreeSet::from([id]),
                });
            }
            Some(ref mut a) if self.queue.is_empty() && req.joins(&a.req) => {
                a.subs.insert(id);
            }
            Some(_) => self.queue.push_back((id, req)),
        }
        (id, step)
    }

    /// Removes subscriber `id`. If it was the last subscriber of a stoppable
    /// active request, that request is stopped and the next queued request is
    /// started.
    pub fn unsubscribe(&mut self, id: SubId) -> Step<R> {
        self.inboxes.remove(id);
        if let Some(i) = self.queue.iter().position(|&(q, _)| q == id) {
            self.queue.remove(i);
            return Step::default();
        }
        let Some(ref mut a) = self.active else {
            return Step::default();
        };
        if !a.subs.remove(&id) || !a.subs.is_empty() || !a.req.is_stoppable() {
            return Step::default();
        }
        let stop = self.active.take().map(|a| a.req);
        Step {
            stop,
            start: self.promote(),
        }
    }

    /// Delivers an item from the active operation to all of its subscribers.
    pub fn publish(&mut self, v: &R::Output) {
        if let Some(ref a) = self.active {
            self.inboxes.push_all(&a.subs, &Ok(v.clone()));
        }
    }

    /// Completes the active operation, delivering its final result to all of
    /// its subscribers and starting the next queued request, if any.
    pub fn complete(&mut self, r: Result<R::Output>) -> Step<R> {
        let Some(a) = self.active.take() else {
            return Step::default();
        };
        match r {
            Ok(v) => {
                self.inboxes.push_all(&a.subs, &Ok(v));
                for &id in &a.subs {
                    self.inboxes.close(id);
                }
            }
            Err(ref e) => self.inboxes.fail_all(&a.subs, e),
        }
        Step {
            stop: None,
            start: self.promote(),
        }
    }

    /// Fails the active operation and all queued requests without starting or
    /// stopping anything. Used when the hardware has already invalidated the
    /// operation.
    pub fn fail_all(&mut self, e: &Error) {
        if let Some(a) = self.active.take() {
            self.inboxes.fail_all(&a.subs, e);
        }
        for (id, _) in self.queue.drain(..) {
            self.inboxes.fail(id, e.clone());
        }
    }

    /// Polls the inbox of subscriber `id`.
    #[inline]
    pub fn poll(&mut self, id: SubId, cx: &mut Context<'_>) -> Poll<Option<Result<R::Output>>> {
        self.inboxes.poll(id, cx)
    }

    /// Makes the oldest queued request active.
    fn promote(&mut self) -> Option<R> {
        debug_assert!(self.active.is_none());
        let (id, req) = self.queue.pop_front()?;
        self.active = Some(Active {
            req: req.clone(),
            subs: BTreeSet::from([id]),
        });
        Some(req)
    }
}

impl<R: Request> Default for Serializer<R> {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use matches::assert_matches;

    use super::*;
    use crate::AdapterState;

    /// Request that joins only requests with the same key.
    #[derive(Clone, Debug, Eq, PartialEq)]
    struct Req {
        key: u8,
        stoppable: bool,
    }

    impl Req {
        const fn new(key: u8) -> Self {
            Self {
                key,
                stoppable: true,
            }
        }
    }

    impl Request for Req {
        type Output = u32;

        fn joins(&self, active: &Self) -> bool {
            self.key == active.key
        }

        fn is_stoppable(&self) -> bool {
            self.stoppable
        }
    }

    async fn try_next(s: &mut Serializer<Req>, id: SubId) -> Option<Option<Result<u32>>> {
        poll_fn(|cx| match s.poll(id, cx) {
            Poll::Ready(v) => Poll::Ready(Some(v)),
            Poll::Pending => Poll::Ready(None),
        })
        .await
    }

    #[tokio::test]
    async fn fan_out_and_last_unsubscribe() {
        let mut s = Serializer::new();
        let (a, step) = s.subscribe(Req::new(1));
        assert_eq!(step.start, Some(Req::new(1)));
        let (b, step) = s.subscribe(Req::new(1));
        assert!(step.start.is_none());
        assert_eq!(s.active_subs(), 2);

        s.publish(&10);
        s.publish(&20);
        for id in [a, b] {
            assert_matches!(try_next(&mut s, id).await, Some(Some(Ok(10))));
            assert_matches!(try_next(&mut s, id).await, Some(Some(Ok(20))));
            assert_matches!(try_next(&mut s, id).await, None);
        }

        let step = s.unsubscribe(a);
        assert!(step.stop.is_none());
        s.publish(&30);
        assert_matches!(try_next(&mut s, b).await, Some(Some(Ok(30))));
        let step = s.unsubscribe(b);
        assert_eq!(step.stop, Some(Req::new(1)));
        assert!(step.start.is_none());
        assert!(s.is_idle());
    }

    #[tokio::test]
    async fn fifo_queue() {
        let mut s = Serializer::new();
        let (a, _) = s.subscribe(Req::new(1));
        let (b, step) = s.subscribe(Req::new(2));
        assert!(step.start.is_none());
        // Joinable, but must not overtake the queued request
        let (c, _) = s.subscribe(Req::new(1));
        assert_eq!(s.queued(), 2);

        s.publish(&1);
        assert_matches!(try_next(&mut s, b).await, None);

        let step = s.complete(Ok(2));
        assert_eq!(step.start, Some(Req::new(2)));
        assert_matches!(try_next(&mut s, a).await, Some(Some(Ok(1))));
        assert_matches!(try_next(&mut s, a).await, Some(Some(Ok(2))));
        assert_matches!(try_next(&mut s, a).await, Some(None));

        let step = s.unsubscribe(b);
        assert_eq!(step.stop, Some(Req::new(2)));
        assert_eq!(step.start, Some(Req::new(1)));
        s.publish(&3);
        assert_matches!(try_next(&mut s, c).await, Some(Some(Ok(3))));
    }

    #[tokio::test]
    async fn unsubscribe_queued() {
        let mut s = Serializer::new();
        let (_a, _) = s.subscribe(Req::new(1));
        let (b, _) = s.subscribe(Req::new(2));
        let step = s.unsubscribe(b);
        assert!(step.stop.is_none() && step.start.is_none());
        assert_eq!(s.queued(), 0);
        assert_eq!(s.active(), Some(&Req::new(1)));
    }

    #[tokio::test]
    async fn unstoppable_waits_for_completion() {
        let mut s = Serializer::new();
        let r = Req {
            key: 1,
            stoppable: false,
        };
        let (a, _) = s.subscribe(r.clone());
        let (b, _) = s.subscribe(Req::new(2));
        let step = s.unsubscribe(a);
        assert!(step.stop.is_none() && step.start.is_none());
        assert_eq!(s.active(), Some(&r));
        let step = s.complete(Ok(0));
        assert_eq!(step.start, Some(Req::new(2)));
        assert_eq!(s.active_subs(), 1);
        let _ = s.unsubscribe(b);
    }

    #[tokio::test]
    async fn fail_all() {
        let mut s = Serializer::new();
        let (a, _) = s.subscribe(Req::new(1));
        let (b, _) = s.subscribe(Req::new(2));
        s.fail_all(&Error::AdapterState(AdapterState::PoweredOff));
        for id in [a, b] {
            assert_matches!(try_next(&mut s, id).await, Some(Some(Err(Error::AdapterState(_)))));
            assert_matches!(try_next(&mut s, id).await, Some(None));
        }
        // Dropping terminated subscribers has no hardware side effects
        let step = s.unsubscribe(a);
        assert!(step.stop.is_none() && step.start.is_none());
        let _ = s.unsubscribe(b);
        assert!(s.is_idle());
    }
}
