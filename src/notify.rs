//! Notification multiplexer.
//!
//! Reference-counts subscribers per characteristic. Notifications are enabled
//! in hardware for the first subscriber and disabled after the last one is
//! dropped. Every value received while a registration exists is delivered to
//! all of its subscribers, including those that arrived after notifications
//! were already enabled.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tracing::{debug, trace, warn};

use crate::adapter::CommandQueue;
use crate::util::{Inboxes, SharedState, SubId};
use crate::{
    AdapterState, Characteristic, Command, DeviceId, Error, Op, PeripheralState, PlatformError,
    Result, ValueResult,
};

/// Notification subscribers of one characteristic.
#[derive(Debug, Default)]
struct Registration {
    subs: BTreeSet<SubId>,
    /// Subscribers waiting for the enable confirmation.
    pending: BTreeSet<SubId>,
    /// Whether the adapter confirmed that notifications are enabled.
    enabled: bool,
}

#[derive(Debug, Default)]
struct Registrations {
    map: BTreeMap<Characteristic, Registration>,
    inboxes: Inboxes<Result<Vec<u8>>>,
}

impl Registrations {
    fn observe(&mut self, q: &CommandQueue, ch: Characteristic) -> Result<SubId> {
        if let Some(e) = Error::from_state(q.state()) {
            return Err(e);
        }
        let id = ch.device;
        if q.adapter().peripheral_state(id) != PeripheralState::Connected {
            return Err(Error::DeviceDisconnected { id, cause: None });
        }
        let sub = self.inboxes.open();
        let r = self.map.entry(ch).or_default();
        if r.subs.is_empty() {
            debug!("Enabling notifications for {ch}");
            q.push(Command::SetNotify(ch, true));
        }
        if !r.enabled {
            r.pending.insert(sub);
        }
        r.subs.insert(sub);
        Ok(sub)
    }

    fn unsubscribe(&mut self, q: &CommandQueue, ch: Characteristic, sub: SubId) {
        self.inboxes.remove(sub);
        let Some(r) = self.map.get_mut(&ch) else {
            return;
        };
        r.pending.remove(&sub);
        if r.subs.remove(&sub) && r.subs.is_empty() {
            debug!("Disabling notifications for {ch}");
            self.map.remove(&ch);
            q.push(Command::SetNotify(ch, false));
        }
    }

    fn state_updated(&mut self, ch: Characteristic, enabled: bool, error: Option<PlatformError>) {
        let Some(r) = self.map.get_mut(&ch) else {
            trace!("Ignored notify state of unobserved {ch}");
            return;
        };
        match error {
            // A failed disable leaves notifications enabled. It may belong to
            // a registration that was already dropped.
            Some(cause) if enabled => {
                warn!("Failed to disable notifications for {ch}: {cause}");
            }
            Some(cause) if !r.pending.is_empty() => {
                warn!("Failed to enable notifications for {ch}: {cause}");
                let e = Error::OperationFailed {
                    op: Op::SetNotify,
                    target: ch.into(),
                    cause,
                };
                let pending = std::mem::take(&mut r.pending);
                self.inboxes.fail_all(&pending, &e);
                r.subs.retain(|s| !pending.contains(s));
                if r.subs.is_empty() {
                    self.map.remove(&ch);
                }
            }
            Some(cause) => warn!("Ignored notify state error for {ch}: {cause}"),
            None if enabled => {
                trace!("Notifications enabled for {ch}");
                r.enabled = true;
                r.pending.clear();
            }
            None => trace!("Ignored notify state update for {ch}: disabled"),
        }
    }

    fn value(&mut self, q: &CommandQueue, ch: Characteristic, v: &ValueResult) {
        let Some(r) = self.map.get(&ch) else {
            return;
        };
        match *v {
            Ok(ref v) => self.inboxes.push_all(&r.subs, &Ok(v.clone())),
            Err(ref cause) => {
                warn!("Notification error for {ch}: {cause}");
                let e = Error::OperationFailed {
                    op: Op::Read,
                    target: ch.into(),
                    cause: cause.clone(),
                };
                self.inboxes.fail_all(&r.subs, &e);
                self.map.remove(&ch);
                q.push(Command::SetNotify(ch, false));
            }
        }
    }

    fn disconnected(&mut self, id: DeviceId, cause: &Option<PlatformError>) {
        let e = Error::DeviceDisconnected {
            id,
            cause: cause.clone(),
        };
        let inboxes = &mut self.inboxes;
        self.map.retain(|ch, r| {
            if ch.device != id {
                return true;
            }
            inboxes.fail_all(&r.subs, &e);
            false
        });
    }

    fn invalidate(&mut self, s: AdapterState) {
        let e = Error::AdapterState(s);
        for (_, r) in std::mem::take(&mut self.map) {
            self.inboxes.fail_all(&r.subs, &e);
        }
    }
}

#[derive(Debug)]
struct Inner {
    q: Arc<CommandQueue>,
    st: SharedState<Registrations>,
}

/// Notification multiplexer.
#[derive(Debug)]
pub(crate) struct NotifyMux(Arc<Inner>);

impl NotifyMux {
    #[must_use]
    pub fn new(q: Arc<CommandQueue>) -> Self {
        Self(Arc::new(Inner {
            q,
            st: SharedState::new(Registrations::default()),
        }))
    }

    /// Subscribes to value notifications of characteristic `ch`.
    pub fn observe(&self, ch: Characteristic) -> Result<Notifications> {
        let q = &self.0.q;
        let sub = self.0.st.write(|rs| rs.observe(q, ch))?;
        q.flush();
        Ok(Notifications {
            inner: Arc::clone(&self.0),
            ch,
            sub,
        })
    }

    #[cfg(test)]
    /// Returns the number of subscribers of characteristic `ch`.
    #[must_use]
    pub fn subscriber_count(&self, ch: &Characteristic) -> usize {
        self.0.st.read(|rs| rs.map.get(ch).map_or(0, |r| r.subs.len()))
    }

    pub fn state_updated(&self, ch: Characteristic, enabled: bool, error: Option<PlatformError>) {
        self.0.st.write(|rs| rs.state_updated(ch, enabled, error));
    }

    pub fn value(&self, ch: Characteristic, v: &ValueResult) {
        self.0.st.write(|rs| rs.value(&self.0.q, ch, v));
    }

    pub fn disconnected(&self, id: DeviceId, cause: &Option<PlatformError>) {
        self.0.st.write(|rs| rs.disconnected(id, cause));
    }

    pub fn invalidate(&self, s: AdapterState) {
        self.0.st.write(|rs| rs.invalidate(s));
    }
}

/// Value notifications of one characteristic.
///
/// The stream ends with an error when the device disconnects, the adapter
/// leaves the powered-on state, or the adapter reports a notification
/// failure. Dropping the last subscriber disables notifications.
#[must_use = "notifications are disabled when dropped"]
pub struct Notifications {
    inner: Arc<Inner>,
    ch: Characteristic,
    sub: SubId,
}

impl Notifications {
    /// Returns the observed characteristic.
    #[inline(always)]
    #[must_use]
    pub const fn characteristic(&self) -> Characteristic {
        self.ch
    }

    /// Returns whether the adapter has confirmed that notifications are
    /// enabled for this subscriber.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        let (ch, sub) = (self.ch, self.sub);
        self.inner.st.read(|rs| {
            rs.map
                .get(&ch)
                .map_or(false, |r| r.subs.contains(&sub) && !r.pending.contains(&sub))
        })
    }
}

impl Stream for Notifications {
    type Item = Result<Vec<u8>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let sub = self.sub;
        self.inner.st.write(|rs| rs.inboxes.poll(sub, cx))
    }
}

impl Drop for Notifications {
    fn drop(&mut self) {
        let (q, ch, sub) = (&self.inner.q, self.ch, self.sub);
        self.inner.st.write(|rs| rs.unsubscribe(q, ch, sub));
        q.flush();
    }
}

impl Debug for Notifications {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifications")
            .field("ch", &self.ch)
            .field("sub", &self.sub)
            .finish()
    }
}
