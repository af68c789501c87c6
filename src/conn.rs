//! Connection coordinator.
//!
//! Tracks the [`ConnectionState`] of every device that has a logical
//! connection subscriber, a pending explicit disconnect, or a connect request
//! waiting for an earlier disconnect to finish. A device has at most one
//! hardware connection attempt in flight. Subscribers of an established
//! connection share it, and the connection is cancelled when the last one goes
//! away.

use std::collections::{BTreeSet, HashMap};
use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tracing::{debug, trace, warn};

use crate::adapter::CommandQueue;
use crate::util::{Inboxes, SharedState, SubId};
use crate::{
    AdapterState, Command, ConnectOptions, ConnectionState, Device, DeviceId, Error,
    PeripheralState, PlatformError, Result,
};

/// Coordinator state of one device.
#[derive(Debug, Default)]
struct Link {
    state: ConnectionState,
    /// Connection subscribers.
    subs: BTreeSet<SubId>,
    /// Connect requests that arrived while the device was disconnecting.
    waiting: Vec<(SubId, ConnectOptions)>,
    /// Explicit disconnect requests.
    cancels: BTreeSet<SubId>,
    /// Disconnected event of the previous link that is still expected after
    /// the adapter reported the device as disconnected without one.
    stale: bool,
}

impl Link {
    /// Returns whether the link carries no information.
    #[inline]
    fn is_unused(&self) -> bool {
        self.state == ConnectionState::Idle
            && self.subs.is_empty()
            && self.waiting.is_empty()
            && self.cancels.is_empty()
            && !self.stale
    }
}

/// State of all devices.
#[derive(Debug, Default)]
struct Links {
    map: HashMap<DeviceId, Link>,
    conns: Inboxes<Result<Device>>,
    cancels: Inboxes<Result<()>>,
}

impl Links {
    /// Evaluates a connect request for subscriber `sub`, whose inbox must
    /// already be open.
    fn connect(
        &mut self,
        q: &CommandQueue,
        id: DeviceId,
        sub: SubId,
        opts: ConnectOptions,
    ) -> Result<()> {
        if let Some(e) = Error::from_state(q.state()) {
            return Err(e);
        }
        let ln = self.map.entry(id).or_default();
        match ln.state {
            ConnectionState::Idle => {}
            ConnectionState::Connecting => return Err(Error::AlreadyInProgress(id)),
            ConnectionState::Connected => {
                trace!("Attached to existing connection with {id}");
                ln.subs.insert(sub);
                self.conns.push(sub, Ok(Device::new(id)));
                return Ok(());
            }
            ConnectionState::Disconnecting => {
                if q.adapter().peripheral_state(id) != PeripheralState::Disconnected {
                    debug!("Waiting for {id} to disconnect");
                    ln.waiting.push((sub, opts));
                    return Ok(());
                }
                // The disconnected event is still queued or was lost
                debug!("{id} disconnected without notification");
                if !ln.subs.is_empty() {
                    let e = Error::DeviceDisconnected { id, cause: None };
                    self.conns.fail_all(&std::mem::take(&mut ln.subs), &e);
                }
                self.settle(q, id);
                let r = self.connect(q, id, sub, opts);
                if let Some(ln) = self.map.get_mut(&id) {
                    ln.stale = ln.state == ConnectionState::Connecting;
                }
                return r;
            }
        }
        ln.subs.insert(sub);
        if q.adapter().peripheral_state(id) == PeripheralState::Connected {
            debug!("{id} is already connected");
            ln.state = ConnectionState::Connected;
            self.conns.push(sub, Ok(Device::new(id)));
        } else {
            ln.state = ConnectionState::Connecting;
            q.push(Command::Connect(id, opts));
        }
        Ok(())
    }

    /// Starts an explicit disconnect. Returns [`None`] if the device is
    /// already disconnected.
    fn cancel(&mut self, q: &CommandQueue, id: DeviceId) -> Result<Option<SubId>> {
        if let Some(e) = Error::from_state(q.state()) {
            return Err(e);
        }
        let ln = self.map.entry(id).or_default();
        if ln.state == ConnectionState::Idle
            && q.adapter().peripheral_state(id) == PeripheralState::Disconnected
        {
            self.gc(id);
            return Ok(None);
        }
        let c = self.cancels.open();
        ln.cancels.insert(c);
        if ln.state != ConnectionState::Disconnecting {
            ln.state = ConnectionState::Disconnecting;
            q.push(Command::CancelConnection(id));
        }
        Ok(Some(c))
    }

    /// Removes connection subscriber `sub`. The connection is cancelled if
    /// this was the last subscriber of a connecting or connected device.
    fn unsubscribe(&mut self, q: &CommandQueue, id: DeviceId, sub: SubId) {
        self.conns.remove(sub);
        let Some(ln) = self.map.get_mut(&id) else {
            return;
        };
        ln.waiting.retain(|&(s, _)| s != sub);
        if ln.subs.remove(&sub)
            && ln.subs.is_empty()
            && matches!(
                ln.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            debug!("Cancelling connection to {id}");
            ln.state = ConnectionState::Disconnecting;
            q.push(Command::CancelConnection(id));
        }
        self.gc(id);
    }

    /// Removes explicit disconnect request `c`.
    fn uncancel(&mut self, id: DeviceId, c: SubId) {
        self.cancels.remove(c);
        if let Some(ln) = self.map.get_mut(&id) {
            ln.cancels.remove(&c);
            self.gc(id);
        }
    }

    /// Handles a connected event.
    fn connected(&mut self, id: DeviceId) {
        match self.map.get_mut(&id) {
            Some(ln) if ln.state == ConnectionState::Connecting => {
                debug!("Connected to {id}");
                ln.state = ConnectionState::Connected;
                ln.stale = false;
                self.conns.push_all(&ln.subs, &Ok(Device::new(id)));
            }
            Some(ln) => trace!("Ignored connection to {id} in {:?} state", ln.state),
            None => trace!("Ignored connection to unobserved {id}"),
        }
    }

    /// Handles a failed connection attempt.
    fn failed(&mut self, q: &CommandQueue, id: DeviceId, cause: Option<PlatformError>) {
        let Some(ln) = self.map.get_mut(&id) else {
            trace!("Ignored connection failure for unobserved {id}");
            return;
        };
        ln.stale = false;
        match ln.state {
            ConnectionState::Connecting => {
                warn!("Connection to {id} failed: {cause:?}");
                let e = Error::ConnectionFailed { id, cause };
                self.conns.fail_all(&std::mem::take(&mut ln.subs), &e);
                ln.state = ConnectionState::Idle;
                self.gc(id);
            }
            ConnectionState::Disconnecting => {
                // Explicitly cancelled while connecting
                if !ln.subs.is_empty() {
                    warn!("Connection to {id} failed: {cause:?}");
                    let e = Error::ConnectionFailed { id, cause };
                    self.conns.fail_all(&std::mem::take(&mut ln.subs), &e);
                }
                self.settle(q, id);
            }
            st => trace!("Ignored connection failure for {id} in {st:?} state"),
        }
    }

    /// Handles a disconnected event. Remaining subscribers receive the
    /// terminal disconnect error.
    fn disconnected(&mut self, q: &CommandQueue, id: DeviceId, cause: Option<PlatformError>) {
        let Some(ln) = self.map.get_mut(&id) else {
            trace!("Ignored disconnect of unobserved {id}");
            return;
        };
        if ln.stale {
            debug!("Ignored earlier disconnect of {id}");
            ln.stale = false;
            self.gc(id);
            return;
        }
        debug!("{id} disconnected (cause: {cause:?})");
        if !ln.subs.is_empty() {
            let e = Error::DeviceDisconnected { id, cause };
            self.conns.fail_all(&std::mem::take(&mut ln.subs), &e);
        }
        self.settle(q, id);
    }

    /// Completes a disconnect: resolves explicit disconnect requests and
    /// re-evaluates connect requests that were waiting for it, in arrival
    /// order.
    fn settle(&mut self, q: &CommandQueue, id: DeviceId) {
        let Some(ln) = self.map.get_mut(&id) else {
            return;
        };
        ln.state = ConnectionState::Idle;
        for c in std::mem::take(&mut ln.cancels) {
            self.cancels.push(c, Ok(()));
            self.cancels.close(c);
        }
        for (sub, opts) in std::mem::take(&mut ln.waiting) {
            if let Err(e) = self.connect(q, id, sub, opts) {
                self.conns.fail(sub, e);
            }
        }
        self.gc(id);
    }

    /// Fails every request because the adapter entered state `s`. No
    /// commands are issued.
    fn invalidate(&mut self, s: AdapterState) {
        let e = Error::AdapterState(s);
        for (_, ln) in self.map.drain() {
            self.conns.fail_all(&ln.subs, &e);
            self.conns.fail_all(ln.waiting.iter().map(|(sub, _)| sub), &e);
            self.cancels.fail_all(&ln.cancels, &e);
        }
    }

    /// Removes the link of device `id` if it is no longer needed.
    #[inline]
    fn gc(&mut self, id: DeviceId) {
        if self.map.get(&id).map_or(false, Link::is_unused) {
            self.map.remove(&id);
        }
    }
}

/// Shared coordinator state.
#[derive(Debug)]
struct Inner {
    q: Arc<CommandQueue>,
    st: SharedState<Links>,
}

/// Connection coordinator.
#[derive(Debug)]
pub(crate) struct Connector(Arc<Inner>);

impl Connector {
    /// Creates a coordinator that issues commands via `q`.
    #[must_use]
    pub fn new(q: Arc<CommandQueue>) -> Self {
        Self(Arc::new(Inner {
            q,
            st: SharedState::new(Links::default()),
        }))
    }

    /// Connects to device `id` or attaches to its existing connection.
    pub fn connect(&self, id: DeviceId, opts: ConnectOptions) -> Result<Connection> {
        let q = &self.0.q;
        let r = self.0.st.write(|ls| {
            let sub = ls.conns.open();
            match ls.connect(q, id, sub, opts) {
                Ok(()) => Ok(sub),
                Err(e) => {
                    ls.conns.remove(sub);
                    Err(e)
                }
            }
        });
        q.flush();
        Ok(Connection {
            inner: Arc::clone(&self.0),
            id,
            sub: r?,
        })
    }

    /// Disconnects device `id` regardless of its connection subscribers.
    pub fn cancel(&self, id: DeviceId) -> Result<Disconnect> {
        let r = self.0.st.write(|ls| ls.cancel(&self.0.q, id));
        self.0.q.flush();
        Ok(Disconnect {
            inner: Arc::clone(&self.0),
            id,
            sub: r?,
        })
    }

    /// Returns the coordinator's view of device `id`.
    #[must_use]
    pub fn state(&self, id: DeviceId) -> ConnectionState {
        let st = |ls: &Links| ls.map.get(&id).map_or(ConnectionState::Idle, |ln| ln.state);
        self.0.st.read(st)
    }

    /// Handles a connected event.
    #[inline]
    pub fn connected(&self, id: DeviceId) {
        self.0.st.write(|ls| ls.connected(id));
    }

    /// Handles a failed connection attempt.
    #[inline]
    pub fn failed(&self, id: DeviceId, cause: Option<PlatformError>) {
        self.0.st.write(|ls| ls.failed(&self.0.q, id, cause));
    }

    /// Handles a disconnected event.
    #[inline]
    pub fn disconnected(&self, id: DeviceId, cause: Option<PlatformError>) {
        self.0.st.write(|ls| ls.disconnected(&self.0.q, id, cause));
    }

    /// Fails all requests after the adapter left the powered-on state.
    #[inline]
    pub fn invalidate(&self, s: AdapterState) {
        self.0.st.write(|ls| ls.invalidate(s));
    }
}

/// Logical connection to a device.
///
/// The stream yields the [`Device`] once the connection is established and
/// ends with [`Error::DeviceDisconnected`] when it is lost. The cause of a
/// clean disconnect is [`None`]. Dropping the last subscriber of a device
/// cancels its connection.
#[must_use = "the connection is cancelled when dropped"]
pub struct Connection {
    inner: Arc<Inner>,
    id: DeviceId,
    sub: SubId,
}

impl Connection {
    /// Returns the device identifier.
    #[inline(always)]
    #[must_use]
    pub const fn id(&self) -> DeviceId {
        self.id
    }
}

impl Stream for Connection {
    type Item = Result<Device>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let sub = self.sub;
        self.inner.st.write(|ls| ls.conns.poll(sub, cx))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let q = &self.inner.q;
        let (id, sub) = (self.id, self.sub);
        self.inner.st.write(|ls| ls.unsubscribe(q, id, sub));
        q.flush();
    }
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Future that resolves when an explicitly cancelled connection is
/// disconnected.
#[must_use = "futures do nothing unless polled"]
pub struct Disconnect {
    inner: Arc<Inner>,
    id: DeviceId,
    sub: Option<SubId>,
}

impl Future for Disconnect {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(c) = self.sub else {
            return Poll::Ready(Ok(()));
        };
        match self.inner.st.write(|ls| ls.cancels.poll(c, cx)) {
            Poll::Ready(r) => Poll::Ready(r.unwrap_or(Ok(()))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Disconnect {
    fn drop(&mut self) {
        if let Some(c) = self.sub {
            self.inner.st.write(|ls| ls.uncancel(self.id, c));
        }
    }
}

impl Debug for Disconnect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Disconnect")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use matches::assert_matches;

    use super::*;
    use crate::adapter::mock::Mock;

    const ID: DeviceId = DeviceId::new(0xABCD);

    fn setup() -> (Arc<Mock>, Connector) {
        let m = Mock::new(AdapterState::PoweredOn);
        let c = Connector::new(Arc::new(CommandQueue::new(m.clone())));
        (m, c)
    }

    async fn try_next(c: &mut Connection) -> Option<Option<Result<Device>>> {
        poll_fn(|cx| match Pin::new(&mut *c).poll_next(cx) {
            Poll::Ready(v) => Poll::Ready(Some(v)),
            Poll::Pending => Poll::Ready(None),
        })
        .await
    }

    #[tokio::test]
    async fn connect_and_share() {
        let (m, c) = setup();
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert_eq!(m.take_commands(), [Command::Connect(ID, ConnectOptions::empty())]);
        assert_eq!(c.state(ID), ConnectionState::Connecting);
        assert_matches!(try_next(&mut a).await, None);

        // Duplicate attempt while connecting
        let r = c.connect(ID, ConnectOptions::NOTIFY_ON_CONNECTION);
        assert_matches!(r, Err(Error::AlreadyInProgress(id)) if id == ID);

        c.connected(ID);
        assert_matches!(try_next(&mut a).await, Some(Some(Ok(Device { id: ID }))));
        assert_matches!(try_next(&mut a).await, None);

        // Attach to the established connection
        let mut b = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert_matches!(try_next(&mut b).await, Some(Some(Ok(Device { id: ID }))));
        drop(a);
        assert!(m.commands().is_empty());
        drop(b);
        assert_eq!(m.take_commands(), [Command::CancelConnection(ID)]);
        assert_eq!(c.state(ID), ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let (m, c) = setup();
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.connected(ID);
        assert_matches!(try_next(&mut a).await, Some(Some(Ok(_))));
        c.disconnected(ID, Some(PlatformError::new("supervision timeout")));
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::DeviceDisconnected { id: ID, cause: Some(_) })))
        );
        assert_matches!(try_next(&mut a).await, Some(None));
        assert_eq!(c.state(ID), ConnectionState::Idle);
        m.take_commands();
        drop(a);
        assert!(m.commands().is_empty());
    }

    #[tokio::test]
    async fn failed_connect() {
        let (m, c) = setup();
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.failed(ID, None);
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::ConnectionFailed { id: ID, cause: None })))
        );
        assert_eq!(c.state(ID), ConnectionState::Idle);
        m.take_commands();
        drop(a);
        assert!(m.commands().is_empty());
    }

    #[tokio::test]
    async fn already_connected() {
        let (m, c) = setup();
        m.set_peripheral(ID, PeripheralState::Connected);
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert!(m.commands().is_empty());
        assert_matches!(try_next(&mut a).await, Some(Some(Ok(Device { id: ID }))));
        assert_eq!(c.state(ID), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn wait_for_disconnect() {
        let (m, c) = setup();
        let a = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.connected(ID);
        m.set_peripheral(ID, PeripheralState::Connected);
        drop(a);
        m.take_commands();

        m.set_peripheral(ID, PeripheralState::Disconnecting);
        let mut b = c.connect(ID, ConnectOptions::empty()).unwrap();
        let mut d = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert!(m.commands().is_empty());
        assert_matches!(try_next(&mut b).await, None);

        m.set_peripheral(ID, PeripheralState::Disconnected);
        c.disconnected(ID, None);
        c.0.q.flush();
        assert_eq!(m.take_commands(), [Command::Connect(ID, ConnectOptions::empty())]);
        assert_eq!(c.state(ID), ConnectionState::Connecting);
        assert_matches!(try_next(&mut b).await, None);
        assert_matches!(try_next(&mut d).await, Some(Some(Err(Error::AlreadyInProgress(_)))));
    }

    #[tokio::test]
    async fn stale_disconnecting() {
        let (m, c) = setup();
        drop(c.connect(ID, ConnectOptions::empty()).unwrap());
        assert_eq!(
            m.take_commands(),
            [
                Command::Connect(ID, ConnectOptions::empty()),
                Command::CancelConnection(ID)
            ]
        );
        // The adapter reports the device as disconnected, but the event
        // has not arrived yet.
        let _a = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert_eq!(m.take_commands(), [Command::Connect(ID, ConnectOptions::empty())]);
    }

    #[tokio::test]
    async fn stale_disconnect_event() {
        let (m, c) = setup();
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.connected(ID);
        assert_matches!(try_next(&mut a).await, Some(Some(Ok(_))));
        let d = c.cancel(ID).unwrap();

        // Reconnect before the disconnected event arrives
        m.set_peripheral(ID, PeripheralState::Disconnected);
        let mut b = c.connect(ID, ConnectOptions::empty()).unwrap();
        assert_matches!(d.await, Ok(()));
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::DeviceDisconnected { id: ID, cause: None })))
        );
        assert_matches!(try_next(&mut a).await, Some(None));
        assert_eq!(
            m.take_commands(),
            [
                Command::Connect(ID, ConnectOptions::empty()),
                Command::CancelConnection(ID),
                Command::Connect(ID, ConnectOptions::empty())
            ]
        );

        // The late event belongs to the previous connection
        c.disconnected(ID, None);
        assert_matches!(try_next(&mut b).await, None);
        assert_eq!(c.state(ID), ConnectionState::Connecting);
        c.connected(ID);
        assert_matches!(try_next(&mut b).await, Some(Some(Ok(Device { id: ID }))));
        assert_eq!(c.state(ID), ConnectionState::Connected);

        c.disconnected(ID, None);
        assert_matches!(
            try_next(&mut b).await,
            Some(Some(Err(Error::DeviceDisconnected { id: ID, .. })))
        );
        assert_eq!(c.state(ID), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn cancel_while_connecting() {
        let (m, c) = setup();
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        let d = c.cancel(ID).unwrap();
        assert_eq!(
            m.take_commands(),
            [
                Command::Connect(ID, ConnectOptions::empty()),
                Command::CancelConnection(ID)
            ]
        );
        c.failed(ID, None);
        assert_matches!(d.await, Ok(()));
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::ConnectionFailed { id: ID, cause: None })))
        );
        assert_matches!(try_next(&mut a).await, Some(None));
        assert_eq!(c.state(ID), ConnectionState::Idle);

        // A later connection is not delivered to the failed subscriber
        let mut b = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.connected(ID);
        assert_matches!(try_next(&mut b).await, Some(Some(Ok(Device { id: ID }))));
        assert_matches!(try_next(&mut a).await, Some(None));
        drop(a);
        m.take_commands();
        drop(b);
        assert_eq!(m.take_commands(), [Command::CancelConnection(ID)]);
    }

    #[tokio::test]
    async fn explicit_cancel() {
        let (m, c) = setup();
        // Nothing to disconnect
        assert_matches!(c.cancel(ID).unwrap().await, Ok(()));
        assert!(m.commands().is_empty());

        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        c.connected(ID);
        m.take_commands();
        let mut d = c.cancel(ID).unwrap();
        assert_eq!(m.take_commands(), [Command::CancelConnection(ID)]);
        assert!(poll_fn(|cx| Poll::Ready(Pin::new(&mut d).poll(cx).is_pending())).await);

        c.disconnected(ID, None);
        assert_matches!(d.await, Ok(()));
        assert_matches!(try_next(&mut a).await, Some(Some(Ok(_))));
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::DeviceDisconnected { cause: None, .. })))
        );
        drop(a);
        assert!(m.commands().is_empty());
    }

    #[tokio::test]
    async fn invalidate() {
        let (m, c) = setup();
        let other = DeviceId::new(1);
        let mut a = c.connect(ID, ConnectOptions::empty()).unwrap();
        m.set_peripheral(other, PeripheralState::Connected);
        let d = c.cancel(other).unwrap();
        m.take_commands();
        c.0.q.set_state(AdapterState::PoweredOff);
        c.invalidate(AdapterState::PoweredOff);
        assert_matches!(
            try_next(&mut a).await,
            Some(Some(Err(Error::AdapterState(AdapterState::PoweredOff))))
        );
        assert_matches!(d.await, Err(Error::AdapterState(_)));
        drop(a);
        assert!(m.commands().is_empty());
        assert_eq!(c.state(ID), ConnectionState::Idle);
        assert_matches!(
            c.connect(ID, ConnectOptions::empty()),
            Err(Error::AdapterState(AdapterState::PoweredOff))
        );
    }
}
