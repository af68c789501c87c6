//! Attribute read/write and RSSI operations.
//!
//! Operations on one characteristic or descriptor are serialized: concurrent
//! reads share a single hardware read, while writes queue in arrival order.
//! RSSI reads of one device are shared the same way. Hardware operations
//! cannot be cancelled, so an abandoned operation keeps its slot until the
//! adapter reports completion.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tracing::{debug, trace};

use crate::adapter::CommandQueue;
use crate::serial::{Request, Serializer, Step};
use crate::util::{SharedState, SubId};
use crate::{
    AdapterState, Attribute, Command, DeviceId, Error, Op, PeripheralState, PlatformError,
    Result, ValueResult, WriteKind,
};

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum GattRequest {
    Read,
    Write(Vec<u8>),
}

impl Request for GattRequest {
    type Output = Vec<u8>;

    #[inline]
    fn joins(&self, active: &Self) -> bool {
        matches!((self, active), (Self::Read, Self::Read))
    }

    #[inline(always)]
    fn is_stoppable(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct RssiRequest;

impl Request for RssiRequest {
    type Output = i16;

    #[inline(always)]
    fn joins(&self, _: &Self) -> bool {
        true
    }

    #[inline(always)]
    fn is_stoppable(&self) -> bool {
        false
    }
}

/// Target of a serialized operation.
trait Slot: Copy + Ord + Debug + Display {
    type Req: Request;

    /// Returns the device that owns the target.
    fn device(&self) -> DeviceId;

    /// Returns the adapter command that starts request `req`.
    fn command(&self, req: Self::Req) -> Command;

    /// Returns the operations of this target type.
    fn ops(st: &mut State) -> &mut Ops<Self>;
}

impl Slot for Attribute {
    type Req = GattRequest;

    #[inline(always)]
    fn device(&self) -> DeviceId {
        Attribute::device(self)
    }

    fn command(&self, req: GattRequest) -> Command {
        match req {
            GattRequest::Read => Command::Read(*self),
            GattRequest::Write(v) => Command::Write(*self, v, WriteKind::WithResponse),
        }
    }

    #[inline(always)]
    fn ops(st: &mut State) -> &mut Ops<Self> {
        &mut st.attrs
    }
}

impl Slot for DeviceId {
    type Req = RssiRequest;

    #[inline(always)]
    fn device(&self) -> DeviceId {
        *self
    }

    #[inline(always)]
    fn command(&self, _: RssiRequest) -> Command {
        Command::ReadRssi(*self)
    }

    #[inline(always)]
    fn ops(st: &mut State) -> &mut Ops<Self> {
        &mut st.rssi
    }
}

#[derive(Debug)]
struct Ops<K: Slot>(BTreeMap<K, Serializer<K::Req>>);

impl<K: Slot> Ops<K> {
    fn submit(&mut self, q: &CommandQueue, k: K, req: K::Req) -> SubId {
        let (sub, step) = self.0.entry(k).or_default().subscribe(req);
        start(q, k, step);
        sub
    }

    fn cancel(&mut self, k: K, sub: SubId) {
        if let Some(s) = self.0.get_mut(&k) {
            let step = s.unsubscribe(sub);
            debug_assert!(step.stop.is_none() && step.start.is_none());
            self.gc(k);
        }
    }

    fn complete(&mut self, q: &CommandQueue, k: K, r: Result<<K::Req as Request>::Output>) {
        let Some(s) = self.0.get_mut(&k) else {
            return;
        };
        let step = s.complete(r);
        start(q, k, step);
        self.gc(k);
    }

    fn active(&self, k: &K) -> Option<&K::Req> {
        self.0.get(k).and_then(Serializer::active)
    }

    fn fail_where(&mut self, f: impl Fn(&K) -> bool, e: &Error) {
        for (_, s) in self.0.iter_mut().filter(|(k, _)| f(k)) {
            s.fail_all(e);
        }
        self.0.retain(|_, s| !s.is_idle());
    }

    #[inline]
    fn gc(&mut self, k: K) {
        if self.0.get(&k).map_or(false, Serializer::is_idle) {
            self.0.remove(&k);
        }
    }
}

impl<K: Slot> Default for Ops<K> {
    #[inline]
    fn default() -> Self {
        Self(BTreeMap::new())
    }
}

/// Queues the command of a request that became active. Requests are never
/// stoppable, so no step contains a stop request.
fn start<K: Slot>(q: &CommandQueue, k: K, step: Step<K::Req>) {
    debug_assert!(step.stop.is_none());
    if let Some(req) = step.start {
        q.push(k.command(req));
    }
}

#[derive(Debug, Default)]
struct State {
    attrs: Ops<Attribute>,
    rssi: Ops<DeviceId>,
}

#[derive(Debug)]
struct Inner {
    q: Arc<CommandQueue>,
    st: SharedState<State>,
}

impl Inner {
    /// Returns an error if operations on device `id` are not possible.
    fn check(&self, id: DeviceId) -> Result<()> {
        if let Some(e) = Error::from_state(self.q.state()) {
            return Err(e);
        }
        if self.q.adapter().peripheral_state(id) != PeripheralState::Connected {
            return Err(Error::DeviceDisconnected { id, cause: None });
        }
        Ok(())
    }

    /// Submits request `req` for target `k`.
    fn submit<K: Slot>(self: &Arc<Self>, k: K, req: K::Req) -> Result<Pending<K>> {
        self.check(k.device())?;
        let sub = self.st.write(|st| K::ops(st).submit(&self.q, k, req));
        self.q.flush();
        Ok(Pending {
            inner: Arc::clone(self),
            k,
            sub: Some(sub),
        })
    }
}

/// Attribute and RSSI operation coordinator.
#[derive(Debug)]
pub(crate) struct Gatt(Arc<Inner>);

impl Gatt {
    #[must_use]
    pub fn new(q: Arc<CommandQueue>) -> Self {
        Self(Arc::new(Inner {
            q,
            st: SharedState::new(State::default()),
        }))
    }

    /// Reads the value of attribute `at`.
    #[inline]
    pub fn read(&self, at: Attribute) -> Result<Read> {
        self.0.submit(at, GattRequest::Read).map(Read)
    }

    /// Writes `v` to attribute `at`. Descriptors are always written with
    /// response.
    pub fn write(&self, at: Attribute, v: &[u8], kind: WriteKind) -> Result<Write> {
        let inner = &self.0;
        if kind == WriteKind::WithResponse || matches!(at, Attribute::Descriptor(_)) {
            return inner.submit(at, GattRequest::Write(v.to_vec())).map(Write);
        }
        inner.check(at.device())?;
        inner.q.push(Command::Write(at, v.to_vec(), kind));
        inner.q.flush();
        Ok(Write(Pending {
            inner: Arc::clone(inner),
            k: at,
            sub: None,
        }))
    }

    /// Reads the signal strength of device `id`.
    #[inline]
    pub fn read_rssi(&self, id: DeviceId) -> Result<ReadRssi> {
        self.0.submit(id, RssiRequest).map(ReadRssi)
    }

    /// Handles a value update. It completes an active read.
    pub fn value(&self, at: Attribute, v: &ValueResult) {
        let inner = &self.0;
        inner.st.write(|st| {
            let ops = &mut st.attrs;
            if !matches!(ops.active(&at), Some(GattRequest::Read)) {
                return;
            }
            trace!("Read {at} complete");
            let r = v.clone().map_err(|cause| Error::OperationFailed {
                op: Op::Read,
                target: at,
                cause,
            });
            ops.complete(&inner.q, at, r);
        });
    }

    /// Handles a write confirmation.
    pub fn written(&self, at: Attribute, error: Option<PlatformError>) {
        let inner = &self.0;
        inner.st.write(|st| {
            let ops = &mut st.attrs;
            if !matches!(ops.active(&at), Some(GattRequest::Write(_))) {
                trace!("Ignored write confirmation for {at}");
                return;
            }
            let r = error.map_or(Ok(Vec::new()), |cause| {
                debug!("Write to {at} failed: {cause}");
                Err(Error::OperationFailed {
                    op: Op::Write,
                    target: at,
                    cause,
                })
            });
            ops.complete(&inner.q, at, r);
        });
    }

    /// Handles an RSSI read completion.
    pub fn rssi(&self, id: DeviceId, r: std::result::Result<i16, PlatformError>) {
        let inner = &self.0;
        inner.st.write(|st| {
            if st.rssi.active(&id).is_none() {
                trace!("Ignored RSSI of {id}");
                return;
            }
            let r = r.map_err(|cause| Error::RssiFailed { id, cause });
            st.rssi.complete(&inner.q, id, r);
        });
    }

    pub fn disconnected(&self, id: DeviceId, cause: &Option<PlatformError>) {
        let e = Error::DeviceDisconnected {
            id,
            cause: cause.clone(),
        };
        self.0.st.write(|st| {
            st.attrs.fail_where(|at| at.device() == id, &e);
            st.rssi.fail_where(|&dev| dev == id, &e);
        });
    }

    pub fn invalidate(&self, s: AdapterState) {
        let e = Error::AdapterState(s);
        self.0.st.write(|st| {
            st.attrs.fail_where(|_| true, &e);
            st.rssi.fail_where(|_| true, &e);
        });
    }
}

/// Pending operation. A missing subscriber ID means that the operation
/// completed when it was issued.
struct Pending<K: Slot> {
    inner: Arc<Inner>,
    k: K,
    sub: Option<SubId>,
}

impl<K: Slot> Pending<K>
where
    <K::Req as Request>::Output: Default,
{
    fn poll(&mut self, cx: &mut Context<'_>) -> Poll<Result<<K::Req as Request>::Output>> {
        let Some(sub) = self.sub else {
            return Poll::Ready(Ok(Default::default()));
        };
        let k = self.k;
        let r = self.inner.st.write(|st| {
            let s = K::ops(st).0.get_mut(&k);
            s.map_or(Poll::Ready(None), |s| s.poll(sub, cx))
        });
        match r {
            Poll::Ready(Some(r)) => Poll::Ready(r),
            // Serializers are only removed after all inboxes are gone
            Poll::Ready(None) => Poll::Ready(Err(Error::DeviceDisconnected {
                id: k.device(),
                cause: None,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<K: Slot> Drop for Pending<K> {
    fn drop(&mut self) {
        if let Some(sub) = self.sub {
            let k = self.k;
            self.inner.st.write(|st| K::ops(st).cancel(k, sub));
        }
    }
}

impl<K: Slot> Debug for Pending<K> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("k", &self.k)
            .field("sub", &self.sub)
            .finish()
    }
}

/// Future that resolves to the value of a characteristic or descriptor.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Read(Pending<Attribute>);

impl Future for Read {
    type Output = Result<Vec<u8>>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll(cx)
    }
}

/// Future that resolves when a characteristic or descriptor write is
/// confirmed.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Write(Pending<Attribute>);

impl Future for Write {
    type Output = Result<()>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll(cx).map_ok(|_| ())
    }
}

/// Future that resolves to the RSSI of a connected device in dBm.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct ReadRssi(Pending<DeviceId>);

impl Future for ReadRssi {
    type Output = Result<i16>;

    #[inline]
    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.0.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;

    use matches::assert_matches;

    use super::*;
    use crate::adapter::mock::Mock;
    use crate::{Characteristic, Descriptor, Uuid16};

    const DEV: DeviceId = DeviceId::new(7);

    fn setup() -> (Arc<Mock>, Gatt, Attribute) {
        let m = Mock::new(AdapterState::PoweredOn);
        m.set_peripheral(DEV, PeripheralState::Connected);
        let g = Gatt::new(Arc::new(CommandQueue::new(m.clone())));
        (m, g, battery_level().into())
    }

    fn battery_level() -> Characteristic {
        Characteristic::new(
            DEV,
            Uuid16::new(0x180F).unwrap().as_uuid(),
            Uuid16::new(0x2A19).unwrap().as_uuid(),
        )
    }

    async fn is_pending(f: &mut (impl Future + Unpin)) -> bool {
        poll_fn(|cx| Poll::Ready(Pin::new(&mut *f).poll(cx).is_pending())).await
    }

    fn is_idle(g: &Gatt) -> bool {
        g.0.st.read(|st| st.attrs.0.is_empty() && st.rssi.0.is_empty())
    }

    #[tokio::test]
    async fn shared_read() {
        let (m, g, ch) = setup();
        let mut a = g.read(ch).unwrap();
        let mut b = g.read(ch).unwrap();
        assert_eq!(m.take_commands(), [Command::Read(ch)]);
        assert!(is_pending(&mut a).await && is_pending(&mut b).await);
        g.value(ch, &Ok(vec![95]));
        assert_eq!(a.await.unwrap(), [95]);
        assert_eq!(b.await.unwrap(), [95]);
        assert!(is_idle(&g));
    }

    #[tokio::test]
    async fn writes_queue() {
        let (m, g, ch) = setup();
        let mut a = g.write(ch, &[1], WriteKind::WithResponse).unwrap();
        let mut b = g.write(ch, &[2], WriteKind::WithResponse).unwrap();
        let r = g.read(ch).unwrap();
        assert_eq!(
            m.take_commands(),
            [Command::Write(ch, vec![1], WriteKind::WithResponse)]
        );

        // Notifications do not complete writes
        g.value(ch, &Ok(vec![0]));
        assert!(is_pending(&mut a).await);

        g.written(ch, None);
        g.0.q.flush();
        assert_matches!(a.await, Ok(()));
        assert_eq!(
            m.take_commands(),
            [Command::Write(ch, vec![2], WriteKind::WithResponse)]
        );

        // Abandoned write keeps its slot
        drop(r);
        assert!(is_pending(&mut b).await);
        drop(b);
        assert!(m.commands().is_empty());
        g.written(ch, Some(PlatformError::new("write not permitted")));
        g.0.q.flush();
        assert!(m.commands().is_empty());
        assert!(is_idle(&g));
    }

    #[tokio::test]
    async fn write_without_response() {
        let (m, g, ch) = setup();
        let w = g.write(ch, &[3], WriteKind::WithoutResponse).unwrap();
        assert_eq!(
            m.take_commands(),
            [Command::Write(ch, vec![3], WriteKind::WithoutResponse)]
        );
        assert_matches!(w.await, Ok(()));
    }

    #[tokio::test]
    async fn descriptor() {
        let (m, g, ch) = setup();
        let cccd = Uuid16::new(0x2902).unwrap().as_uuid();
        let d = Attribute::from(Descriptor::new(battery_level(), cccd));

        // Descriptor and characteristic operations are independent
        let cr = g.read(ch).unwrap();
        let mut w = g.write(d, &[1, 0], WriteKind::WithoutResponse).unwrap();
        let mut dr = g.read(d).unwrap();
        assert_eq!(
            m.take_commands(),
            [
                Command::Read(ch),
                Command::Write(d, vec![1, 0], WriteKind::WithResponse)
            ]
        );
        assert!(is_pending(&mut w).await);

        g.written(d, None);
        g.0.q.flush();
        assert_matches!(w.await, Ok(()));
        assert_eq!(m.take_commands(), [Command::Read(d)]);
        assert!(is_pending(&mut dr).await);

        g.value(d, &Err(PlatformError::new("read not permitted")));
        assert_matches!(
            dr.await,
            Err(Error::OperationFailed { op: Op::Read, target, .. }) if target == d
        );
        g.value(ch, &Ok(vec![50]));
        assert_eq!(cr.await.unwrap(), [50]);
        assert!(is_idle(&g));
    }

    #[tokio::test]
    async fn shared_rssi() {
        let (m, g, _) = setup();
        let mut a = g.read_rssi(DEV).unwrap();
        let b = g.read_rssi(DEV).unwrap();
        assert_eq!(m.take_commands(), [Command::ReadRssi(DEV)]);
        assert!(is_pending(&mut a).await);
        g.rssi(DEV, Ok(-61));
        assert_matches!(a.await, Ok(-61));
        assert_matches!(b.await, Ok(-61));

        let a = g.read_rssi(DEV).unwrap();
        g.rssi(DEV, Err(PlatformError::new("not connected")));
        assert_matches!(a.await, Err(Error::RssiFailed { id: DEV, .. }));

        // Late completion of an abandoned read is ignored
        drop(g.read_rssi(DEV).unwrap());
        g.rssi(DEV, Ok(-70));
        g.rssi(DEV, Ok(-71));
        assert!(is_idle(&g));
    }

    #[tokio::test]
    async fn failures() {
        let (m, g, ch) = setup();
        let a = g.read(ch).unwrap();
        g.value(ch, &Err(PlatformError::new("read not permitted")));
        assert_matches!(
            a.await,
            Err(Error::OperationFailed { op: Op::Read, .. })
        );

        let a = g.read(ch).unwrap();
        let b = g.write(ch, &[1], WriteKind::WithResponse).unwrap();
        let c = g.read_rssi(DEV).unwrap();
        g.disconnected(DEV, &None);
        assert_matches!(a.await, Err(Error::DeviceDisconnected { id: DEV, .. }));
        assert_matches!(b.await, Err(Error::DeviceDisconnected { id: DEV, .. }));
        assert_matches!(c.await, Err(Error::DeviceDisconnected { id: DEV, .. }));
        assert!(is_idle(&g));

        m.set_peripheral(DEV, PeripheralState::Disconnected);
        assert_matches!(g.read(ch), Err(Error::DeviceDisconnected { cause: None, .. }));
        assert_matches!(g.read_rssi(DEV), Err(Error::DeviceDisconnected { .. }));
        m.set_peripheral(DEV, PeripheralState::Connected);
        g.0.q.set_state(AdapterState::Unauthorized);
        assert_matches!(
            g.write(ch, &[], WriteKind::WithoutResponse),
            Err(Error::AdapterState(AdapterState::Unauthorized))
        );
    }
}
