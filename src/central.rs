//! Central role interface.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::adapter::CommandQueue;
use crate::conn::Connector;
use crate::gatt::Gatt;
use crate::notify::NotifyMux;
use crate::scan::Scanner;
use crate::{
    Adapter, AdapterEvent, AdapterState, Attribute, Broadcast, Characteristic, Config,
    ConnectOptions, Connection, ConnectionState, Device, DeviceId, Disconnect, Error,
    EventSource, Notifications, PlatformError, Read, ReadRssi, Result, Scan, ScanOptions,
    Subscription, Uuid, Write, WriteKind,
};


type ConnectedEvent = Result<(DeviceId, Device)>;
type DisconnectedEvent = Result<(DeviceId, Option<PlatformError>)>;

/// Central role coordinator for a single hardware adapter.
///
/// All operations may be called from any thread. Adapter events must be
/// delivered in order, either by calling [`Central::handle_event`] from the
/// adapter's callback context or by sending them to the channel drained by
/// [`Central::event_loop`].
#[derive(Clone, Debug)]
pub struct Central(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    q: Arc<CommandQueue>,
    cfg: Config,
    states: Broadcast<AdapterState>,
    connected: Broadcast<ConnectedEvent>,
    disconnected: Broadcast<DisconnectedEvent>,
    conn: Connector,
    scan: Scanner,
    notify: NotifyMux,
    gatt: Gatt,
}

impl Central {
    /// Creates a central with the default configuration.
    #[inline]
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self::with_config(adapter, Config::default())
    }

    /// Creates a central with the specified configuration. The adapter-level
    /// options are applied before any other command is issued.
    #[must_use]
    pub fn with_config(adapter: Arc<dyn Adapter>, cfg: Config) -> Self {
        adapter.init(&cfg.init_options());
        let q = Arc::new(CommandQueue::new(adapter));
        info!("Central created (Bluetooth is {})", q.state());
        Self(Arc::new(Inner {
            conn: Connector::new(Arc::clone(&q)),
            scan: Scanner::new(Arc::clone(&q)),
            notify: NotifyMux::new(Arc::clone(&q)),
            gatt: Gatt::new(Arc::clone(&q)),
            q,
            cfg,
            states: Broadcast::new(),
            connected: Broadcast::new(),
            disconnected: Broadcast::new(),
        }))
    }

    /// Returns the configuration.
    #[inline(always)]
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.0.cfg
    }

    /// Returns the current adapter state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.0.q.state()
    }

    /// Returns a stream that yields the current adapter state followed by all
    /// subsequent changes.
    pub fn observe_state(&self) -> StateStream {
        let (sub, s) = self.0.states.subscribe_with(|| self.state());
        StateStream {
            next: Some(s),
            sub,
        }
    }

    /// Scans for devices advertising any of `services`, or for all devices if
    /// `services` is empty. If a scan is already active, the new subscriber
    /// receives the discoveries of that scan instead.
    pub fn scan(&self, services: &[Uuid], opts: ScanOptions) -> Result<Scan> {
        self.0.scan.scan(services, opts)
    }

    /// Scans for all devices using the configured scan options.
    #[inline]
    pub fn scan_all(&self) -> Result<Scan> {
        self.scan(&[], self.0.cfg.scan_options())
    }

    /// Returns whether a hardware scan is active.
    #[inline]
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.0.scan.is_scanning()
    }

    /// Connects to device `id` or attaches to its established connection.
    /// Fails with [`Error::AlreadyInProgress`] if another connection attempt
    /// to the same device is pending.
    pub fn connect(&self, id: DeviceId, opts: ConnectOptions) -> Result<Connection> {
        self.0.conn.connect(id, opts)
    }

    /// Returns the connection state of device `id` as tracked by this central.
    #[inline]
    #[must_use]
    pub fn connection_state(&self, id: DeviceId) -> ConnectionState {
        self.0.conn.state(id)
    }

    /// Disconnects device `id`. All of its connection subscribers receive
    /// [`Error::DeviceDisconnected`] once the adapter confirms the disconnect.
    pub fn cancel_connection(&self, id: DeviceId) -> Result<Disconnect> {
        self.0.conn.cancel(id)
    }

    /// Returns a stream of connection events for device `id`, whoever
    /// initiated the connection.
    pub fn monitor_connection(&self, id: DeviceId) -> Result<Monitor<Device>> {
        self.monitor(&self.0.connected, id)
    }

    /// Returns a stream of disconnect causes for device `id`. A clean
    /// disconnect is reported as [`None`].
    pub fn monitor_disconnection(&self, id: DeviceId) -> Result<Monitor<Option<PlatformError>>> {
        self.monitor(&self.0.disconnected, id)
    }

    /// Subscribes to value notifications of characteristic `ch`.
    pub fn observe(&self, ch: Characteristic) -> Result<Notifications> {
        self.0.notify.observe(ch)
    }

    /// Reads a characteristic or descriptor value.
    pub fn read(&self, at: impl Into<Attribute>) -> Result<Read> {
        self.0.gatt.read(at.into())
    }

    /// Writes `v` to a characteristic or descriptor. Descriptors are always
    /// written with response.
    pub fn write(&self, at: impl Into<Attribute>, v: &[u8], kind: WriteKind) -> Result<Write> {
        self.0.gatt.write(at.into(), v, kind)
    }

    /// Reads the signal strength of connected device `id`.
    pub fn read_rssi(&self, id: DeviceId) -> Result<ReadRssi> {
        self.0.gatt.read_rssi(id)
    }

    /// Returns the devices among `ids` that are known to the adapter.
    pub fn retrieve_peripherals(&self, ids: &[DeviceId]) -> Result<Vec<Device>> {
        self.check()?;
        let v = self.0.q.adapter().retrieve_peripherals(ids);
        Ok(v.into_iter().map(Device::new).collect())
    }

    /// Returns the devices connected to the system, by this or any other
    /// application, that expose any of `services`.
    pub fn retrieve_connected(&self, services: &[Uuid]) -> Result<Vec<Device>> {
        self.check()?;
        let v = self.0.q.adapter().retrieve_connected(services);
        Ok(v.into_iter().map(Device::new).collect())
    }

    /// Processes an adapter event and executes any resulting commands.
    pub fn handle_event(&self, evt: AdapterEvent) {
        trace!("{evt:?}");
        let c = &self.0;
        match evt {
            AdapterEvent::StateChanged(s) => self.state_changed(s),
            AdapterEvent::Discovered(ref d) => c.scan.discovered(d),
            AdapterEvent::Connected(id) => {
                c.conn.connected(id);
                c.connected.publish(&Ok((id, Device::new(id))));
            }
            AdapterEvent::FailedToConnect(id, cause) => c.conn.failed(id, cause),
            AdapterEvent::Disconnected(id, cause) => {
                c.notify.disconnected(id, &cause);
                c.gatt.disconnected(id, &cause);
                c.conn.disconnected(id, cause.clone());
                c.disconnected.publish(&Ok((id, cause)));
            }
            AdapterEvent::ValueUpdated(at, ref r) => {
                if let Attribute::Characteristic(ch) = at {
                    c.notify.value(ch, r);
                }
                c.gatt.value(at, r);
            }
            AdapterEvent::NotifyStateUpdated {
                characteristic,
                enabled,
                error,
            } => c.notify.state_updated(characteristic, enabled, error),
            AdapterEvent::ValueWritten(at, error) => c.gatt.written(at, error),
            AdapterEvent::RssiRead(id, r) => c.gatt.rssi(id, r),
        }
        c.q.flush();
    }

    /// Spawns a task that handles adapter events received from `rx` until the
    /// channel is closed or the returned future is dropped.
    #[must_use]
    pub fn event_loop(&self, rx: mpsc::UnboundedReceiver<AdapterEvent>) -> EventLoop {
        let c = CancellationToken::new();
        EventLoop {
            h: tokio::spawn(EventLoop::run(self.clone(), rx, c.clone())),
            c: c.clone(),
            _g: c.drop_guard(),
        }
    }

    /// Records a new adapter state. Leaving the powered-on state fails every
    /// in-flight operation before any further command can be issued.
    fn state_changed(&self, s: AdapterState) {
        let c = &self.0;
        if !c.states.publish_if(&s, || c.q.set_state(s)) {
            return;
        }
        info!("Bluetooth is {s}");
        if s.is_powered_on() {
            return;
        }
        c.conn.invalidate(s);
        c.scan.invalidate(s);
        c.notify.invalidate(s);
        c.gatt.invalidate(s);
        c.connected.publish(&Err(Error::AdapterState(s)));
        c.disconnected.publish(&Err(Error::AdapterState(s)));
    }

    /// Fails unless the adapter is powered on.
    #[inline]
    fn check(&self) -> Result<()> {
        Error::from_state(self.state()).map_or(Ok(()), Err)
    }

    fn monitor<T: Clone>(
        &self,
        src: &Broadcast<Result<(DeviceId, T)>>,
        id: DeviceId,
    ) -> Result<Monitor<T>> {
        let sub = src.subscribe();
        if let Some(e) = Error::from_state(self.state()) {
            return Err(e);
        }
        Ok(Monitor {
            sub,
            id,
            done: false,
        })
    }
}

/// Adapter state stream returned by [`Central::observe_state`]. It never
/// ends.
#[must_use = "streams do nothing unless polled"]
pub struct StateStream {
    next: Option<AdapterState>,
    sub: Subscription<AdapterState>,
}

impl Stream for StateStream {
    type Item = AdapterState;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.next.take() {
            Some(s) => Poll::Ready(Some(s)),
            None => Pin::new(&mut this.sub).poll_next(cx),
        }
    }
}

impl Debug for StateStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStream")
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}

/// Stream of connection events of one device. It ends with
/// [`Error::AdapterState`] when the adapter leaves the powered-on state.
#[must_use = "streams do nothing unless polled"]
pub struct Monitor<T> {
    sub: Subscription<Result<(DeviceId, T)>>,
    id: DeviceId,
    done: bool,
}

impl<T> Stream for Monitor<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        while !this.done {
            match ready!(Pin::new(&mut this.sub).poll_next(cx)) {
                Some(Ok((id, v))) if id == this.id => return Poll::Ready(Some(Ok(v))),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    this.done = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => break,
            }
        }
        Poll::Ready(None)
    }
}

impl<T> Debug for Monitor<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Monitor")
            .field("id", &self.id)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Future that continuously handles adapter events.
#[derive(Debug)]
pub struct EventLoop {
    h: tokio::task::JoinHandle<()>,
    c: CancellationToken,
    _g: tokio_util::sync::DropGuard,
}

impl EventLoop {
    /// Stops event processing.
    pub async fn stop(self) {
        self.c.cancel();
        if let Err(e) = self.h.await {
            error!("Event loop task failed: {e}");
        }
    }

    /// Handles adapter events until cancellation.
    async fn run(
        central: Central,
        mut rx: mpsc::UnboundedReceiver<AdapterEvent>,
        c: CancellationToken,
    ) {
        debug!("Event loop started");
        loop {
            let evt = tokio::select! {
                evt = rx.recv() => evt,
                _ = c.cancelled() => {
                    debug!("Event loop terminating");
                    return;
                }
            };
            let Some(evt) = evt else {
                debug!("Adapter event channel closed");
                return;
            };
            central.handle_event(evt);
        }
    }
}

impl Future for EventLoop {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Err(e) = ready!(Pin::new(&mut self.h).poll(cx)) {
            error!("Event loop task failed: {e}");
        }
        Poll::Ready(())
    }
}
