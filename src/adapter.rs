//! Boundary to the hardware adapter.
//!
//! The adapter is not safe to drive from multiple threads at once. All
//! commands are funneled through [`CommandQueue`], which executes them one at
//! a time in submission order on whichever thread flushes the queue first.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::util::SharedState;
use crate::{
    AdapterState, AdvData, Attribute, Characteristic, ConnectOptions, DeviceId, Discovery,
    PeripheralState, PlatformError, ScanOptions, Uuid, WriteKind,
};

#[cfg(test)]
pub(crate) mod mock;

/// Hardware adapter interface. Command methods return immediately and report
/// their outcome later through [`AdapterEvent`]s delivered to
/// [`crate::Central::handle_event`].
///
/// Query methods (`state`, `peripheral_state`, and the `retrieve_*` methods)
/// may be called from any thread. Command methods are never called
/// concurrently.
pub trait Adapter: Debug + Send + Sync + 'static {
    /// Applies adapter-level options. Called once before any other command.
    fn init(&self, _opts: &InitOptions) {}

    /// Returns the current radio state.
    fn state(&self) -> AdapterState;

    /// Returns the adapter's own view of the connection to `id`.
    fn peripheral_state(&self, id: DeviceId) -> PeripheralState;

    /// Returns the subset of `ids` that are known to the adapter.
    fn retrieve_peripherals(&self, ids: &[DeviceId]) -> Vec<DeviceId>;

    /// Returns the devices connected to the system that expose any of
    /// `services`.
    fn retrieve_connected(&self, services: &[Uuid]) -> Vec<DeviceId>;

    /// Starts scanning for devices advertising any of `services`, or for all
    /// devices if `services` is empty.
    fn start_scan(&self, services: &[Uuid], opts: ScanOptions);

    /// Stops the current scan.
    fn stop_scan(&self);

    /// Starts connecting to `id`.
    fn connect(&self, id: DeviceId, opts: ConnectOptions);

    /// Cancels a pending or established connection to `id`.
    fn cancel_connection(&self, id: DeviceId);

    /// Enables or disables notifications for characteristic `c`.
    fn set_notify(&self, c: &Characteristic, enable: bool);

    /// Reads the value of characteristic or descriptor `a`.
    fn read(&self, a: &Attribute);

    /// Writes `data` to characteristic or descriptor `a`. Descriptor writes
    /// always use [`WriteKind::WithResponse`].
    fn write(&self, a: &Attribute, data: &[u8], kind: WriteKind);

    /// Reads the signal strength of connected device `id`.
    fn read_rssi(&self, id: DeviceId);
}

/// Attribute value or read error reported by the adapter.
pub type ValueResult = std::result::Result<Vec<u8>, PlatformError>;

/// Adapter-level options applied by [`Adapter::init`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct InitOptions {
    /// Ask the user to power on the radio if it is off.
    pub show_power_alert: bool,
    /// Identifier used by the platform to restore the adapter state.
    pub restore_id: Option<String>,
}

/// Asynchronous event emitted by the adapter on its serial context.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum AdapterEvent {
    StateChanged(AdapterState),
    Discovered(Discovery),
    Connected(DeviceId),
    FailedToConnect(DeviceId, Option<PlatformError>),
    Disconnected(DeviceId, Option<PlatformError>),
    /// Value received through a read or a notification. Only characteristic
    /// values are delivered as notifications.
    ValueUpdated(Attribute, ValueResult),
    /// Confirmation of a set-notify command. `enabled` is the resulting
    /// notification state.
    NotifyStateUpdated {
        characteristic: Characteristic,
        enabled: bool,
        error: Option<PlatformError>,
    },
    /// Completion of a write with response.
    ValueWritten(Attribute, Option<PlatformError>),
    /// Completion of an RSSI read.
    RssiRead(DeviceId, std::result::Result<i16, PlatformError>),
}

impl AdapterEvent {
    /// Returns a discovery event.
    #[inline]
    #[must_use]
    pub fn discovered(device: DeviceId, adv: AdvData, rssi: i16) -> Self {
        Self::Discovered(Discovery { device, adv, rssi })
    }
}

/// Adapter command issued by a coordinator.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Command {
    StartScan {
        services: Vec<Uuid>,
        opts: ScanOptions,
    },
    StopScan,
    Connect(DeviceId, ConnectOptions),
    CancelConnection(DeviceId),
    SetNotify(Characteristic, bool),
    Read(Attribute),
    Write(Attribute, Vec<u8>, WriteKind),
    ReadRssi(DeviceId),
}

/// Serial execution context for adapter commands.
///
/// Coordinators push commands while holding their own state lock, which fixes
/// the order of commands relative to state changes, and call
/// [`CommandQueue::flush`] after releasing it. Commands are never executed
/// while a coordinator lock is held, so the adapter may deliver events
/// synchronously from within a command.
///
/// The queue also owns the last adapter state reported by the adapter. Queued
/// commands are discarded if the adapter is no longer powered on by the time
/// they are executed.
#[derive(Debug)]
pub(crate) struct CommandQueue {
    adapter: Arc<dyn Adapter>,
    state: SharedState<AdapterState>,
    queue: SharedState<VecDeque<Command>>,
    running: AtomicBool,
}

impl CommandQueue {
    /// Creates a command queue for `adapter`.
    #[inline]
    #[must_use]
    pub fn new(adapter: Arc<dyn Adapter>) -> Self {
        Self {
            state: SharedState::new(adapter.state()),
            adapter,
            queue: SharedState::new(VecDeque::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Returns the adapter for queries.
    #[inline(always)]
    #[must_use]
    pub fn adapter(&self) -> &dyn Adapter {
        self.adapter.as_ref()
    }

    /// Returns the last known adapter state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> AdapterState {
        self.state.read(|s| *s)
    }

    /// Updates the adapter state, returning whether it changed.
    #[inline]
    pub fn set_state(&self, s: AdapterState) -> bool {
        self.state.compare_and_set(|cur| *cur != s, |cur| *cur = s)
    }

    /// Appends a command to the queue without executing it.
    #[inline]
    pub fn push(&self, c: Command) {
        trace!("Queued {c:?}");
        self.queue.write(|q| q.push_back(c));
    }

    /// Executes all queued commands. If another thread (or an outer frame of
    /// the current thread) is already executing commands, this returns
    /// immediately and that caller executes the new commands instead.
    pub fn flush(&self) {
        loop {
            if self.running.swap(true, Ordering::Acquire) {
                return;
            }
            while let Some(c) = self.queue.write(VecDeque::pop_front) {
                self.exec(&c);
            }
            self.running.store(false, Ordering::Release);
            // A command may have been pushed after the queue was found empty,
            // but before the flag was cleared.
            if self.queue.read(VecDeque::is_empty) {
                return;
            }
        }
    }

    /// Executes a single command.
    fn exec(&self, c: &Command) {
        let s = self.state();
        if !s.is_powered_on() {
            warn!("Dropped {c:?} (Bluetooth is {s})");
            return;
        }
        debug!("{c:?}");
        let a = self.adapter.as_ref();
        match *c {
            Command::StartScan {
                ref services,
                opts,
            } => a.start_scan(services, opts),
            Command::StopScan => a.stop_scan(),
            Command::Connect(id, opts) => a.connect(id, opts),
            Command::CancelConnection(id) => a.cancel_connection(id),
            Command::SetNotify(ref ch, enable) => a.set_notify(ch, enable),
            Command::Read(ref at) => a.read(at),
            Command::Write(ref at, ref data, kind) => a.write(at, data, kind),
            Command::ReadRssi(id) => a.read_rssi(id),
        }
    }
}
