use std::collections::HashMap;
use std::sync::Arc;

use super::*;

type Hook = Arc<dyn Fn(&Command) + Send + Sync>;

/// Adapter that records every command and lets tests control queried state.
#[derive(Default)]
pub(crate) struct Mock {
    st: SharedState<MockState>,
}

#[derive(Default)]
struct MockState {
    state: AdapterState,
    peripherals: HashMap<DeviceId, PeripheralState>,
    /// Services exposed by each known peripheral.
    services: HashMap<DeviceId, Vec<Uuid>>,
    cmds: Vec<Command>,
    hook: Option<Hook>,
    init: Option<InitOptions>,
}

impl Mock {
    /// Creates a mock adapter in state `s`.
    pub fn new(s: AdapterState) -> Arc<Self> {
        let m = Self::default();
        m.st.write(|st| st.state = s);
        Arc::new(m)
    }

    /// Sets the adapter state returned by queries.
    pub fn set_state(&self, s: AdapterState) {
        self.st.write(|st| st.state = s);
    }

    /// Sets the peripheral state returned by queries.
    pub fn set_peripheral(&self, id: DeviceId, s: PeripheralState) {
        self.st.write(|st| st.peripherals.insert(id, s));
    }

    /// Registers a known peripheral that exposes `services`.
    pub fn add_peripheral(&self, id: DeviceId, services: &[Uuid]) {
        self.st.write(|st| st.services.insert(id, services.to_vec()));
    }

    /// Registers a function called after each command is recorded.
    pub fn on_command(&self, f: impl Fn(&Command) + Send + Sync + 'static) {
        self.st.write(|st| st.hook = Some(Arc::new(f)));
    }

    /// Returns the recorded commands.
    pub fn commands(&self) -> Vec<Command> {
        self.st.read(|st| st.cmds.clone())
    }

    /// Returns and clears the recorded commands.
    pub fn take_commands(&self) -> Vec<Command> {
        self.st.write(|st| std::mem::take(&mut st.cmds))
    }

    /// Returns the options passed to `init`.
    pub fn init_options(&self) -> Option<InitOptions> {
        self.st.read(|st| st.init.clone())
    }

    fn record(&self, c: Command) {
        let hook = self.st.write(|st| {
            st.cmds.push(c.clone());
            st.hook.clone()
        });
        if let Some(f) = hook {
            f(&c);
        }
    }
}

impl Debug for Mock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mock").finish_non_exhaustive()
    }
}

impl Adapter for Mock {
    fn init(&self, opts: &InitOptions) {
        self.st.write(|st| st.init = Some(opts.clone()));
    }

    fn state(&self) -> AdapterState {
        self.st.read(|st| st.state)
    }

    fn peripheral_state(&self, id: DeviceId) -> PeripheralState {
        self.st.read(|st| st.peripherals.get(&id).copied().unwrap_or_default())
    }

    fn retrieve_peripherals(&self, ids: &[DeviceId]) -> Vec<DeviceId> {
        self.st.read(|st| {
            let known = |id: &DeviceId| st.services.contains_key(id);
            ids.iter().copied().filter(known).collect()
        })
    }

    fn retrieve_connected(&self, services: &[Uuid]) -> Vec<DeviceId> {
        self.st.read(|st| {
            let mut ids: Vec<DeviceId> = st
                .services
                .iter()
                .filter(|&(id, svcs)| {
                    st.peripherals.get(id) == Some(&PeripheralState::Connected)
                        && svcs.iter().any(|u| services.contains(u))
                })
                .map(|(&id, _)| id)
                .collect();
            ids.sort_unstable();
            ids
        })
    }

    fn start_scan(&self, services: &[Uuid], opts: ScanOptions) {
        self.record(Command::StartScan {
            services: services.to_vec(),
            opts,
        });
    }

    fn stop_scan(&self) {
        self.record(Command::StopScan);
    }

    fn connect(&self, id: DeviceId, opts: ConnectOptions) {
        self.record(Command::Connect(id, opts));
    }

    fn cancel_connection(&self, id: DeviceId) {
        self.record(Command::CancelConnection(id));
    }

    fn set_notify(&self, c: &Characteristic, enable: bool) {
        self.record(Command::SetNotify(*c, enable));
    }

    fn read(&self, a: &Attribute) {
        self.record(Command::Read(*a));
    }

    fn write(&self, a: &Attribute, data: &[u8], kind: WriteKind) {
        self.record(Command::Write(*a, data.to_vec(), kind));
    }

    fn read_rssi(&self, id: DeviceId) {
        self.record(Command::ReadRssi(id));
    }
}
