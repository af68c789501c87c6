//! Identifiers, options, and data carried between the adapter and callers.

use std::fmt::{Debug, Display, Formatter};
use std::str::FromStr;

use bitflags::bitflags;

use crate::{InvalidUuid, Uuid};

/// Radio state reported by the adapter. Every state other than
/// [`AdapterState::PoweredOn`] invalidates all in-flight and future operations.
#[derive(
    Clone,
    Copy,
    Debug,
    Eq,
    Hash,
    PartialEq,
    enum_iterator::Sequence,
    num_enum::IntoPrimitive,
    num_enum::TryFromPrimitive,
)]
#[non_exhaustive]
#[repr(u8)]
pub enum AdapterState {
    Unknown = 0,
    Resetting = 1,
    Unsupported = 2,
    Unauthorized = 3,
    PoweredOff = 4,
    PoweredOn = 5,
}

impl AdapterState {
    /// Returns whether operations are allowed in this state.
    #[inline(always)]
    #[must_use]
    pub const fn is_powered_on(self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl Default for AdapterState {
    #[inline]
    fn default() -> Self {
        Self::Unknown
    }
}

impl Display for AdapterState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match *self {
            Self::Unknown => "in unknown state",
            Self::Resetting => "resetting",
            Self::Unsupported => "unsupported",
            Self::Unauthorized => "unauthorized",
            Self::PoweredOff => "powered off",
            Self::PoweredOn => "powered on",
        })
    }
}

/// Opaque 128-bit identifier of a remote device. It is assigned by the adapter
/// and stays stable across connect/disconnect cycles within the lifetime of
/// the process.
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct DeviceId(u128);

impl DeviceId {
    /// Creates a device identifier from its raw value.
    #[inline(always)]
    #[must_use]
    pub const fn new(v: u128) -> Self {
        Self(v)
    }

    /// Returns the raw value.
    #[inline(always)]
    #[must_use]
    pub const fn raw(self) -> u128 {
        self.0
    }
}

impl From<u128> for DeviceId {
    #[inline(always)]
    fn from(v: u128) -> Self {
        Self(v)
    }
}

impl FromStr for DeviceId {
    type Err = InvalidUuid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        crate::uuid::parse_hyphenated(s).map(Self)
    }
}

impl Debug for DeviceId {
    #[allow(clippy::cast_possible_truncation)]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let v = self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:04X}-{:012X}",
            (v >> 96) as u32,
            (v >> 80) as u16,
            (v >> 64) as u16,
            (v >> 48) as u16,
            (v & ((1 << 48) - 1)) as u64
        )
    }
}

impl Display for DeviceId {
    #[inline]
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

/// Remote device handle emitted once a connection is established.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Device {
    pub id: DeviceId,
}

impl Device {
    #[inline(always)]
    #[must_use]
    pub(crate) const fn new(id: DeviceId) -> Self {
        Self { id }
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Device({})", self.id)
    }
}

/// Connection state of a peripheral as reported by the adapter itself. This may
/// differ from [`ConnectionState`] when another component owns the link.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum PeripheralState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Connection state of a device as tracked by the connection coordinator.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

/// GATT characteristic of a remote device.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Characteristic {
    pub device: DeviceId,
    pub service: Uuid,
    pub uuid: Uuid,
}

impl Characteristic {
    /// Creates a characteristic reference.
    #[inline(always)]
    #[must_use]
    pub const fn new(device: DeviceId, service: Uuid, uuid: Uuid) -> Self {
        Self {
            device,
            service,
            uuid,
        }
    }
}

impl Display for Characteristic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Characteristic({}/{}/{})", self.device, self.service, self.uuid)
    }
}

/// GATT descriptor of a remote characteristic.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Descriptor {
    pub characteristic: Characteristic,
    pub uuid: Uuid,
}

impl Descriptor {
    /// Creates a descriptor reference.
    #[inline(always)]
    #[must_use]
    pub const fn new(characteristic: Characteristic, uuid: Uuid) -> Self {
        Self {
            characteristic,
            uuid,
        }
    }
}

impl Display for Descriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let c = &self.characteristic;
        write!(f, "Descriptor({}/{}/{}/{})", c.device, c.service, c.uuid, self.uuid)
    }
}

/// Readable and writable GATT attribute.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[allow(clippy::exhaustive_enums)]
pub enum Attribute {
    Characteristic(Characteristic),
    Descriptor(Descriptor),
}

impl Attribute {
    /// Returns the device that owns the attribute.
    #[inline]
    #[must_use]
    pub const fn device(&self) -> DeviceId {
        match *self {
            Self::Characteristic(ref c) => c.device,
            Self::Descriptor(ref d) => d.characteristic.device,
        }
    }
}

impl From<Characteristic> for Attribute {
    #[inline(always)]
    fn from(c: Characteristic) -> Self {
        Self::Characteristic(c)
    }
}

impl From<Descriptor> for Attribute {
    #[inline(always)]
    fn from(d: Descriptor) -> Self {
        Self::Descriptor(d)
    }
}

impl Display for Attribute {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Characteristic(ref c) => Display::fmt(c, f),
            Self::Descriptor(ref d) => Display::fmt(d, f),
        }
    }
}

/// Advertising and scan response data of a discovered device.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub struct AdvData {
    pub local_name: Option<String>,
    pub services: Vec<Uuid>,
    pub service_data: Vec<(Uuid, Vec<u8>)>,
    pub manufacturer_data: Option<Vec<u8>>,
    pub tx_power: Option<i8>,
    pub connectable: Option<bool>,
}

/// Device discovered by a scan.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Discovery {
    pub device: DeviceId,
    pub adv: AdvData,
    pub rssi: i16,
}

bitflags! {
    /// Scan options passed to the adapter with the start-scan command.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct ScanOptions: u8 {
        /// Report every advertisement instead of one per device.
        const ALLOW_DUPLICATES = 1 << 0;
    }
}

bitflags! {
    /// Connection options passed to the adapter with the connect command.
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[repr(transparent)]
    pub struct ConnectOptions: u8 {
        /// Alert the user when the connection is established in background.
        const NOTIFY_ON_CONNECTION = 1 << 0;
        /// Alert the user when the device disconnects in background.
        const NOTIFY_ON_DISCONNECTION = 1 << 1;
        /// Alert the user on every notification received in background.
        const NOTIFY_ON_NOTIFICATION = 1 << 2;
    }
}

/// Characteristic write type.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum WriteKind {
    #[default]
    WithResponse,
    WithoutResponse,
}
