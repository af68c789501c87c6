use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::{AdapterState, Attribute, DeviceId};

/// Error type returned by all coordinated operations. Every error is terminal
/// for the stream that receives it.
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("Bluetooth is {0}")]
    AdapterState(AdapterState),
    #[error("already observing connection for {0}")]
    AlreadyInProgress(DeviceId),
    #[error("connection to {id} failed{}", fmt_cause(.cause))]
    ConnectionFailed {
        id: DeviceId,
        cause: Option<PlatformError>,
    },
    #[error("{id} disconnected{}", fmt_cause(.cause))]
    DeviceDisconnected {
        id: DeviceId,
        cause: Option<PlatformError>,
    },
    #[error("{op} failed for {target}: {cause}")]
    OperationFailed {
        op: Op,
        target: Attribute,
        cause: PlatformError,
    },
    #[error("RSSI read for {id} failed: {cause}")]
    RssiFailed { id: DeviceId, cause: PlatformError },
}

impl Error {
    /// Returns the error for operations attempted in adapter state `s` or
    /// [`None`] if the adapter is powered on.
    #[inline]
    #[must_use]
    pub const fn from_state(s: AdapterState) -> Option<Self> {
        if s.is_powered_on() {
            None
        } else {
            Some(Self::AdapterState(s))
        }
    }

    /// Returns the device associated with the error, if any.
    #[must_use]
    pub fn device(&self) -> Option<DeviceId> {
        match *self {
            Self::AlreadyInProgress(id)
            | Self::ConnectionFailed { id, .. }
            | Self::DeviceDisconnected { id, .. }
            | Self::RssiFailed { id, .. } => Some(id),
            Self::OperationFailed { ref target, .. } => Some(target.device()),
            Self::AdapterState(_) => None,
        }
    }
}

/// Common result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Hardware operation that failed with [`Error::OperationFailed`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Op {
    Read,
    Write,
    SetNotify,
}

impl Display for Op {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match *self {
            Self::Read => "read",
            Self::Write => "write",
            Self::SetNotify => "notify state change",
        })
    }
}

/// Error reported by the adapter for a command or an asynchronous event. It is
/// cheap to clone so that one hardware failure can be delivered to every
/// subscriber sharing the resource.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct PlatformError(Arc<str>);

impl PlatformError {
    /// Creates an adapter error with the specified description.
    #[inline]
    #[must_use]
    pub fn new(msg: impl AsRef<str>) -> Self {
        Self(Arc::from(msg.as_ref()))
    }
}

fn fmt_cause(cause: &Option<PlatformError>) -> String {
    cause.as_ref().map_or_else(String::new, |e| format!(": {e}"))
}
