//! Scan coordinator.

use std::fmt::{Debug, Formatter};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_core::Stream;
use tracing::{debug, trace};

use crate::adapter::CommandQueue;
use crate::serial::{Request, Serializer, Step};
use crate::util::{SharedState, SubId};
use crate::{AdapterState, Command, Discovery, Error, Result, ScanOptions, Uuid};

/// Filter criteria of a scan session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ScanRequest {
    services: Vec<Uuid>,
    opts: ScanOptions,
}

impl Request for ScanRequest {
    type Output = Discovery;

    /// Late subscribers always ride along with the active session, whatever
    /// its filter.
    #[inline(always)]
    fn joins(&self, _: &Self) -> bool {
        true
    }

    #[inline(always)]
    fn is_stoppable(&self) -> bool {
        true
    }
}

/// Shared coordinator state.
#[derive(Debug)]
struct Inner {
    q: Arc<CommandQueue>,
    st: SharedState<Serializer<ScanRequest>>,
}

impl Inner {
    /// Queues the adapter commands of a session transition.
    fn apply(&self, step: Step<ScanRequest>) {
        if step.stop.is_some() {
            debug!("Stopping scan");
            self.q.push(Command::StopScan);
        }
        if let Some(r) = step.start {
            debug!("Starting scan for {:?} ({:?})", r.services, r.opts);
            self.q.push(Command::StartScan {
                services: r.services,
                opts: r.opts,
            });
        }
    }
}

/// Scan coordinator. Runs at most one hardware scan at a time, shared by all
/// [`Scan`] subscribers.
#[derive(Debug)]
pub(crate) struct Scanner(Arc<Inner>);

impl Scanner {
    /// Creates a coordinator that issues commands via `q`.
    #[must_use]
    pub fn new(q: Arc<CommandQueue>) -> Self {
        Self(Arc::new(Inner {
            q,
            st: SharedState::new(Serializer::new()),
        }))
    }

    /// Subscribes to discoveries, starting a new scan session with the
    /// specified filter if none is active.
    pub fn scan(&self, services: &[Uuid], opts: ScanOptions) -> Result<Scan> {
        let inner = &self.0;
        let req = ScanRequest {
            services: services.to_vec(),
            opts,
        };
        let sub = inner.st.write(|s| {
            if let Some(e) = Error::from_state(inner.q.state()) {
                return Err(e);
            }
            let (sub, step) = s.subscribe(req);
            inner.apply(step);
            Ok(sub)
        })?;
        inner.q.flush();
        Ok(Scan {
            inner: Arc::clone(inner),
            sub,
        })
    }

    /// Returns whether a hardware scan is active.
    #[must_use]
    pub fn is_scanning(&self) -> bool {
        self.0.st.read(|s| s.active().is_some())
    }

    /// Delivers a discovery to every subscriber of the active session.
    pub fn discovered(&self, d: &Discovery) {
        self.0.st.write(|s| {
            if s.active().is_some() {
                s.publish(d);
            } else {
                trace!("Ignored discovery of {} outside of scan", d.device);
            }
        });
    }

    /// Ends the active session after the adapter left the powered-on state.
    /// The adapter has already stopped scanning, so no command is issued.
    pub fn invalidate(&self, s: AdapterState) {
        self.0.st.write(|ser| ser.fail_all(&Error::AdapterState(s)));
    }
}

/// Logical scan subscription. The stream yields every device discovered by
/// the active session and ends only with an error. Dropping the last
/// subscriber stops the scan.
#[must_use = "the scan is stopped when dropped"]
pub struct Scan {
    inner: Arc<Inner>,
    sub: SubId,
}

impl Stream for Scan {
    type Item = Result<Discovery>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let sub = self.sub;
        self.inner.st.write(|s| s.poll(sub, cx))
    }
}

impl Drop for Scan {
    fn drop(&mut self) {
        let (inner, sub) = (&self.inner, self.sub);
        inner.st.write(|s| inner.apply(s.unsubscribe(sub)));
        inner.q.flush();
    }
}

impl Debug for Scan {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scan").field("sub", &self.sub).finish()
    }
}
