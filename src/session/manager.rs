//! Device discovery and scoped session access
//!
//! `SessionManager` is handed its transport explicitly; there is no global
//! connection state. It offers two access patterns:
//!
//! - `connect_one` / `connect_all` return open sessions the caller owns.
//! - `connect_one_with` / `connect_all_with` run a callback per session and
//!   close every session before returning, whatever the callback did.
//!
//! How per-device open failures are handled is chosen by [`OpenPolicy`].

use crate::core::error::{
    ConnectEachError, DeviceFailure, FailureKind, Result, SessionError, TransportError,
    TransportResult,
};
use crate::device::traits::{RawDevice, RawDeviceInfo, Transport};
use crate::session::device::DeviceSession;
use crossbeam_channel::RecvTimeoutError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// What to do when one device in a multi-device call fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpenPolicy {
    /// Record the failure and carry on with the remaining devices
    #[default]
    BestEffort,
    /// Stop at the first failure, closing whatever was already opened
    FailFast,
}

/// Tunables for a `SessionManager`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Upper bound on `list_devices`; `None` waits indefinitely
    pub discovery_timeout: Option<Duration>,
    pub open_policy: OpenPolicy,
}

impl SessionOptions {
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = Some(timeout);
        self
    }

    pub fn with_open_policy(mut self, policy: OpenPolicy) -> Self {
        self.open_policy = policy;
        self
    }
}

/// A device that failed to open during `connect_all`
pub type OpenFailure = DeviceFailure<Infallible>;

impl OpenFailure {
    /// Re-type as a failure that may also hold callback errors
    pub fn widen<E>(self) -> DeviceFailure<E> {
        let kind = match self.kind {
            FailureKind::Open(e) => FailureKind::Open(e),
            FailureKind::Callback(never) => match never {},
        };
        DeviceFailure {
            index: self.index,
            label: self.label,
            kind,
        }
    }

    /// The transport error behind this failure
    pub fn into_error(self) -> TransportError {
        match self.kind {
            FailureKind::Open(e) => e,
            FailureKind::Callback(never) => match never {},
        }
    }
}

/// Sessions opened by one `connect_all` call, in discovery order
pub struct ConnectAll<T: Transport> {
    pub sessions: Vec<DeviceSession<T>>,
    /// Devices that could not be opened (always empty under `FailFast`)
    pub failures: Vec<OpenFailure>,
}

impl<T: Transport> ConnectAll<T> {
    /// True when every discovered device was opened
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of discovered devices, opened or not
    pub fn discovered(&self) -> usize {
        self.sessions.len() + self.failures.len()
    }

    pub fn close_all(&mut self) {
        for session in &mut self.sessions {
            session.close();
        }
    }

    pub fn into_sessions(self) -> Vec<DeviceSession<T>> {
        self.sessions
    }
}

/// Clears the in-flight flag when the discovery thread finishes, even by panicking
struct InFlight(Arc<AtomicBool>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Discovers devices and hands out sessions on them
pub struct SessionManager<T: Transport> {
    transport: Arc<T>,
    options: SessionOptions,
    /// Set while a discovery thread is running, including an abandoned one
    discovering: Arc<AtomicBool>,
}

impl<T: Transport> SessionManager<T> {
    pub fn new(transport: T) -> Self {
        Self::with_options(transport, SessionOptions::default())
    }

    pub fn with_options(transport: T, options: SessionOptions) -> Self {
        Self::from_shared(Arc::new(transport), options)
    }

    /// Build a manager over a transport that is also used elsewhere
    pub fn from_shared(transport: Arc<T>, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            discovering: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// True while a bounded discovery (possibly one that already timed out) is still running
    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::Acquire)
    }

    /// Enumerate attached devices, bounded by the discovery timeout
    ///
    /// With a timeout configured, enumeration runs on a helper thread. If it
    /// does not answer in time the thread is abandoned and
    /// `TransportError::Timeout` is returned. At most one helper thread runs
    /// per manager: while an abandoned one is still stuck in the transport,
    /// further calls fail with `Timeout` at once instead of piling up threads.
    pub fn discover(&self) -> TransportResult<Vec<T::Raw>> {
        let Some(timeout) = self.options.discovery_timeout else {
            return self.transport.list_devices();
        };

        if self.discovering.swap(true, Ordering::AcqRel) {
            warn!(
                "Device discovery via {} is still running from an earlier call",
                self.transport.name()
            );
            return Err(TransportError::Timeout(timeout));
        }
        let guard = InFlight(Arc::clone(&self.discovering));

        let transport = Arc::clone(&self.transport);
        let (tx, rx) = crossbeam_channel::bounded(1);

        thread::Builder::new()
            .name("mtp-discovery".to_string())
            .spawn(move || {
                let result = transport.list_devices();
                // Cleared before answering so the next call never sees a stale flag
                drop(guard);
                // The receiver is gone if discovery already timed out
                let _ = tx.send(result);
            })?;

        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "Device discovery via {} did not finish within {:?}",
                    self.transport.name(),
                    timeout
                );
                Err(TransportError::Timeout(timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Other(
                "device discovery thread exited without a result".to_string(),
            )),
        }
    }

    /// Describe attached devices without opening any of them
    pub fn list(&self) -> Result<Vec<RawDeviceInfo>> {
        let devices = self.discover()?;
        Ok(devices.iter().map(|d| d.info()).collect())
    }

    /// Open the first discovered device
    ///
    /// Fails with `NoDevice` (without attempting any open) when nothing is
    /// attached. The caller owns the returned session.
    pub fn connect_one(&self) -> Result<DeviceSession<T>> {
        let devices = self.discover()?;
        debug!("Discovery found {} device(s)", devices.len());

        let Some(first) = devices.into_iter().next() else {
            return Err(SessionError::NoDevice);
        };

        Ok(DeviceSession::open(Arc::clone(&self.transport), first, 0)?)
    }

    /// Run `f` against the first discovered device, then close it
    ///
    /// The session is closed before this returns, whether `f` succeeded,
    /// failed or panicked. `f`'s result is returned untouched; discovery and
    /// open failures are converted into `E`.
    pub fn connect_one_with<R, E, F>(&self, f: F) -> std::result::Result<R, E>
    where
        E: From<SessionError>,
        F: FnOnce(&mut DeviceSession<T>) -> std::result::Result<R, E>,
    {
        let mut session = self.connect_one()?;
        let result = f(&mut session);
        session.close();
        result
    }

    /// Open every discovered device, in discovery order
    ///
    /// Under `BestEffort`, devices that fail to open are reported in
    /// `ConnectAll::failures`. Under `FailFast`, the first open failure closes
    /// the sessions opened so far and is returned as the error.
    pub fn connect_all(&self) -> Result<ConnectAll<T>> {
        let devices = self.discover()?;
        debug!("Discovery found {} device(s)", devices.len());

        self.open_all(devices)
            .map_err(|failure| SessionError::Transport(failure.into_error()))
    }

    /// Run `f` once per discovered device, closing each session right after
    ///
    /// Every opened session is closed exactly once, independent of what the
    /// callbacks for other devices did. Failures are reported only after all
    /// sessions are closed. Returns the number of devices visited.
    ///
    /// Under `BestEffort` every opened device is visited and all open and
    /// callback failures are collected. Under `FailFast` the first failure
    /// stops further callbacks; unvisited sessions are closed and the single
    /// failure is reported.
    pub fn connect_all_with<E, F>(&self, mut f: F) -> std::result::Result<usize, ConnectEachError<E>>
    where
        F: FnMut(&mut DeviceSession<T>) -> std::result::Result<(), E>,
    {
        let devices = self
            .discover()
            .map_err(|e| ConnectEachError::Discovery(e.into()))?;
        debug!("Discovery found {} device(s)", devices.len());

        let opened = self
            .open_all(devices)
            .map_err(|failure| ConnectEachError::Devices(vec![failure.widen()]))?;

        let mut failures: Vec<DeviceFailure<E>> =
            opened.failures.into_iter().map(OpenFailure::widen).collect();
        let mut visited = 0;
        let mut stopped = false;

        for mut session in opened.sessions {
            if stopped {
                session.close();
                continue;
            }

            let outcome = f(&mut session);
            session.close();
            visited += 1;

            if let Err(e) = outcome {
                warn!("Callback failed for device #{} ({})", session.index(), session.label());
                failures.push(DeviceFailure {
                    index: session.index(),
                    label: session.label().to_string(),
                    kind: FailureKind::Callback(e),
                });
                if self.options.open_policy == OpenPolicy::FailFast {
                    stopped = true;
                }
            }
        }

        if failures.is_empty() {
            info!("Visited {} device(s)", visited);
            Ok(visited)
        } else {
            failures.sort_by_key(|failure| failure.index);
            Err(ConnectEachError::Devices(failures))
        }
    }

    fn open_all(&self, devices: Vec<T::Raw>) -> std::result::Result<ConnectAll<T>, OpenFailure> {
        let mut sessions = Vec::with_capacity(devices.len());
        let mut failures = Vec::new();

        for (index, raw) in devices.into_iter().enumerate() {
            let label = raw.info().label();

            match DeviceSession::open(Arc::clone(&self.transport), raw, index) {
                Ok(session) => sessions.push(session),
                Err(e) => {
                    warn!("Failed to open device #{} ({}): {}", index, label, e);
                    let failure = DeviceFailure {
                        index,
                        label,
                        kind: FailureKind::Open(e),
                    };

                    if self.options.open_policy == OpenPolicy::FailFast {
                        for session in &mut sessions {
                            session.close();
                        }
                        return Err(failure);
                    }
                    failures.push(failure);
                }
            }
        }

        Ok(ConnectAll { sessions, failures })
    }
}
