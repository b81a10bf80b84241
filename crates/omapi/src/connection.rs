//! Connection state of the plugin to the OMAPI service
//!
//! Binding to the service is asynchronous: the platform hands back a service
//! handle straight away and reports readiness later, possibly on another
//! thread and possibly before the handle was even returned. A
//! [`PluginConnection`] tracks both halves and runs the queued callbacks once
//! it has the handle and the ready event.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    error::Result,
    service::{ConnectedListener, SeService},
};

/// Callback run once the plugin is connected
pub type ConnectCallback = Box<dyn FnOnce() + Send + 'static>;

enum ConnectionState {
    Disconnected,
    Connecting {
        service: Option<Arc<dyn SeService>>,
        ready: bool,
        pending: Vec<ConnectCallback>,
    },
    Connected(Arc<dyn SeService>),
}

impl ConnectionState {
    const fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting { .. } => "connecting",
            Self::Connected(_) => "connected",
        }
    }
}

struct Inner {
    /// Incremented on each new attempt and on disconnect
    attempt: u64,
    state: ConnectionState,
}

/// Shared connection state of a plugin
///
/// Clones share the same state.
#[derive(Clone)]
pub struct PluginConnection {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("PluginConnection")
            .field("attempt", &inner.attempt)
            .field("state", &inner.state.label())
            .finish()
    }
}

impl Default for PluginConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginConnection {
    /// Create a disconnected connection
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                attempt: 0,
                state: ConnectionState::Disconnected,
            })),
        }
    }

    /// Run `callback` once connected, calling `start` to bind if needed
    ///
    /// When already connected the callback runs before this returns. When an
    /// attempt is in flight the callback joins it and `start` is not called.
    /// Otherwise `start` receives the listener to hand to the platform and
    /// returns the service handle.
    pub fn connect<F>(&self, callback: ConnectCallback, start: F) -> Result<()>
    where
        F: FnOnce(ConnectedListener) -> Result<Arc<dyn SeService>>,
    {
        let attempt = {
            let mut inner = self.inner.lock();
            if matches!(inner.state, ConnectionState::Connected(_)) {
                drop(inner);
                debug!("Already connected to the OMAPI service");
                callback();
                return Ok(());
            }
            if let ConnectionState::Connecting { pending, .. } = &mut inner.state {
                debug!("Connection in progress, queuing callback");
                pending.push(callback);
                return Ok(());
            }

            inner.attempt += 1;
            inner.state = ConnectionState::Connecting {
                service: None,
                ready: false,
                pending: vec![callback],
            };
            inner.attempt
        };

        let weak = Arc::downgrade(&self.inner);
        let listener: ConnectedListener = Box::new(move || Self::on_ready(&weak, attempt));

        debug!(attempt, "Connecting to the OMAPI service");
        match start(listener) {
            Ok(service) => {
                self.on_service(service, attempt);
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                if inner.attempt == attempt {
                    inner.state = ConnectionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    fn on_service(&self, service: Arc<dyn SeService>, attempt: u64) {
        let callbacks = {
            let mut inner = self.inner.lock();
            if inner.attempt != attempt {
                return;
            }
            match std::mem::replace(&mut inner.state, ConnectionState::Disconnected) {
                ConnectionState::Connecting {
                    ready: true,
                    pending,
                    ..
                } => {
                    inner.state = ConnectionState::Connected(Arc::clone(&service));
                    pending
                }
                ConnectionState::Connecting { pending, .. } => {
                    inner.state = ConnectionState::Connecting {
                        service: Some(service),
                        ready: false,
                        pending,
                    };
                    return;
                }
                other => {
                    inner.state = other;
                    return;
                }
            }
        };
        Self::run(service.as_ref(), callbacks);
    }

    fn on_ready(weak: &Weak<Mutex<Inner>>, attempt: u64) {
        let Some(shared) = weak.upgrade() else {
            return;
        };

        let (service, callbacks) = {
            let mut inner = shared.lock();
            if inner.attempt != attempt {
                debug!(attempt, "Ignoring ready event of a stale connection attempt");
                return;
            }
            match std::mem::replace(&mut inner.state, ConnectionState::Disconnected) {
                ConnectionState::Connecting {
                    service: Some(service),
                    pending,
                    ..
                } => {
                    inner.state = ConnectionState::Connected(Arc::clone(&service));
                    (service, pending)
                }
                ConnectionState::Connecting { pending, .. } => {
                    // Ready before the platform returned the handle
                    inner.state = ConnectionState::Connecting {
                        service: None,
                        ready: true,
                        pending,
                    };
                    return;
                }
                other => {
                    inner.state = other;
                    return;
                }
            }
        };
        Self::run(service.as_ref(), callbacks);
    }

    fn run(service: &dyn SeService, callbacks: Vec<ConnectCallback>) {
        info!(version = %service.version(), callbacks = callbacks.len(), "OMAPI service connected");
        for callback in callbacks {
            callback();
        }
    }

    /// Get the service handle, once connected
    pub fn service(&self) -> Option<Arc<dyn SeService>> {
        match &self.inner.lock().state {
            ConnectionState::Connected(service) => Some(Arc::clone(service)),
            _ => None,
        }
    }

    /// Check if the connection is established
    pub fn is_connected(&self) -> bool {
        matches!(self.inner.lock().state, ConnectionState::Connected(_))
    }

    /// Check if a connection attempt is in flight
    pub fn is_connecting(&self) -> bool {
        matches!(self.inner.lock().state, ConnectionState::Connecting { .. })
    }

    /// Drop the service handle and any queued callbacks
    ///
    /// A ready event arriving later for the abandoned attempt is ignored.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.attempt += 1;
        let previous = std::mem::replace(&mut inner.state, ConnectionState::Disconnected);
        drop(inner);

        if !matches!(previous, ConnectionState::Disconnected) {
            debug!(state = previous.label(), "Disconnected from the OMAPI service");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex as PlMutex;

    use super::*;
    use crate::{
        error::{ErrorKind, OmapiError},
        sim::{SimProfile, SimService},
    };

    fn service() -> Arc<dyn SeService> {
        Arc::new(SimService::new(SimProfile::demo()).unwrap())
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> ConnectCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let shared = Arc::clone(&count);
        let make = move || -> ConnectCallback {
            let count = Arc::clone(&shared);
            Box::new(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        (count, make)
    }

    #[test]
    fn test_ready_after_handle() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();
        let listener = Arc::new(PlMutex::new(None));

        let slot = Arc::clone(&listener);
        connection
            .connect(callback(), move |l| {
                *slot.lock() = Some(l);
                Ok(service())
            })
            .unwrap();
        assert!(connection.is_connecting());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let ready = listener.lock().take().unwrap();
        ready();
        assert!(connection.is_connected());
        assert!(connection.service().is_some());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ready_before_handle() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();

        connection
            .connect(callback(), |ready| {
                ready();
                Ok(service())
            })
            .unwrap();
        assert!(connection.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connected_runs_callback_immediately() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();
        let starts = AtomicUsize::new(0);

        for _ in 0..2 {
            connection
                .connect(callback(), |ready| {
                    starts.fetch_add(1, Ordering::SeqCst);
                    ready();
                    Ok(service())
                })
                .unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_callbacks_share_attempt() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();
        let listener = Arc::new(PlMutex::new(None));

        let slot = Arc::clone(&listener);
        connection
            .connect(callback(), move |l| {
                *slot.lock() = Some(l);
                Ok(service())
            })
            .unwrap();
        connection
            .connect(callback(), |_| panic!("second attempt started"))
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let ready = listener.lock().take().unwrap();
        ready();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_start_failure_resets_state() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();

        let err = connection
            .connect(callback(), |_| Err(OmapiError::transport("bind failed")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(!connection.is_connecting());
        assert!(!connection.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_ready_is_ignored() {
        let connection = PluginConnection::new();
        let (count, callback) = counter();
        let listener = Arc::new(PlMutex::new(None));

        let slot = Arc::clone(&listener);
        connection
            .connect(callback(), move |l| {
                *slot.lock() = Some(l);
                Ok(service())
            })
            .unwrap();
        connection.disconnect();

        let ready = listener.lock().take().unwrap();
        ready();
        assert!(!connection.is_connected());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
