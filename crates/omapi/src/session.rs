//! Physical link to one secure element

use std::{fmt, sync::Arc};

use tracing::{debug, warn};

use crate::{
    error::{OmapiError, Result},
    service::{NativeReader, NativeSession},
};

/// Owns the session opened on a native reader
///
/// At most one session exists at a time. It is created by
/// [`open`](Self::open) and dropped by [`close`](Self::close).
pub struct TransportSession {
    /// Logical reader name, used for logging
    reader_name: String,
    /// Native reader handle
    native: Arc<dyn NativeReader>,
    /// Open session, if any
    session: Option<Box<dyn NativeSession>>,
}

impl fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportSession")
            .field("reader_name", &self.reader_name)
            .field("native", &self.native.name())
            .field("is_open", &self.is_open())
            .finish()
    }
}

impl TransportSession {
    /// Create a closed transport session for a native reader
    pub fn new(reader_name: impl Into<String>, native: Arc<dyn NativeReader>) -> Self {
        Self {
            reader_name: reader_name.into(),
            native,
            session: None,
        }
    }

    /// Open a session with the secure element
    ///
    /// A session that is still open is closed first.
    pub fn open(&mut self) -> Result<()> {
        if let Some(mut previous) = self.session.take() {
            warn!(
                reader = %self.reader_name,
                "Closing the previous session before opening a new one"
            );
            previous.close();
        }

        let session = self.native.open_session().map_err(|e| {
            debug!(reader = %self.reader_name, error = %e, "Failed to open session");
            OmapiError::transport_caused_by("Failed to open the physical channel", e)
        })?;

        debug!(reader = %self.reader_name, "Physical channel opened");
        self.session = Some(session);
        Ok(())
    }

    /// Close the session, if one is open
    pub fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if !session.is_closed() {
                session.close();
            }
            debug!(reader = %self.reader_name, "Physical channel closed");
        }
    }

    /// Check if a session exists and has not been closed
    pub fn is_open(&self) -> bool {
        self.session.as_ref().is_some_and(|s| !s.is_closed())
    }

    /// Check if a secure element is present in the slot
    pub fn check_card_presence(&self) -> bool {
        self.native.is_secure_element_present()
    }

    /// Get the hex encoded Answer To Reset, or an empty string when unavailable
    pub fn power_on_data(&self) -> String {
        match self.session.as_ref().and_then(|s| s.atr()) {
            Some(atr) => {
                let atr = hex::encode_upper(atr);
                debug!(reader = %self.reader_name, atr = %atr, "Retrieving ATR");
                atr
            }
            None => String::new(),
        }
    }

    /// Get the logical reader name
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Get the native reader handle
    pub fn native_reader(&self) -> &Arc<dyn NativeReader> {
        &self.native
    }

    /// Get the open session
    pub(crate) fn session_mut(&mut self) -> Option<&mut (dyn NativeSession + 'static)> {
        self.session.as_deref_mut()
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::{ErrorKind, ServiceError},
        sim::{SimApplet, SimReader, SimReaderProfile},
    };

    fn sim_reader(atr: Option<&str>) -> Arc<SimReader> {
        Arc::new(SimReader::new(SimReaderProfile {
            name: "SIM1".to_string(),
            atr: atr.map(str::to_string),
            applets: vec![SimApplet::new("A000000151000000", "6F00")],
            ..Default::default()
        })
        .unwrap())
    }

    #[test]
    fn test_open_close() {
        let native = sim_reader(None);
        let mut session = TransportSession::new("ReaderSim1", native.clone());
        assert!(!session.is_open());

        session.open().unwrap();
        assert!(session.is_open());
        assert_eq!(native.stats().sessions_opened, 1);

        session.close();
        assert!(!session.is_open());
        session.close();
        assert!(!session.is_open());
    }

    #[test]
    fn test_open_failure_is_transport() {
        let native = sim_reader(None);
        native.fail_open_session(Some(ServiceError::io("service unavailable")));

        let mut session = TransportSession::new("ReaderSim1", native);
        let err = session.open().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(
            err.service_error(),
            Some(&ServiceError::io("service unavailable"))
        );
        assert!(!session.is_open());
    }

    #[test]
    fn test_power_on_data() {
        let mut session = TransportSession::new("ReaderSim1", sim_reader(Some("3b8f8001")));
        assert_eq!(session.power_on_data(), "");

        session.open().unwrap();
        assert_eq!(session.power_on_data(), "3B8F8001");

        session.close();
        assert_eq!(session.power_on_data(), "");
    }

    #[test]
    fn test_power_on_data_without_atr() {
        let mut session = TransportSession::new("ReaderSim1", sim_reader(None));
        session.open().unwrap();
        assert_eq!(session.power_on_data(), "");
    }

    #[test]
    fn test_reopen_closes_previous() {
        let native = sim_reader(None);
        let mut session = TransportSession::new("ReaderSim1", native.clone());
        session.open().unwrap();
        session.open().unwrap();

        let stats = native.stats();
        assert_eq!(stats.sessions_opened, 2);
        assert_eq!(stats.open_sessions, 1);
    }

    #[test]
    fn test_card_presence() {
        let native = sim_reader(None);
        let session = TransportSession::new("ReaderSim1", native.clone());
        assert!(session.check_card_presence());

        native.set_present(false);
        assert!(!session.check_card_presence());
    }
}
