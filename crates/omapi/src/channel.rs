//! Channel management over an open session
//!
//! A [`ChannelManager`] holds at most one channel. Opening a channel while
//! another one is open closes the previous one first. Commands can only be
//! exchanged in the [`ChannelState::Open`] state.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::{
    backend::BackendKind,
    config::OmapiConfig,
    error::{OmapiError, Result, ServiceError},
    service::{NativeChannel, ServiceVersion},
    session::TransportSession,
};

/// State of the channel held by a [`ChannelManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No channel is open
    NoChannel,
    /// A channel is open and accepts commands
    Open,
}

/// Opens channels on a session and exchanges APDUs over them
pub struct ChannelManager {
    /// Logical reader name, used for logging
    reader_name: String,
    /// Negotiated service version
    version: ServiceVersion,
    /// Service implementation the channels are opened through
    backend: BackendKind,
    /// Minimum version for a non-zero control mask
    control_mask_min_version: ServiceVersion,
    /// Whether to log APDU traffic
    trace_apdus: bool,
    /// The open channel, if any
    channel: Option<Box<dyn NativeChannel>>,
    /// Response to the SELECT that opened the channel
    select_response: Bytes,
}

impl fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelManager")
            .field("reader_name", &self.reader_name)
            .field("version", &self.version)
            .field("backend", &self.backend)
            .field("state", &self.state())
            .field("select_response", &hex::encode_upper(&self.select_response))
            .finish()
    }
}

impl ChannelManager {
    /// Create a channel manager for a service of the given version
    pub fn new(
        reader_name: impl Into<String>,
        version: ServiceVersion,
        backend: BackendKind,
        config: &OmapiConfig,
    ) -> Self {
        Self {
            reader_name: reader_name.into(),
            version,
            backend,
            control_mask_min_version: config.control_mask_min_version,
            trace_apdus: config.trace_apdus,
            channel: None,
            select_response: Bytes::new(),
        }
    }

    /// Get the current channel state
    pub fn state(&self) -> ChannelState {
        match &self.channel {
            Some(channel) if !channel.is_closed() => ChannelState::Open,
            _ => ChannelState::NoChannel,
        }
    }

    /// Get the response to the SELECT that opened the current channel
    pub const fn select_response(&self) -> &Bytes {
        &self.select_response
    }

    /// Get the negotiated service version
    pub const fn version(&self) -> ServiceVersion {
        self.version
    }

    /// Get the service implementation the channels are opened through
    pub const fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Open a channel on `session`
    ///
    /// Without an AID the basic channel is opened and nothing is selected.
    /// With an AID a logical channel is opened selecting that applet, using
    /// `iso_control_mask` as the SELECT P2 parameter. Returns the select
    /// response, empty if the service provided none.
    ///
    /// A SIMalliance service only accepts a non-zero mask from the configured
    /// minimum version on, and is not given any P2 for a zero mask.
    pub fn open_channel_for_aid(
        &mut self,
        session: &mut TransportSession,
        aid: Option<&[u8]>,
        iso_control_mask: u8,
    ) -> Result<Bytes> {
        let aid = aid.filter(|aid| !aid.is_empty());
        let p2 = match aid {
            Some(_) => self.logical_channel_p2(iso_control_mask)?,
            None => None,
        };

        // The previous channel, if any, is invalidated by the new selection
        self.release();

        let Some(native_session) = session.session_mut() else {
            return Err(OmapiError::transport(match aid {
                None => "Failed to open the basic channel: physical channel is not open",
                Some(_) => "Failed to open the logical channel: physical channel is not open",
            }));
        };

        let channel = match aid {
            None => {
                debug!(reader = %self.reader_name, "Opening basic channel");
                native_session
                    .open_basic_channel(None)
                    .map_err(basic_channel_error)?
                    .ok_or_else(|| OmapiError::transport("Failed to open the basic channel"))?
            }
            Some(aid) => {
                debug!(
                    reader = %self.reader_name,
                    aid = %hex::encode_upper(aid),
                    p2 = iso_control_mask,
                    "Opening logical channel"
                );
                native_session
                    .open_logical_channel(aid, p2)
                    .map_err(|e| logical_channel_error(aid, iso_control_mask, e))?
                    .ok_or_else(|| OmapiError::transport("Failed to open the logical channel"))?
            }
        };

        self.select_response = channel.select_response().unwrap_or_default();
        self.channel = Some(channel);

        debug!(
            reader = %self.reader_name,
            fci = %hex::encode_upper(&self.select_response),
            "Channel opened"
        );
        Ok(self.select_response.clone())
    }

    /// Close every channel on `session`, keeping the session itself open
    pub fn close_logical_channel(&mut self, session: &mut TransportSession) {
        if let Some(native_session) = session.session_mut() {
            native_session.close_channels();
        }
        self.channel = None;
        self.select_response = Bytes::new();
        debug!(reader = %self.reader_name, "Logical channels closed");
    }

    /// Send a command APDU over the open channel and return the response
    pub fn transmit_apdu(&mut self, command: &[u8]) -> Result<Bytes> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| OmapiError::transport("Failed to transmit APDU: channel is not open"))?;

        if self.trace_apdus {
            trace!(
                reader = %self.reader_name,
                command = %hex::encode_upper(command),
                "Transmitting APDU"
            );
        }

        let response = channel.transmit(command).map_err(|e| {
            debug!(reader = %self.reader_name, error = %e, "Error during transmission");
            OmapiError::transport_caused_by("Failed to transmit APDU", e)
        })?;

        if self.trace_apdus {
            trace!(
                reader = %self.reader_name,
                response = %hex::encode_upper(&response),
                "Received APDU"
            );
        }
        Ok(response)
    }

    /// P2 to pass to the service when opening a logical channel
    fn logical_channel_p2(&self, iso_control_mask: u8) -> Result<Option<u8>> {
        match self.backend {
            BackendKind::Platform => Ok(Some(iso_control_mask)),
            BackendKind::SimAlliance if iso_control_mask == 0 => Ok(None),
            BackendKind::SimAlliance if self.version < self.control_mask_min_version => {
                Err(OmapiError::unsupported_feature(format!(
                    "P2 != 00h while opening a logical channel requires OMAPI version >= {}, \
                     current is {}",
                    self.control_mask_min_version, self.version
                )))
            }
            BackendKind::SimAlliance => Ok(Some(iso_control_mask)),
        }
    }

    /// Close and forget the current channel
    pub(crate) fn release(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            if !channel.is_closed() {
                channel.close();
            }
        }
        self.select_response = Bytes::new();
    }
}

fn basic_channel_error(error: ServiceError) -> OmapiError {
    match error {
        ServiceError::Security(_) => {
            OmapiError::transport_caused_by("Access denied while opening the basic channel", error)
        }
        _ => OmapiError::transport_caused_by("Failed to open the basic channel", error),
    }
}

fn logical_channel_error(aid: &[u8], p2: u8, error: ServiceError) -> OmapiError {
    let aid = hex::encode_upper(aid);
    match error {
        ServiceError::NoSuchElement(_) => {
            OmapiError::illegal_argument(format!("AID not found: {aid}"), Some(error))
        }
        ServiceError::Unsupported(reason) => OmapiError::unsupported_feature(format!(
            "P2 {p2:02X}h rejected while opening the logical channel. AID: {aid}: {reason}"
        )),
        ServiceError::Security(_) => OmapiError::transport_caused_by(
            format!("Access denied while opening the logical channel. AID: {aid}"),
            error,
        ),
        _ => OmapiError::transport_caused_by(
            format!("Failed to open the logical channel. AID: {aid}"),
            error,
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        error::ErrorKind,
        sim::{SimApplet, SimReader, SimReaderProfile},
    };

    const AID: &str = "A000000151000000";

    fn setup(version: ServiceVersion) -> (Arc<SimReader>, TransportSession, ChannelManager) {
        setup_with(version, BackendKind::Platform)
    }

    fn setup_with(
        version: ServiceVersion,
        backend: BackendKind,
    ) -> (Arc<SimReader>, TransportSession, ChannelManager) {
        let native = Arc::new(SimReader::new(SimReaderProfile {
            name: "SIM1".to_string(),
            applets: vec![
                SimApplet::new(AID, "6F108408A000000151000000A5049F6501FF9000")
                    .with_response("80CA9F7F00", "9F7F0102039000"),
            ],
            ..Default::default()
        })
        .unwrap());
        let session = TransportSession::new("ReaderSim1", native.clone());
        let channels = ChannelManager::new("ReaderSim1", version, backend, &OmapiConfig::default());
        (native, session, channels)
    }

    fn aid() -> Vec<u8> {
        hex::decode(AID).unwrap()
    }

    #[test]
    fn test_logical_channel_round_trip() {
        let (_, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();

        let fci = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x00)
            .unwrap();
        assert_eq!(hex::encode_upper(&fci), "6F108408A000000151000000A5049F6501FF9000");
        assert_eq!(channels.state(), ChannelState::Open);
        assert_eq!(channels.select_response(), &fci);

        let response = channels.transmit_apdu(&hex::decode("80CA9F7F00").unwrap()).unwrap();
        assert_eq!(hex::encode_upper(response), "9F7F0102039000");
    }

    #[test]
    fn test_basic_channel_without_aid() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();

        let fci = channels.open_channel_for_aid(&mut session, None, 0x00).unwrap();
        assert!(fci.is_empty());
        assert_eq!(channels.state(), ChannelState::Open);

        let stats = native.stats();
        assert_eq!(stats.basic_channels_opened, 1);
        assert_eq!(stats.logical_channel_attempts, 0);
    }

    #[test]
    fn test_empty_aid_opens_basic_channel() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();

        channels.open_channel_for_aid(&mut session, Some(&[][..]), 0x04).unwrap();
        assert_eq!(native.stats().basic_channels_opened, 1);
    }

    #[test]
    fn test_control_mask_requires_version() {
        let (native, mut session, mut channels) =
            setup_with(ServiceVersion::new(2, 5), BackendKind::SimAlliance);
        session.open().unwrap();

        let err = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x04)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert_eq!(native.stats().logical_channel_attempts, 0);

        // A zero mask is always accepted and sent without P2
        channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x00)
            .unwrap();
        let stats = native.stats();
        assert_eq!(stats.logical_channel_attempts, 1);
        assert_eq!(stats.last_p2, None);
    }

    #[test]
    fn test_control_mask_minimum_is_decimal() {
        let (native, mut session, mut channels) =
            setup_with("2.05".parse().unwrap(), BackendKind::SimAlliance);
        channels.control_mask_min_version = ServiceVersion::new(2, 1);
        session.open().unwrap();

        let err = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x04)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert!(err.to_string().contains("2.05"));
        assert_eq!(native.stats().logical_channel_attempts, 0);
    }

    #[test]
    fn test_control_mask_passed_through() {
        let (native, mut session, mut channels) =
            setup_with(ServiceVersion::new(3, 0), BackendKind::SimAlliance);
        session.open().unwrap();

        channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x04)
            .unwrap();
        assert_eq!(native.stats().last_p2, Some(0x04));
    }

    #[test]
    fn test_platform_ignores_service_version() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(2, 0));
        session.open().unwrap();

        channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x04)
            .unwrap();
        assert_eq!(channels.state(), ChannelState::Open);
        assert_eq!(native.stats().last_p2, Some(0x04));

        channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x00)
            .unwrap();
        assert_eq!(native.stats().last_p2, Some(0x00));
    }

    #[test]
    fn test_rejected_control_mask_is_unsupported_feature() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        native.reject_p2(Some(0x0C));
        session.open().unwrap();

        let err = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x0C)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedFeature);
        assert!(err.to_string().contains("0Ch"));
        assert_eq!(channels.state(), ChannelState::NoChannel);

        channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0x04)
            .unwrap();
        assert_eq!(channels.state(), ChannelState::Open);
    }

    #[test]
    fn test_aid_not_found() {
        let (_, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();

        let err = channels
            .open_channel_for_aid(&mut session, Some(&[0xA0, 0x00, 0x00, 0x00, 0x99][..]), 0x00)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IllegalArgument);
        assert!(err.to_string().contains("A000000099"));
        assert_eq!(channels.state(), ChannelState::NoChannel);
    }

    #[test]
    fn test_security_denial_is_transport() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        native.deny_access(true);
        session.open().unwrap();

        let basic = channels.open_channel_for_aid(&mut session, None, 0).unwrap_err();
        assert_eq!(basic.kind(), ErrorKind::Transport);
        assert!(matches!(basic.service_error(), Some(ServiceError::Security(_))));
        assert!(basic.to_string().contains("Access denied"));

        let logical = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0)
            .unwrap_err();
        assert_eq!(logical.kind(), ErrorKind::Transport);
        assert!(logical.to_string().contains(AID));
    }

    #[test]
    fn test_io_failure_is_transport() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();
        native.fail_channels(Some(ServiceError::io("link lost")));

        let err = channels.open_channel_for_aid(&mut session, None, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.service_error(), Some(&ServiceError::io("link lost")));
    }

    #[test]
    fn test_null_channel_is_transport() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();
        native.return_no_channel(true);

        let err = channels.open_channel_for_aid(&mut session, None, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.to_string(), "Failed to open the basic channel");
        assert!(err.service_error().is_none());

        let err = channels
            .open_channel_for_aid(&mut session, Some(aid().as_slice()), 0)
            .unwrap_err();
        assert_eq!(err.to_string(), "Failed to open the logical channel");
    }

    #[test]
    fn test_open_without_session() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));

        let err = channels.open_channel_for_aid(&mut session, None, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(channels.state(), ChannelState::NoChannel);
        assert_eq!(native.stats().basic_channels_opened, 0);
    }

    #[test]
    fn test_transmit_requires_channel() {
        let (_, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        let err = channels.transmit_apdu(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);

        session.open().unwrap();
        channels.open_channel_for_aid(&mut session, Some(aid().as_slice()), 0).unwrap();
        channels.close_logical_channel(&mut session);
        assert_eq!(channels.state(), ChannelState::NoChannel);
        assert!(session.is_open());

        let err = channels.transmit_apdu(&[0x00, 0xA4, 0x04, 0x00]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_new_channel_replaces_previous() {
        let (native, mut session, mut channels) = setup(ServiceVersion::new(3, 2));
        session.open().unwrap();

        channels.open_channel_for_aid(&mut session, Some(aid().as_slice()), 0).unwrap();
        channels.open_channel_for_aid(&mut session, None, 0).unwrap();

        let stats = native.stats();
        assert_eq!(stats.channels_closed, 1);
        assert_eq!(stats.open_channels, 1);
    }
}
