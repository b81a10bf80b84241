//! Secure element readers exposed by the plugin

use std::{fmt, sync::Arc};

use bytes::Bytes;

use crate::{
    backend::BackendKind,
    channel::{ChannelManager, ChannelState},
    config::OmapiConfig,
    error::Result,
    service::{NativeReader, ServiceVersion},
    session::TransportSession,
};

/// Name of the reader for the first SIM slot
pub const READER_NAME_SIM_1: &str = "ReaderSim1";

/// Name of the reader for the second SIM slot
pub const READER_NAME_SIM_2: &str = "ReaderSim2";

/// Name of the reader for the embedded secure element
pub const READER_NAME_ESE: &str = "ReaderEse";

/// Map a native reader name to the name exposed by the plugin
///
/// `SIM` and `SIM1` map to [`READER_NAME_SIM_1`], `SIM2` to
/// [`READER_NAME_SIM_2`] and `ESE` to [`READER_NAME_ESE`], ignoring case.
/// Other names are returned unchanged.
pub fn map_native_reader_name(native_name: &str) -> String {
    let is = |candidate: &str| native_name.eq_ignore_ascii_case(candidate);

    if is("SIM") || is("SIM1") {
        READER_NAME_SIM_1.to_string()
    } else if is("SIM2") {
        READER_NAME_SIM_2.to_string()
    } else if is("ESE") {
        READER_NAME_ESE.to_string()
    } else {
        native_name.to_string()
    }
}

/// Reader operations used by the card terminal framework
///
/// Readers select applets themselves: the framework asks for a channel on an
/// AID and gets the select response back.
pub trait ReaderSpi: fmt::Debug + Send {
    /// Get the reader name
    fn name(&self) -> &str;

    /// Check if the reader works with contactless cards
    fn is_contactless(&self) -> bool;

    /// Open a session with the secure element
    fn open_physical_channel(&mut self) -> Result<()>;

    /// Close the channel and the session, if open
    fn close_physical_channel(&mut self);

    /// Check if a session is open
    fn is_physical_channel_open(&self) -> bool;

    /// Check if a secure element is present
    fn check_card_presence(&self) -> bool;

    /// Get the hex encoded ATR, or an empty string
    fn power_on_data(&self) -> String;

    /// Open a channel selecting `aid` with SELECT parameter `iso_control_mask`
    ///
    /// Without an AID the basic channel is opened. Returns the select
    /// response, empty if the secure element provided none.
    fn open_channel_for_aid(&mut self, aid: Option<&[u8]>, iso_control_mask: u8) -> Result<Bytes>;

    /// Close the channels opened on the session
    fn close_logical_channel(&mut self);

    /// Exchange an APDU over the open channel
    fn transmit_apdu(&mut self, apdu: &[u8]) -> Result<Bytes>;

    /// Called when the plugin is unregistered
    fn on_unregister(&mut self) {
        self.close_physical_channel();
    }
}

/// A secure element slot of the OMAPI service
pub struct OmapiReader {
    name: String,
    native_name: String,
    session: TransportSession,
    channels: ChannelManager,
}

impl fmt::Debug for OmapiReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OmapiReader")
            .field("name", &self.name)
            .field("native_name", &self.native_name)
            .field("session", &self.session)
            .field("channels", &self.channels)
            .finish()
    }
}

impl OmapiReader {
    /// Wrap a native reader of a service with the given version
    pub fn new(
        native: Arc<dyn NativeReader>,
        version: ServiceVersion,
        backend: BackendKind,
        config: &OmapiConfig,
    ) -> Self {
        let native_name = native.name();
        let name = map_native_reader_name(&native_name);
        Self {
            session: TransportSession::new(name.clone(), native),
            channels: ChannelManager::new(name.clone(), version, backend, config),
            name,
            native_name,
        }
    }

    /// Get the name the service gives to this reader
    pub fn native_name(&self) -> &str {
        &self.native_name
    }

    /// Get the state of the channel
    pub fn channel_state(&self) -> ChannelState {
        self.channels.state()
    }

    /// Get the version of the service this reader belongs to
    pub const fn service_version(&self) -> ServiceVersion {
        self.channels.version()
    }

    /// Get the service implementation this reader belongs to
    pub const fn backend(&self) -> BackendKind {
        self.channels.backend()
    }

    /// Get the response to the SELECT that opened the current channel
    pub const fn select_response(&self) -> &Bytes {
        self.channels.select_response()
    }
}

impl ReaderSpi for OmapiReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_contactless(&self) -> bool {
        false
    }

    fn open_physical_channel(&mut self) -> Result<()> {
        self.channels.release();
        self.session.open()
    }

    fn close_physical_channel(&mut self) {
        self.channels.release();
        self.session.close();
    }

    fn is_physical_channel_open(&self) -> bool {
        self.session.is_open()
    }

    fn check_card_presence(&self) -> bool {
        self.session.check_card_presence()
    }

    fn power_on_data(&self) -> String {
        self.session.power_on_data()
    }

    fn open_channel_for_aid(&mut self, aid: Option<&[u8]>, iso_control_mask: u8) -> Result<Bytes> {
        self.channels
            .open_channel_for_aid(&mut self.session, aid, iso_control_mask)
    }

    fn close_logical_channel(&mut self) {
        self.channels.close_logical_channel(&mut self.session);
    }

    fn transmit_apdu(&mut self, apdu: &[u8]) -> Result<Bytes> {
        self.channels.transmit_apdu(apdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::ErrorKind,
        sim::{SimApplet, SimReader, SimReaderProfile},
    };

    fn reader(native_name: &str) -> (SimReader, OmapiReader) {
        let native = SimReader::new(SimReaderProfile {
            name: native_name.to_string(),
            atr: Some("3B8880010000000000000000F6".to_string()),
            applets: vec![SimApplet::new("A000000151000000", "6F009000")],
            ..Default::default()
        })
        .unwrap();
        let reader = OmapiReader::new(
            Arc::new(native.clone()),
            ServiceVersion::new(3, 3),
            BackendKind::Platform,
            &OmapiConfig::default(),
        );
        (native, reader)
    }

    #[test]
    fn test_name_mapping() {
        assert_eq!(map_native_reader_name("SIM"), "ReaderSim1");
        assert_eq!(map_native_reader_name("sim1"), "ReaderSim1");
        assert_eq!(map_native_reader_name("SIM2"), "ReaderSim2");
        assert_eq!(map_native_reader_name("eSE"), "ReaderEse");
        assert_eq!(map_native_reader_name("eSE1"), "eSE1");
        assert_eq!(map_native_reader_name("SD1"), "SD1");
        assert_eq!(map_native_reader_name(""), "");
    }

    #[test]
    fn test_identity() {
        let (_, reader) = reader("SIM1");
        assert_eq!(reader.name(), READER_NAME_SIM_1);
        assert_eq!(reader.native_name(), "SIM1");
        assert!(!reader.is_contactless());
        assert_eq!(reader.service_version(), ServiceVersion::new(3, 3));
        assert_eq!(reader.backend(), BackendKind::Platform);
    }

    #[test]
    fn test_close_physical_channel_is_idempotent() {
        let (native, mut reader) = reader("SIM1");

        reader.close_physical_channel();
        assert!(!reader.is_physical_channel_open());

        reader.open_physical_channel().unwrap();
        reader.open_channel_for_aid(None, 0).unwrap();
        reader.close_physical_channel();
        assert!(!reader.is_physical_channel_open());
        assert_eq!(reader.channel_state(), ChannelState::NoChannel);

        reader.close_physical_channel();
        assert!(!reader.is_physical_channel_open());
        assert_eq!(native.stats().open_sessions, 0);
    }

    #[test]
    fn test_power_on_data_follows_session() {
        let (_, mut reader) = reader("eSE");
        assert_eq!(reader.power_on_data(), "");

        reader.open_physical_channel().unwrap();
        assert_eq!(reader.power_on_data(), "3B8880010000000000000000F6");
    }

    #[test]
    fn test_transmit_after_close_fails() {
        let (_, mut reader) = reader("SIM1");
        reader.open_physical_channel().unwrap();
        reader
            .open_channel_for_aid(Some(&[0xA0, 0x00, 0x00, 0x01, 0x51, 0x00, 0x00, 0x00][..]), 0)
            .unwrap();
        assert!(reader.transmit_apdu(&[0x00, 0xCA, 0x00, 0x00, 0x00]).is_ok());

        reader.close_physical_channel();
        let err = reader.transmit_apdu(&[0x00, 0xCA, 0x00, 0x00, 0x00]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_on_unregister_closes_session() {
        let (native, mut reader) = reader("SIM2");
        reader.open_physical_channel().unwrap();
        assert_eq!(native.stats().open_sessions, 1);

        reader.on_unregister();
        assert!(!reader.is_physical_channel_open());
        assert_eq!(native.stats().open_sessions, 0);
    }
}
