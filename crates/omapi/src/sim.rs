//! Simulated secure element service
//!
//! An in-process implementation of the [`service`](crate::service) traits,
//! driven by a [`SimProfile`]. Readers, sessions and channels share one state
//! per reader so that tests can inject faults and inspect what the transport
//! asked the platform to do.
//!
//! Each applet answers the commands listed in its profile and `6D00` to
//! anything else. The basic channel understands SELECT by name and routes
//! further commands to the selected applet.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    backend::{PlatformEnvironment, SIMALLIANCE_PACKAGE},
    error::ServiceError,
    service::{
        ConnectedListener, NativeChannel, NativeReader, NativeSession, SeService,
        ServiceConnector,
    },
};

const SW_INS_NOT_SUPPORTED: [u8; 2] = [0x6D, 0x00];
const SW_FILE_NOT_FOUND: [u8; 2] = [0x6A, 0x82];
const SW_NO_APPLET_SELECTED: [u8; 2] = [0x69, 0x85];

/// Errors in a simulation profile
#[derive(Debug, thiserror::Error)]
pub enum SimProfileError {
    /// A field holds something that is not hex
    #[error("Invalid hex in {field}: {value:?}")]
    InvalidHex {
        /// Name of the offending field
        field: &'static str,
        /// The offending value
        value: String,
        /// Decoding error
        #[source]
        source: hex::FromHexError,
    },
}

fn decode(field: &'static str, value: &str) -> Result<Bytes, SimProfileError> {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&compact)
        .map(Bytes::from)
        .map_err(|source| SimProfileError::InvalidHex {
            field,
            value: value.to_string(),
            source,
        })
}

/// Description of a simulated secure element service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimProfile {
    /// Version string reported by the service
    pub version: String,
    /// Readers exposed by the service
    pub readers: Vec<SimReaderProfile>,
}

impl Default for SimProfile {
    fn default() -> Self {
        Self {
            version: "3.3".to_string(),
            readers: Vec::new(),
        }
    }
}

impl SimProfile {
    /// A SIM with a transit and a payment applet, and an embedded secure element
    pub fn demo() -> Self {
        Self {
            version: "3.3".to_string(),
            readers: vec![
                SimReaderProfile {
                    name: "SIM1".to_string(),
                    atr: Some("3B8880010000000000000000F6".to_string()),
                    applets: vec![
                        SimApplet::new(
                            "315449432E494341",
                            "6F238409315449432E494341A516BF0C13C70800000000112233445307\
                             0A3C23121410019000",
                        )
                        .with_response(
                            "00B2013C00",
                            "24B92848080000131A50001200000000000000000000AAAAAA9000",
                        )
                        .with_response("0084000008", "0102030405060708 9000"),
                        SimApplet::new(
                            "325041592E5359532E4444463031",
                            "6F1A840E325041592E5359532E4444463031A5088801025F2D02656E9000",
                        ),
                    ],
                    ..Default::default()
                },
                SimReaderProfile {
                    name: "eSE".to_string(),
                    atr: None,
                    applets: vec![
                        SimApplet::new(
                            "A000000151000000",
                            "6F108408A000000151000000A5049F6501FF9000",
                        )
                        .with_response(
                            "80CA9F7F00",
                            "9F7F2A40906800129191000000000000000000009000",
                        ),
                    ],
                    ..Default::default()
                },
            ],
        }
    }
}

/// Description of one simulated reader
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimReaderProfile {
    /// Native reader name
    pub name: String,
    /// Whether a secure element is present
    pub present: bool,
    /// Hex encoded Answer To Reset, if the service reports one
    pub atr: Option<String>,
    /// Number of logical channels the secure element supports
    pub max_logical_channels: usize,
    /// Applets installed on the secure element
    pub applets: Vec<SimApplet>,
}

impl Default for SimReaderProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            present: true,
            atr: None,
            max_logical_channels: 3,
            applets: Vec::new(),
        }
    }
}

/// Description of one applet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimApplet {
    /// Hex encoded application identifier
    pub aid: String,
    /// Hex encoded response to SELECT, if any
    #[serde(default)]
    pub fci: Option<String>,
    /// Canned responses, keyed by hex encoded command
    #[serde(default)]
    pub responses: BTreeMap<String, String>,
}

impl SimApplet {
    /// Create an applet answering SELECT with `fci`
    pub fn new(aid: impl Into<String>, fci: impl Into<String>) -> Self {
        Self {
            aid: aid.into(),
            fci: Some(fci.into()),
            responses: BTreeMap::new(),
        }
    }

    /// Add a canned response
    pub fn with_response(
        mut self,
        command: impl Into<String>,
        response: impl Into<String>,
    ) -> Self {
        self.responses.insert(command.into(), response.into());
        self
    }
}

/// Applet with decoded fields
#[derive(Debug, Clone)]
struct Applet {
    aid: Bytes,
    fci: Option<Bytes>,
    responses: Vec<(Bytes, Bytes)>,
}

impl Applet {
    fn compile(applet: &SimApplet) -> Result<Self, SimProfileError> {
        let responses = applet
            .responses
            .iter()
            .map(|(command, response)| {
                Ok((decode("responses", command)?, decode("responses", response)?))
            })
            .collect::<Result<_, SimProfileError>>()?;

        Ok(Self {
            aid: decode("aid", &applet.aid)?,
            fci: applet.fci.as_deref().map(|fci| decode("fci", fci)).transpose()?,
            responses,
        })
    }

    fn respond(&self, command: &[u8]) -> Bytes {
        self.responses
            .iter()
            .find(|(c, _)| c[..] == *command)
            .map_or_else(
                || Bytes::from_static(&SW_INS_NOT_SUPPORTED),
                |(_, r)| r.clone(),
            )
    }
}

/// Counters describing what was asked of a simulated reader
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimStats {
    /// Sessions opened
    pub sessions_opened: usize,
    /// Sessions currently open
    pub open_sessions: usize,
    /// Basic channels opened
    pub basic_channels_opened: usize,
    /// Calls to open a logical channel, successful or not
    pub logical_channel_attempts: usize,
    /// P2 of the last logical channel request, `None` if it carried none
    pub last_p2: Option<u8>,
    /// Channels closed one by one
    pub channels_closed: usize,
    /// Channels currently open
    pub open_channels: usize,
    /// Commands transmitted
    pub commands: usize,
}

#[derive(Debug, Default)]
struct Faults {
    open_session: Option<ServiceError>,
    channels: Option<ServiceError>,
    transmit: Option<ServiceError>,
    deny_access: bool,
    no_channel: bool,
    rejected_p2: Option<u8>,
}

#[derive(Debug, Default)]
struct SessionRecord {
    closed: bool,
    /// Open channels by id, `true` for the basic channel
    channels: HashMap<usize, bool>,
}

#[derive(Debug)]
struct ReaderState {
    present: bool,
    faults: Faults,
    stats: SimStats,
    sessions: HashMap<usize, SessionRecord>,
    next_id: usize,
}

impl ReaderState {
    fn next_id(&mut self) -> usize {
        self.next_id += 1;
        self.next_id
    }

    fn refresh_counts(&mut self) {
        let open = self.sessions.values().filter(|s| !s.closed);
        self.stats.open_sessions = open.clone().count();
        self.stats.open_channels = open.map(|s| s.channels.len()).sum();
    }
}

#[derive(Debug)]
struct ReaderShared {
    name: String,
    atr: Option<Bytes>,
    max_logical_channels: usize,
    applets: Vec<Applet>,
    state: Mutex<ReaderState>,
}

impl ReaderShared {
    fn applet(&self, aid: &[u8]) -> Option<&Applet> {
        self.applets.iter().find(|a| a.aid[..] == *aid)
    }
}

/// A simulated secure element slot
#[derive(Debug, Clone)]
pub struct SimReader {
    shared: Arc<ReaderShared>,
}

impl SimReader {
    /// Create a reader from its profile
    pub fn new(profile: SimReaderProfile) -> Result<Self, SimProfileError> {
        let applets = profile
            .applets
            .iter()
            .map(Applet::compile)
            .collect::<Result<_, _>>()?;

        Ok(Self {
            shared: Arc::new(ReaderShared {
                atr: profile.atr.as_deref().map(|atr| decode("atr", atr)).transpose()?,
                name: profile.name,
                max_logical_channels: profile.max_logical_channels,
                applets,
                state: Mutex::new(ReaderState {
                    present: profile.present,
                    faults: Faults::default(),
                    stats: SimStats::default(),
                    sessions: HashMap::new(),
                    next_id: 0,
                }),
            }),
        })
    }

    /// Get a snapshot of the counters
    pub fn stats(&self) -> SimStats {
        self.shared.state.lock().stats.clone()
    }

    /// Insert or remove the secure element
    pub fn set_present(&self, present: bool) {
        self.shared.state.lock().present = present;
    }

    /// Make opening a session fail with `error`
    pub fn fail_open_session(&self, error: Option<ServiceError>) {
        self.shared.state.lock().faults.open_session = error;
    }

    /// Make opening a channel fail with `error`
    pub fn fail_channels(&self, error: Option<ServiceError>) {
        self.shared.state.lock().faults.channels = error;
    }

    /// Make transmitting fail with `error`
    pub fn fail_transmit(&self, error: Option<ServiceError>) {
        self.shared.state.lock().faults.transmit = error;
    }

    /// Refuse access to every channel
    pub fn deny_access(&self, deny: bool) {
        self.shared.state.lock().faults.deny_access = deny;
    }

    /// Return no channel, without an error, when one is requested
    pub fn return_no_channel(&self, no_channel: bool) {
        self.shared.state.lock().faults.no_channel = no_channel;
    }

    /// Reject logical channel requests carrying this P2 as unsupported
    pub fn reject_p2(&self, p2: Option<u8>) {
        self.shared.state.lock().faults.rejected_p2 = p2;
    }
}

impl NativeReader for SimReader {
    fn name(&self) -> String {
        self.shared.name.clone()
    }

    fn is_secure_element_present(&self) -> bool {
        self.shared.state.lock().present
    }

    fn open_session(&self) -> Result<Box<dyn NativeSession>, ServiceError> {
        let mut state = self.shared.state.lock();
        if let Some(error) = state.faults.open_session.clone() {
            return Err(error);
        }
        if !state.present {
            return Err(ServiceError::io("Secure element is not present"));
        }

        let id = state.next_id();
        state.sessions.insert(id, SessionRecord::default());
        state.stats.sessions_opened += 1;
        state.refresh_counts();

        Ok(Box::new(SimSession {
            shared: Arc::clone(&self.shared),
            id,
        }))
    }
}

/// A session on a simulated reader
#[derive(Debug)]
pub struct SimSession {
    shared: Arc<ReaderShared>,
    id: usize,
}

impl SimSession {
    fn open_channel(
        &mut self,
        aid: Option<&[u8]>,
        basic: bool,
    ) -> Result<Option<Box<dyn NativeChannel>>, ServiceError> {
        let mut state = self.shared.state.lock();
        let faults = &state.faults;
        if let Some(error) = faults.channels.clone() {
            return Err(error);
        }
        if faults.deny_access {
            return Err(ServiceError::security("Access to the applet is not allowed"));
        }
        if faults.no_channel {
            return Ok(None);
        }

        let applet = match aid {
            Some(aid) => Some(
                self.shared
                    .applet(aid)
                    .ok_or_else(|| ServiceError::no_such_element(hex::encode_upper(aid)))?
                    .clone(),
            ),
            None => None,
        };

        let id = state.next_id();
        let max_logical = self.shared.max_logical_channels;
        let session = state
            .sessions
            .get_mut(&self.id)
            .filter(|s| !s.closed)
            .ok_or_else(|| ServiceError::illegal_state("Session is closed"))?;

        if basic && session.channels.values().any(|&b| b) {
            return Ok(None);
        }
        if !basic && session.channels.values().filter(|&&b| !b).count() >= max_logical {
            return Ok(None);
        }
        session.channels.insert(id, basic);

        if basic {
            state.stats.basic_channels_opened += 1;
        }
        state.refresh_counts();

        Ok(Some(Box::new(SimChannel {
            shared: Arc::clone(&self.shared),
            session: self.id,
            id,
            basic,
            select_response: applet.as_ref().and_then(|a| a.fci.clone()),
            selected: applet,
        })))
    }
}

impl NativeSession for SimSession {
    fn atr(&self) -> Option<Bytes> {
        self.shared.atr.clone()
    }

    fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state.sessions.get(&self.id).is_none_or(|s| s.closed)
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.closed = true;
            session.channels.clear();
        }
        state.refresh_counts();
    }

    fn close_channels(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(session) = state.sessions.get_mut(&self.id) {
            session.channels.clear();
        }
        state.refresh_counts();
    }

    fn open_basic_channel(
        &mut self,
        aid: Option<&[u8]>,
    ) -> Result<Option<Box<dyn NativeChannel>>, ServiceError> {
        self.open_channel(aid, true)
    }

    fn open_logical_channel(
        &mut self,
        aid: &[u8],
        p2: Option<u8>,
    ) -> Result<Option<Box<dyn NativeChannel>>, ServiceError> {
        {
            let mut state = self.shared.state.lock();
            state.stats.logical_channel_attempts += 1;
            state.stats.last_p2 = p2;
            if let Some(p2) = p2.filter(|&p2| state.faults.rejected_p2 == Some(p2)) {
                return Err(ServiceError::unsupported(format!(
                    "P2 {p2:02X}h is not supported by the secure element"
                )));
            }
        }
        self.open_channel(Some(aid), false)
    }
}

/// A channel on a simulated session
#[derive(Debug)]
pub struct SimChannel {
    shared: Arc<ReaderShared>,
    session: usize,
    id: usize,
    basic: bool,
    select_response: Option<Bytes>,
    selected: Option<Applet>,
}

impl SimChannel {
    /// Handle SELECT by name on the basic channel
    fn select(&mut self, command: &[u8]) -> Option<Bytes> {
        let is_select_by_name = command.len() >= 5 && command[1] == 0xA4 && command[2] == 0x04;
        if !self.basic || !is_select_by_name {
            return None;
        }

        let lc = usize::from(command[4]);
        let aid = command.get(5..5 + lc)?;
        Some(match self.shared.applet(aid) {
            Some(applet) => {
                let fci = applet
                    .fci
                    .clone()
                    .unwrap_or_else(|| Bytes::from_static(&[0x90, 0x00]));
                self.selected = Some(applet.clone());
                fci
            }
            None => Bytes::from_static(&SW_FILE_NOT_FOUND),
        })
    }
}

impl NativeChannel for SimChannel {
    fn is_basic_channel(&self) -> bool {
        self.basic
    }

    fn is_closed(&self) -> bool {
        let state = self.shared.state.lock();
        state
            .sessions
            .get(&self.session)
            .is_none_or(|s| s.closed || !s.channels.contains_key(&self.id))
    }

    fn select_response(&self) -> Option<Bytes> {
        self.select_response.clone()
    }

    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, ServiceError> {
        if self.is_closed() {
            return Err(ServiceError::illegal_state("Channel is closed"));
        }
        {
            let mut state = self.shared.state.lock();
            if let Some(error) = state.faults.transmit.clone() {
                return Err(error);
            }
            state.stats.commands += 1;
        }

        if let Some(response) = self.select(command) {
            return Ok(response);
        }
        Ok(match &self.selected {
            Some(applet) => applet.respond(command),
            None => Bytes::from_static(&SW_NO_APPLET_SELECTED),
        })
    }

    fn close(&mut self) {
        let mut state = self.shared.state.lock();
        let removed = state
            .sessions
            .get_mut(&self.session)
            .and_then(|s| s.channels.remove(&self.id))
            .is_some();
        if removed {
            state.stats.channels_closed += 1;
        }
        state.refresh_counts();
    }
}

/// A simulated secure element service
#[derive(Debug)]
pub struct SimService {
    version: String,
    connected: AtomicBool,
    readers: Mutex<Vec<SimReader>>,
}

impl SimService {
    /// Create a service from its profile
    pub fn new(profile: SimProfile) -> Result<Self, SimProfileError> {
        let readers = profile
            .readers
            .into_iter()
            .map(SimReader::new)
            .collect::<Result<_, _>>()?;

        Ok(Self {
            version: profile.version,
            connected: AtomicBool::new(false),
            readers: Mutex::new(readers),
        })
    }

    /// Get a simulated reader by native name
    pub fn reader(&self, name: &str) -> Option<SimReader> {
        self.readers
            .lock()
            .iter()
            .find(|r| r.shared.name == name)
            .cloned()
    }

    /// Attach a new reader, as when a secure element slot appears
    pub fn attach_reader(&self, profile: SimReaderProfile) -> Result<SimReader, SimProfileError> {
        let reader = SimReader::new(profile)?;
        self.readers.lock().push(reader.clone());
        Ok(reader)
    }

    /// Detach a reader by native name
    pub fn detach_reader(&self, name: &str) {
        self.readers.lock().retain(|r| r.shared.name != name);
    }

    fn set_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }
}

impl SeService for SimService {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn version(&self) -> String {
        self.version.clone()
    }

    fn readers(&self) -> Vec<Arc<dyn NativeReader>> {
        self.readers
            .lock()
            .iter()
            .map(|r| Arc::new(r.clone()) as Arc<dyn NativeReader>)
            .collect()
    }
}

/// How a [`SimConnector`] delivers the connected event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Before `connect` returns, on the calling thread
    Immediate,
    /// When [`SimConnector::deliver`] is called
    Deferred,
    /// On a freshly spawned thread, like a single thread executor
    Executor,
}

/// Binds to a [`SimService`]
pub struct SimConnector {
    service: Arc<SimService>,
    delivery: Delivery,
    connects: AtomicUsize,
    failure: Mutex<Option<ServiceError>>,
    pending: Mutex<Vec<ConnectedListener>>,
}

impl fmt::Debug for SimConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimConnector")
            .field("delivery", &self.delivery)
            .field("connects", &self.connect_count())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

impl SimConnector {
    /// Create a connector for `service`
    pub fn new(service: Arc<SimService>, delivery: Delivery) -> Self {
        Self {
            service,
            delivery,
            connects: AtomicUsize::new(0),
            failure: Mutex::new(None),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Get the simulated service
    pub const fn service(&self) -> &Arc<SimService> {
        &self.service
    }

    /// Number of times `connect` was called
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Make binding fail with `error`
    pub fn fail_with(&self, error: Option<ServiceError>) {
        *self.failure.lock() = error;
    }

    /// Deliver the connected event to every deferred listener
    pub fn deliver(&self) {
        let listeners = std::mem::take(&mut *self.pending.lock());
        if !listeners.is_empty() {
            self.service.set_connected();
        }
        for listener in listeners {
            listener();
        }
    }
}

impl ServiceConnector for SimConnector {
    fn connect(
        &self,
        on_connected: ConnectedListener,
    ) -> Result<Arc<dyn SeService>, ServiceError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.failure.lock().clone() {
            return Err(error);
        }

        match self.delivery {
            Delivery::Immediate => {
                self.service.set_connected();
                on_connected();
            }
            Delivery::Deferred => self.pending.lock().push(on_connected),
            Delivery::Executor => {
                let service = Arc::clone(&self.service);
                thread::spawn(move || {
                    debug!("Delivering simulated service connection");
                    service.set_connected();
                    on_connected();
                });
            }
        }

        Ok(Arc::clone(&self.service) as Arc<dyn SeService>)
    }
}

/// A simulated platform
#[derive(Debug)]
pub struct SimEnvironment {
    /// SDK level reported by the platform
    pub sdk_version: u32,
    /// Installed packages
    pub packages: Vec<String>,
    /// Connector for the OS integrated service
    pub platform: Arc<SimConnector>,
    /// Connector for the SIMalliance service
    pub simalliance: Arc<SimConnector>,
}

impl SimEnvironment {
    /// A platform with the OS integrated service, backed by `connector`
    pub fn platform(connector: Arc<SimConnector>) -> Self {
        Self {
            sdk_version: 28,
            packages: Vec::new(),
            simalliance: Arc::clone(&connector),
            platform: connector,
        }
    }

    /// An older platform with the SIMalliance service, backed by `connector`
    pub fn simalliance(connector: Arc<SimConnector>) -> Self {
        Self {
            sdk_version: 26,
            packages: vec![SIMALLIANCE_PACKAGE.to_string()],
            platform: Arc::clone(&connector),
            simalliance: connector,
        }
    }
}

impl PlatformEnvironment for SimEnvironment {
    fn sdk_version(&self) -> u32 {
        self.sdk_version
    }

    fn is_package_installed(&self, package: &str) -> bool {
        self.packages.iter().any(|p| p == package)
    }

    fn platform_connector(&self) -> Arc<dyn ServiceConnector> {
        Arc::clone(&self.platform) as Arc<dyn ServiceConnector>
    }

    fn simalliance_connector(&self) -> Arc<dyn ServiceConnector> {
        Arc::clone(&self.simalliance) as Arc<dyn ServiceConnector>
    }
}
