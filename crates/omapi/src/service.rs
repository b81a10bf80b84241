//! Platform secure element service abstraction
//!
//! These traits describe what the transport consumes from the platform: a
//! service that can be bound asynchronously, the native readers it exposes,
//! sessions opened on those readers and channels opened on a session. They
//! mirror the Open Mobile API object model, so a platform binding only has to
//! forward each call.

use std::{fmt, str::FromStr, sync::Arc};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

/// Listener invoked by the platform once the service is ready
pub type ConnectedListener = Box<dyn FnOnce() + Send + 'static>;

/// Binds to the platform secure element service
pub trait ServiceConnector: fmt::Debug + Send + Sync {
    /// Start binding to the service
    ///
    /// The service handle is returned straight away, before it is usable.
    /// The platform calls `on_connected` once the binding completes, from
    /// whatever thread it delivers that event on. It may do so before this
    /// method returns.
    fn connect(&self, on_connected: ConnectedListener)
    -> Result<Arc<dyn SeService>, ServiceError>;
}

/// A bound secure element service
pub trait SeService: fmt::Debug + Send + Sync {
    /// Check if the binding to the service is established
    fn is_connected(&self) -> bool;

    /// Get the version string of the service implementation
    fn version(&self) -> String;

    /// List the readers known to the service
    fn readers(&self) -> Vec<Arc<dyn NativeReader>>;
}

/// A secure element slot exposed by the service
pub trait NativeReader: fmt::Debug + Send + Sync {
    /// Get the native name of the reader (`SIM1`, `eSE`, ...)
    fn name(&self) -> String;

    /// Check if a secure element is present in the slot
    fn is_secure_element_present(&self) -> bool;

    /// Open a session with the secure element
    fn open_session(&self) -> Result<Box<dyn NativeSession>, ServiceError>;
}

/// A connection to one secure element
pub trait NativeSession: fmt::Debug + Send {
    /// Get the Answer To Reset of the secure element, if the service provides it
    fn atr(&self) -> Option<Bytes>;

    /// Check if the session has been closed
    fn is_closed(&self) -> bool;

    /// Close the session and every channel opened on it
    fn close(&mut self);

    /// Close every channel opened on this session, keeping the session open
    fn close_channels(&mut self);

    /// Open the basic channel, optionally selecting an applet
    ///
    /// `Ok(None)` means the service returned no channel without raising an error.
    fn open_basic_channel(
        &mut self,
        aid: Option<&[u8]>,
    ) -> Result<Option<Box<dyn NativeChannel>>, ServiceError>;

    /// Open a logical channel selecting the applet `aid`
    ///
    /// `p2` is the SELECT P2 parameter. With `None` the service uses its
    /// default. `Ok(None)` means the service returned no channel without
    /// raising an error.
    fn open_logical_channel(
        &mut self,
        aid: &[u8],
        p2: Option<u8>,
    ) -> Result<Option<Box<dyn NativeChannel>>, ServiceError>;
}

/// A basic or logical channel opened on a session
pub trait NativeChannel: fmt::Debug + Send {
    /// Check if this is the basic channel
    fn is_basic_channel(&self) -> bool;

    /// Check if the channel has been closed
    fn is_closed(&self) -> bool;

    /// Get the response to the SELECT command that opened the channel
    fn select_response(&self) -> Option<Bytes>;

    /// Send a command APDU and return the response APDU
    fn transmit(&mut self, command: &[u8]) -> Result<Bytes, ServiceError>;

    /// Close the channel
    fn close(&mut self);
}

/// Digits kept after the dot of a version
const FRACTION_DIGITS: usize = 4;

/// Version of the OMAPI service implementation
///
/// The part after the dot is a decimal fraction, so `2.05` is older than
/// `2.1` and `2.10` equals `2.1`. At most four fractional digits are kept.
/// Serialized as a string such as `"3.0"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServiceVersion {
    major: u16,
    /// Fractional part in ten-thousandths
    fraction: u16,
}

impl ServiceVersion {
    /// Version `0.0`, used when the service reports nothing usable
    pub const UNKNOWN: Self = Self::new(0, 0);

    /// Create the version `major.minor`
    ///
    /// `minor` is read as the digits written after the dot, so `new(2, 5)` is
    /// `2.5`. Use [`str::parse`] for versions with leading zeros such as
    /// `2.05`.
    pub const fn new(major: u16, minor: u16) -> Self {
        let mut fraction = minor as u32;
        while fraction >= 10_000 {
            fraction /= 10;
        }
        while fraction != 0 && fraction < 1_000 {
            fraction *= 10;
        }
        Self {
            major,
            fraction: fraction as u16,
        }
    }

    /// Get the major version
    pub const fn major(&self) -> u16 {
        self.major
    }

    /// Parse a version string, falling back to [`Self::UNKNOWN`]
    pub fn parse_lossy(version: &str) -> Self {
        version.parse().unwrap_or_else(|_| {
            tracing::warn!(version, "Unparseable OMAPI service version");
            Self::UNKNOWN
        })
    }
}

impl Default for ServiceVersion {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

impl fmt::Display for ServiceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = format!("{:0width$}", self.fraction, width = FRACTION_DIGITS);
        let digits = digits.trim_end_matches('0');
        if digits.is_empty() {
            write!(f, "{}.0", self.major)
        } else {
            write!(f, "{}.{digits}", self.major)
        }
    }
}

/// Error parsing a [`ServiceVersion`]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid service version: {0:?}")]
pub struct ParseVersionError(String);

impl FromStr for ServiceVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseVersionError(s.to_string());
        let mut parts = s.trim().splitn(3, '.');

        let major = parts
            .next()
            .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|p| p.parse().ok())
            .ok_or_else(invalid)?;

        let fraction = match parts.next() {
            Some(p) if !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()) => {
                let mut digits: String = p.chars().take(FRACTION_DIGITS).collect();
                while digits.len() < FRACTION_DIGITS {
                    digits.push('0');
                }
                digits.parse().map_err(|_| invalid())?
            }
            Some(_) => return Err(invalid()),
            None => 0,
        };

        Ok(Self { major, fraction })
    }
}

impl TryFrom<String> for ServiceVersion {
    type Error = ParseVersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServiceVersion> for String {
    fn from(version: ServiceVersion) -> Self {
        version.to_string()
    }
}
