//! Selection of the platform OMAPI implementation

use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    config::OmapiConfig,
    error::{OmapiError, Result},
    reader::{OmapiReader, ReaderSpi},
    service::{ConnectedListener, NativeReader, SeService, ServiceConnector, ServiceVersion},
};

/// First SDK level shipping the OS integrated OMAPI service
pub const PLATFORM_OMAPI_MIN_SDK: u32 = 28;

/// Package of the SIMalliance Open Mobile API service
pub const SIMALLIANCE_PACKAGE: &str = "org.simalliance.openmobileapi.service";

/// What the plugin needs to know about the platform it runs on
pub trait PlatformEnvironment: fmt::Debug + Send + Sync {
    /// SDK level of the platform
    fn sdk_version(&self) -> u32;

    /// Check if a package is installed
    fn is_package_installed(&self, package: &str) -> bool;

    /// Connector for the OS integrated OMAPI service
    fn platform_connector(&self) -> Arc<dyn ServiceConnector>;

    /// Connector for the SIMalliance OMAPI service
    fn simalliance_connector(&self) -> Arc<dyn ServiceConnector>;
}

/// Which OMAPI implementation a backend talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// OS integrated service
    Platform,
    /// SIMalliance service package
    SimAlliance,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Platform => write!(f, "platform"),
            Self::SimAlliance => write!(f, "simalliance"),
        }
    }
}

/// An OMAPI implementation the plugin can bind to
#[derive(Debug, Clone)]
pub enum OmapiBackend {
    /// OS integrated service, SDK 28 and later
    Platform(Arc<dyn ServiceConnector>),
    /// SIMalliance service on older platforms
    SimAlliance(Arc<dyn ServiceConnector>),
}

impl OmapiBackend {
    /// Pick the backend available on `env`
    ///
    /// The OS integrated service wins when both are available.
    pub fn select(env: &dyn PlatformEnvironment) -> Result<Self> {
        let sdk = env.sdk_version();
        if sdk >= PLATFORM_OMAPI_MIN_SDK {
            debug!(sdk, "Using the platform OMAPI service");
            return Ok(Self::Platform(env.platform_connector()));
        }
        if env.is_package_installed(SIMALLIANCE_PACKAGE) {
            debug!(sdk, "Using the SIMalliance OMAPI service");
            return Ok(Self::SimAlliance(env.simalliance_connector()));
        }
        Err(OmapiError::transport("No OMAPI service available"))
    }

    /// Get the kind of this backend
    pub const fn kind(&self) -> BackendKind {
        match self {
            Self::Platform(_) => BackendKind::Platform,
            Self::SimAlliance(_) => BackendKind::SimAlliance,
        }
    }

    const fn connector(&self) -> &Arc<dyn ServiceConnector> {
        match self {
            Self::Platform(connector) | Self::SimAlliance(connector) => connector,
        }
    }

    /// Start binding to the service, `listener` fires once it is ready
    pub fn connect_to_service(&self, listener: ConnectedListener) -> Result<Arc<dyn SeService>> {
        self.connector().connect(listener).map_err(|e| {
            OmapiError::transport_caused_by("Failed to connect to the OMAPI service", e)
        })
    }

    /// List the native readers of a bound service
    pub fn list_native_readers(&self, service: &dyn SeService) -> Vec<Arc<dyn NativeReader>> {
        service.readers()
    }

    /// Wrap a native reader as a plugin reader
    pub fn wrap_as_reader(
        &self,
        native: Arc<dyn NativeReader>,
        version: ServiceVersion,
        config: &OmapiConfig,
    ) -> OmapiReader {
        let reader = OmapiReader::new(native, version, self.kind(), config);
        info!(
            backend = %self.kind(),
            reader = reader.name(),
            native = reader.native_name(),
            present = reader.check_card_presence(),
            "Reader available"
        );
        reader
    }
}
