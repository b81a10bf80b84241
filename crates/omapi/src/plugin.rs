//! OMAPI plugin and its factory

use std::{fmt, sync::Arc};

use tracing::{debug, info};

use crate::{
    backend::{BackendKind, OmapiBackend, PlatformEnvironment},
    config::OmapiConfig,
    connection::PluginConnection,
    error::Result,
    event::{ConnectionEventReceiver, ServiceConnected, connection_event_channel},
    reader::OmapiReader,
    service::ServiceVersion,
};

/// Plugin operations used by the card terminal framework
pub trait PluginSpi: fmt::Debug + Send + Sync {
    /// Reader type exposed by the plugin
    type Reader;

    /// Get the plugin name
    fn name(&self) -> &str;

    /// List the readers currently available
    fn search_available_readers(&self) -> Vec<Self::Reader>;

    /// Called when the plugin is unregistered from the framework
    fn on_unregister(&self);
}

/// Plugin exposing the secure elements of the OMAPI service as readers
#[derive(Debug)]
pub struct OmapiPlugin {
    config: OmapiConfig,
    backend: OmapiBackend,
    connection: PluginConnection,
}

impl OmapiPlugin {
    /// Create a disconnected plugin on `backend`
    pub fn new(backend: OmapiBackend, config: OmapiConfig) -> Self {
        Self {
            config,
            backend,
            connection: PluginConnection::new(),
        }
    }

    /// Create a disconnected plugin on the backend available on `env`
    pub fn from_environment(env: &dyn PlatformEnvironment, config: OmapiConfig) -> Result<Self> {
        Ok(Self::new(OmapiBackend::select(env)?, config))
    }

    /// Connect to the OMAPI service, then run `callback`
    ///
    /// Runs `callback` right away when already connected. Otherwise it runs
    /// on the thread the platform delivers the ready event on. Calls made
    /// while a connection is in progress wait for that same connection.
    pub fn connect<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.connection.connect(Box::new(callback), |listener| {
            info!(backend = %self.backend.kind(), "Connecting to the OMAPI service");
            self.backend.connect_to_service(listener)
        })
    }

    /// Connect to the OMAPI service and report the outcome on a channel
    ///
    /// The receiver yields a single [`ServiceConnected`] event.
    pub fn connect_channel(&self) -> Result<ConnectionEventReceiver> {
        let (sender, receiver) = connection_event_channel();
        let connection = self.connection.clone();
        let plugin = self.config.plugin_name.clone();
        let backend = self.backend.kind();

        self.connect(move || {
            let version = connection
                .service()
                .map(|service| ServiceVersion::parse_lossy(&service.version()))
                .unwrap_or_default();
            let event = ServiceConnected {
                plugin,
                version,
                backend,
            };
            if sender.send(event).is_err() {
                debug!("Connection event receiver dropped");
            }
        })?;

        Ok(receiver)
    }

    /// Check if the plugin is connected to the service
    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Get the version of the connected service
    pub fn service_version(&self) -> Option<ServiceVersion> {
        self.connection
            .service()
            .map(|service| ServiceVersion::parse_lossy(&service.version()))
    }

    /// List the readers of the connected service
    ///
    /// The service is queried on every call. Empty until connected.
    pub fn list_readers(&self) -> Vec<OmapiReader> {
        let Some(service) = self.connection.service() else {
            debug!("Not connected to the OMAPI service, no readers");
            return Vec::new();
        };

        let version = ServiceVersion::parse_lossy(&service.version());
        self.backend
            .list_native_readers(service.as_ref())
            .into_iter()
            .map(|native| self.backend.wrap_as_reader(native, version, &self.config))
            .collect()
    }

    /// Release the service
    pub fn unregister(&self) {
        self.connection.disconnect();
        info!(plugin = %self.config.plugin_name, "Plugin unregistered");
    }

    /// Get the kind of backend in use
    pub const fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Get the configuration
    pub const fn config(&self) -> &OmapiConfig {
        &self.config
    }
}

impl PluginSpi for OmapiPlugin {
    type Reader = OmapiReader;

    fn name(&self) -> &str {
        &self.config.plugin_name
    }

    fn search_available_readers(&self) -> Vec<OmapiReader> {
        debug!("Searching available readers");
        self.list_readers()
    }

    fn on_unregister(&self) {
        self.unregister();
    }
}

/// Builds an [`OmapiPlugin`] and reports once it is connected
#[derive(Debug)]
pub struct OmapiPluginFactory {
    plugin: Arc<OmapiPlugin>,
}

impl OmapiPluginFactory {
    /// Select a backend on `env`, create the plugin and connect it
    ///
    /// `on_ready` receives the factory once the service is connected.
    pub fn new<F>(
        env: &dyn PlatformEnvironment,
        config: OmapiConfig,
        on_ready: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<Self>) + Send + 'static,
    {
        let plugin = Arc::new(OmapiPlugin::from_environment(env, config)?);
        let factory = Arc::new(Self { plugin });

        let weak = Arc::downgrade(&factory);
        factory.plugin.connect(move || {
            if let Some(factory) = weak.upgrade() {
                on_ready(factory);
            }
        })?;

        Ok(factory)
    }

    /// Get the name of the plugin built by this factory
    pub fn plugin_name(&self) -> &str {
        &self.plugin.config.plugin_name
    }

    /// Get the plugin
    pub fn plugin(&self) -> Arc<OmapiPlugin> {
        Arc::clone(&self.plugin)
    }
}
