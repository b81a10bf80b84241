//! Connection events delivered over channels

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::{backend::BackendKind, service::ServiceVersion};

/// The plugin finished binding to the OMAPI service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConnected {
    /// Plugin name
    pub plugin: String,
    /// Version reported by the service
    pub version: ServiceVersion,
    /// Backend the plugin is bound to
    pub backend: BackendKind,
}

/// Sender for connection events
pub type ConnectionEventSender = Sender<ServiceConnected>;
/// Receiver for connection events
pub type ConnectionEventReceiver = Receiver<ServiceConnected>;

/// Create a channel for the single event of a connection attempt
pub fn connection_event_channel() -> (ConnectionEventSender, ConnectionEventReceiver) {
    bounded(1)
}
