//! Open Mobile API (OMAPI) transport for APDU operations
//!
//! This crate exposes the secure elements of a platform OMAPI service (SIM
//! cards, embedded secure elements) as card readers. It is organised in three
//! layers:
//!
//! - [`TransportSession`] owns the session opened on one secure element
//! - [`ChannelManager`] opens basic or logical channels on that session and
//!   exchanges APDUs over them
//! - [`OmapiPlugin`] connects to the service, discovers its readers and
//!   wraps each of them as an [`OmapiReader`]
//!
//! The platform service itself is reached through the traits of the
//! [`service`] module. With the `sim` feature, the `sim` module implements
//! them in-process.
//!
//! # Examples
//!
//! With the `sim` feature enabled:
//!
//! ```
//! use std::sync::Arc;
//!
//! use apdu_transport_omapi::prelude::*;
//! use apdu_transport_omapi::sim::{Delivery, SimConnector, SimEnvironment, SimProfile, SimService};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = Arc::new(SimService::new(SimProfile::demo())?);
//! let env = SimEnvironment::platform(Arc::new(SimConnector::new(service, Delivery::Immediate)));
//!
//! let plugin = OmapiPlugin::from_environment(&env, OmapiConfig::default())?;
//! plugin.connect(|| println!("connected"))?;
//!
//! for mut reader in plugin.search_available_readers() {
//!     println!("{} present={}", reader.name(), reader.check_card_presence());
//!     if reader.name() != READER_NAME_ESE {
//!         continue;
//!     }
//!
//!     reader.open_physical_channel()?;
//!     let aid = hex::decode("A000000151000000")?;
//!     let fci = reader.open_channel_for_aid(Some(aid.as_slice()), 0x00)?;
//!     println!("FCI: {}", hex::encode_upper(&fci));
//!
//!     let response = reader.transmit_apdu(&hex::decode("80CA9F7F00")?)?;
//!     println!("Response: {}", hex::encode_upper(&response));
//!     reader.close_physical_channel();
//! }
//! # Ok(())
//! # }
//! ```
#![cfg_attr(not(test), warn(unused_crate_dependencies))]
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
mod channel;
mod config;
mod connection;
pub mod error;
pub mod event;
mod plugin;
pub mod reader;
pub mod service;
mod session;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use backend::{BackendKind, OmapiBackend, PlatformEnvironment};
pub use bytes::Bytes;
pub use channel::{ChannelManager, ChannelState};
pub use config::{CONTROL_MASK_MIN_VERSION, DEFAULT_PLUGIN_NAME, OmapiConfig};
pub use connection::{ConnectCallback, PluginConnection};
pub use error::{ErrorKind, OmapiError, Result, ServiceError};
pub use event::ServiceConnected;
pub use plugin::{OmapiPlugin, OmapiPluginFactory, PluginSpi};
pub use reader::{
    OmapiReader, READER_NAME_ESE, READER_NAME_SIM_1, READER_NAME_SIM_2, ReaderSpi,
    map_native_reader_name,
};
pub use service::ServiceVersion;
pub use session::TransportSession;

/// Prelude module containing commonly used traits and types
pub mod prelude {
    pub use crate::{
        Bytes, ErrorKind, OmapiConfig, OmapiError, OmapiPlugin, OmapiPluginFactory, OmapiReader,
        PluginSpi, READER_NAME_ESE, READER_NAME_SIM_1, READER_NAME_SIM_2, ReaderSpi,
        ServiceVersion,
    };
}
