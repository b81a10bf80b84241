//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;

use apdu_transport_omapi::{
    OmapiConfig, OmapiPlugin, OmapiReader, PluginSpi, ReaderSpi,
    sim::{Delivery, SimConnector, SimEnvironment, SimProfile, SimReader, SimService},
};

/// AID of the applet on the embedded secure element of the demo profile
pub(crate) const ESE_AID: &str = "A000000151000000";

/// AID of the transit applet on the SIM of the demo profile
pub(crate) const SIM_AID: &str = "315449432E494341";

/// Decode a hex string, panicking on invalid input
pub(crate) fn bytes(hex: &str) -> Vec<u8> {
    hex::decode(hex).expect("valid hex")
}

/// Build a connector on a service described by `profile`
pub(crate) fn connector(profile: SimProfile, delivery: Delivery) -> Arc<SimConnector> {
    let service = Arc::new(SimService::new(profile).expect("valid profile"));
    Arc::new(SimConnector::new(service, delivery))
}

/// Build a disconnected plugin on the demo profile
pub(crate) fn demo_plugin(delivery: Delivery) -> (Arc<SimConnector>, OmapiPlugin) {
    let connector = connector(SimProfile::demo(), delivery);
    let env = SimEnvironment::platform(Arc::clone(&connector));
    let plugin = OmapiPlugin::from_environment(&env, OmapiConfig::default()).expect("backend");
    (connector, plugin)
}

/// Connect the demo plugin and return the reader named `name`
pub(crate) fn demo_reader(name: &str) -> (Arc<SimConnector>, OmapiReader) {
    let (connector, plugin) = demo_plugin(Delivery::Immediate);
    plugin.connect(|| {}).expect("connect");

    let reader = plugin
        .search_available_readers()
        .into_iter()
        .find(|r| r.name() == name)
        .expect("reader");
    (connector, reader)
}

/// Get the simulated reader behind a native name
pub(crate) fn sim_reader(connector: &SimConnector, native_name: &str) -> SimReader {
    connector.service().reader(native_name).expect("sim reader")
}
