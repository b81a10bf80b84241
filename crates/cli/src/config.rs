//! Profile loading for the CLI

use std::path::Path;

use apdu_transport_omapi::{OmapiConfig, sim::SimProfile};
use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

/// Everything the CLI reads from a profile file
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Profile {
    /// Plugin options
    #[serde(default)]
    pub omapi: OmapiConfig,
    /// Simulated secure element service
    #[serde(default = "SimProfile::demo")]
    pub service: SimProfile,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            omapi: OmapiConfig::default(),
            service: SimProfile::demo(),
        }
    }
}

/// Load a profile, layering `path` over the built-in demo profile
pub fn load_profile(path: Option<&Path>) -> eyre::Result<Profile> {
    let figment = Figment::from(Serialized::defaults(Profile::default()));
    let figment = match path {
        Some(path) => {
            eyre::ensure!(path.exists(), "profile not found: {}", path.display());
            figment.merge(Toml::file(path))
        }
        None => figment,
    };
    Ok(figment.extract()?)
}
