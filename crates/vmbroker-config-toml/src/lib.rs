// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use vmbroker::api::descriptor::PayloadMedia;
use vmbroker::api::ClusterVersion;
use vmbroker::compat::FeatureMatrix;
use vmbroker::payload::PayloadDevice;
use vmbroker::vm::{CreateParams, InitializationRequest, TargetHost, VmSpec};

/// A VM creation request as written down in a TOML file.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Config {
    pub cluster_version: ClusterVersion,

    /// Versions and features the cluster supports. Omitting the table selects
    /// the built-in matrix.
    #[serde(default)]
    pub features: FeatureMatrix,

    #[serde(default)]
    pub agent: AgentConfig,

    pub host: TargetHost,

    pub vm: VmSpec,

    #[serde(default)]
    pub initialization: InitializationRequest,

    /// Media handed to the guest as-is when no initialization is requested.
    #[serde(default)]
    pub payload: Option<PayloadConfig>,

    #[serde(default)]
    pub hibernation_volume_handle: Option<String>,

    /// Host virtual function for each passthrough vNIC, keyed by device ID.
    #[serde(default, rename = "passthrough_vf")]
    pub passthrough_vnic_to_vf: BTreeMap<Uuid, String>,

    #[serde(default)]
    pub volatile_run: bool,
}

impl Config {
    /// Returns the parameters of one create command for this configuration.
    pub fn create_params(&self) -> CreateParams {
        let mut params = CreateParams::new(
            self.vm.clone(),
            self.host.clone(),
            self.cluster_version,
        );
        params.initialization = self.initialization.clone();
        params.supplied_payload = self.payload.as_ref().map(|p| {
            let content = p.files.clone().into_iter().collect();
            PayloadDevice::supplied(self.vm.id, p.media, content)
        });
        params.hibernation_volume_handle =
            self.hibernation_volume_handle.clone();
        params.passthrough_vnic_to_vf = self.passthrough_vnic_to_vf.clone();
        params.volatile_run = self.volatile_run;
        params
    }
}

impl FromStr for Config {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// A payload medium supplied with the VM definition.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct PayloadConfig {
    pub media: PayloadMedia,

    /// Text content of each file on the medium, keyed by path.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

/// How to reach the host agent.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    pub address: SocketAddr,
    pub timeout_ms: u64,
}

impl AgentConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: SocketAddr::from(([127, 0, 0, 1], 12400)),
            timeout_ms: 30_000,
        }
    }
}

/// Errors which may be returned when parsing a configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    contents.parse()
}
