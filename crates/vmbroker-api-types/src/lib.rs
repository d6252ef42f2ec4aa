// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Definitions for types exchanged between the broker and host agents.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use vmbroker_types::{ClusterVersion, DriveBus, PciPath};

pub mod descriptor;
pub mod legacy;
pub mod runtime;

use descriptor::DomainDescriptor;
use legacy::{keys, LegacyDescriptor};

/// The body of a host agent's create call.
///
/// The dialect is fixed per request: a request never mixes unified and legacy
/// content.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(tag = "dialect", content = "create_info", rename_all = "snake_case")]
pub enum CreateRequest {
    Unified {
        descriptor: DomainDescriptor,

        /// Resume from this saved-state volume instead of cold-booting.
        #[serde(
            rename = "hibernationVolumeHandle",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        hibernation_volume_handle: Option<String>,
    },

    /// A legacy attribute map. A hibernation handle, if any, is carried under
    /// the `hiberVolHandle` key.
    Legacy(LegacyDescriptor),
}

impl CreateRequest {
    /// Returns the ID of the VM this request creates, if it can be read from
    /// the request.
    pub fn vm_id(&self) -> Option<Uuid> {
        match self {
            CreateRequest::Unified { descriptor, .. } => Some(descriptor.vm_id),
            CreateRequest::Legacy(map) => {
                map.get_str(keys::VM_ID)?.parse().ok()
            }
        }
    }

    /// Returns the guest memory size in MiB requested by this request.
    pub fn memory_mib(&self) -> Option<u64> {
        match self {
            CreateRequest::Unified { descriptor, .. } => {
                Some(descriptor.memory.size_mib)
            }
            CreateRequest::Legacy(map) => {
                map.get_str(keys::MEM_SIZE)?.parse().ok()
            }
        }
    }

    pub fn hibernation_volume_handle(&self) -> Option<&str> {
        match self {
            CreateRequest::Unified { hibernation_volume_handle, .. } => {
                hibernation_volume_handle.as_deref()
            }
            CreateRequest::Legacy(map) => map.get_str(keys::HIBER_VOL_HANDLE),
        }
    }
}

/// The body of an error response from a host agent.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct AgentErrorBody {
    pub request_id: String,

    #[serde(default)]
    pub error_code: Option<String>,

    pub message: String,
}
