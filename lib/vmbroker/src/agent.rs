// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boundary between the broker and the agent running on a VM's host.

use async_trait::async_trait;
use thiserror::Error;
use vmbroker_api_types::legacy::keys;
use vmbroker_api_types::runtime::VmRuntimeSnapshot;
use vmbroker_api_types::CreateRequest;

use crate::spec::Descriptor;

/// Errors reported by a [`HostAgent`].
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    /// The agent could not be reached, did not answer in time, or answered
    /// with something that could not be understood.
    #[error("host agent communication failed: {0}")]
    Transport(String),

    /// The agent understood the request and refused it.
    #[error("host agent rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
}

/// A host agent able to create VMs.
///
/// Implementations issue exactly one remote call per `create` and never
/// retry; retry policy belongs to the caller.
#[async_trait]
pub trait HostAgent: Send + Sync {
    async fn create(
        &self,
        request: &CreateRequest,
    ) -> Result<VmRuntimeSnapshot, AgentError>;
}

/// Wraps a rendered descriptor into the request sent to the host agent.
///
/// A hibernation handle travels as a sibling of the unified document, or as
/// an extra `hiberVolHandle` entry of the legacy map.
pub fn create_request(
    descriptor: Descriptor,
    hibernation_volume_handle: Option<&str>,
) -> CreateRequest {
    match descriptor {
        Descriptor::Unified(descriptor) => CreateRequest::Unified {
            descriptor,
            hibernation_volume_handle: hibernation_volume_handle
                .map(str::to_owned),
        },
        Descriptor::Legacy(mut map) => {
            if let Some(handle) = hibernation_volume_handle {
                map.insert(keys::HIBER_VOL_HANDLE, handle);
            }
            CreateRequest::Legacy(map)
        }
    }
}
