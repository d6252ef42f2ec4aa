// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest initialization payloads.
//!
//! A payload is a small set of files presented to the guest on removable
//! media. Generators turn an initialization request into file content; the
//! [`PayloadResolver`] decides whether that content becomes a device.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;
use vmbroker_api_types::descriptor::PayloadMedia;

use crate::vm::{InitializationRequest, VmSpec};

pub mod cloud_init;
pub mod sysprep;

pub use cloud_init::{CloudInitGenerator, ConfigDriveCloudInit};
pub use sysprep::{SysprepGenerator, UnattendSysprep};

/// The file name Windows setup looks for when reading an XML answer file
/// from removable media.
pub const SYSPREP_FILE_NAME: &str = "Unattend.xml";

/// The filesystem label guests look for on a cloud-init config drive.
pub const CONFIG_DRIVE_VOLUME_ID: &str = "config-2";

/// Files on a payload medium, keyed by path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct PayloadContent(BTreeMap<String, Vec<u8>>);

impl PayloadContent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        path: impl Into<String>,
        data: impl Into<Vec<u8>>,
    ) {
        self.0.insert(path.into(), data.into());
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.0.get(path).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }
}

impl<K, V> FromIterator<(K, V)> for PayloadContent
where
    K: Into<String>,
    V: Into<Vec<u8>>,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadOrigin {
    /// Produced from the VM's initialization request.
    Generated,
    /// Handed to the broker by its caller.
    Supplied,
}

/// A removable-media device carrying a payload.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct PayloadDevice {
    pub id: Uuid,
    pub media: PayloadMedia,
    pub volume_id: Option<String>,
    pub content: PayloadContent,
    pub origin: PayloadOrigin,
}

impl PayloadDevice {
    /// The payload device ID for a VM. Derived from the VM ID so that building
    /// the same VM twice yields the same descriptor.
    pub fn id_for(vm_id: Uuid) -> Uuid {
        Uuid::new_v5(&vm_id, b"payload")
    }

    /// A caller-supplied payload for `vm_id`.
    pub fn supplied(
        vm_id: Uuid,
        media: PayloadMedia,
        content: PayloadContent,
    ) -> Self {
        Self {
            id: Self::id_for(vm_id),
            media,
            volume_id: None,
            content,
            origin: PayloadOrigin::Supplied,
        }
    }

    fn generated(
        vm_id: Uuid,
        media: PayloadMedia,
        volume_id: Option<&str>,
        content: PayloadContent,
    ) -> Self {
        Self {
            id: Self::id_for(vm_id),
            media,
            volume_id: volume_id.map(str::to_owned),
            content,
            origin: PayloadOrigin::Generated,
        }
    }
}

/// A generator failed to produce payload content.
#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("failed to serialize {file}")]
    Serialize {
        file: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum PayloadGenerationError {
    #[error("failed to generate sysprep answer file")]
    Sysprep(#[source] GenerationError),

    #[error("failed to generate cloud-init data")]
    CloudInit(#[source] GenerationError),
}

/// Turns an initialization request into at most one payload device.
#[derive(Clone)]
pub struct PayloadResolver {
    sysprep: Arc<dyn SysprepGenerator>,
    cloud_init: Arc<dyn CloudInitGenerator>,
}

impl PayloadResolver {
    pub fn new(
        sysprep: Arc<dyn SysprepGenerator>,
        cloud_init: Arc<dyn CloudInitGenerator>,
    ) -> Self {
        Self { sysprep, cloud_init }
    }

    /// Resolves the payload device for `vm`, if any.
    ///
    /// A request that generates no content yields no device, never an empty
    /// one. With no initialization requested, a caller-supplied payload is
    /// passed through unchanged.
    pub fn resolve(
        &self,
        request: &InitializationRequest,
        vm: &VmSpec,
        supplied: Option<&PayloadDevice>,
    ) -> Result<Option<PayloadDevice>, PayloadGenerationError> {
        match request {
            InitializationRequest::None => Ok(supplied.map(|p| PayloadDevice {
                origin: PayloadOrigin::Supplied,
                ..p.clone()
            })),
            InitializationRequest::Sysprep(params) => {
                let answers = self
                    .sysprep
                    .generate(vm, params)
                    .map_err(PayloadGenerationError::Sysprep)?;
                if answers.is_empty() {
                    return Ok(None);
                }

                let content = PayloadContent::from_iter([(
                    self.sysprep.file_name(),
                    answers.into_bytes(),
                )]);
                Ok(Some(PayloadDevice::generated(
                    vm.id,
                    PayloadMedia::Floppy,
                    None,
                    content,
                )))
            }
            InitializationRequest::CloudInit(init) => {
                let content = self
                    .cloud_init
                    .generate(vm, init)
                    .map_err(PayloadGenerationError::CloudInit)?;
                if content.is_empty() {
                    return Ok(None);
                }

                Ok(Some(PayloadDevice::generated(
                    vm.id,
                    PayloadMedia::Cdrom,
                    Some(CONFIG_DRIVE_VOLUME_ID),
                    content,
                )))
            }
        }
    }
}

impl Default for PayloadResolver {
    fn default() -> Self {
        Self::new(Arc::new(UnattendSysprep), Arc::new(ConfigDriveCloudInit))
    }
}
