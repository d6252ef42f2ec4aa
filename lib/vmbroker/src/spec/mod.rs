// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Turning a VM definition into a host descriptor.
//!
//! [`build`] runs the VM definition through an ordered pipeline of steps,
//! each of which adds one concern (video, drives, NICs, NUMA, ...) to a
//! dialect-neutral [`Spec`]. The finished spec is then rendered into
//! whichever descriptor dialect the target cluster understands. Both renderers
//! read the same `Spec`, so a VM's unified and legacy descriptors describe
//! the same devices and boot order.

use std::collections::{BTreeMap, BTreeSet};

use slog::{debug, Logger};
use uuid::Uuid;
use vmbroker_api_types::descriptor::{
    BootEntry, Clock, CpuSection, DeviceAddress, DeviceV1, DirectKernelBoot,
    DomainDescriptor, MemorySection, NetworkMetadata, NumaCell,
};
use vmbroker_api_types::legacy::{keys, LegacyDescriptor};
use vmbroker_api_types::ClusterVersion;

use crate::compat::{Dialect, Feature, FeatureSupport};
use crate::payload::PayloadDevice;
use crate::vm::{CreateParams, TargetHost, VmSpec};

pub mod builder;
pub mod legacy;
mod steps;
pub mod unified;

pub use builder::InvalidSpecError;
use builder::Accumulator;

/// Everything the builder pipeline reads. Steps see nothing else.
#[derive(Clone, Copy)]
pub struct BuildInput<'a> {
    pub vm: &'a VmSpec,
    pub host: &'a TargetHost,
    pub version: ClusterVersion,
    pub features: &'a dyn FeatureSupport,
    pub payload: Option<&'a PayloadDevice>,
    pub hibernation_volume_handle: Option<&'a str>,
    pub passthrough_vnic_to_vf: &'a BTreeMap<Uuid, String>,
    pub volatile_run: bool,
}

impl<'a> BuildInput<'a> {
    pub fn new(
        params: &'a CreateParams,
        features: &'a dyn FeatureSupport,
        payload: Option<&'a PayloadDevice>,
    ) -> Self {
        Self {
            vm: &params.vm,
            host: &params.host,
            version: params.cluster_version,
            features,
            payload,
            hibernation_volume_handle: params.hibernation_volume_handle(),
            passthrough_vnic_to_vf: &params.passthrough_vnic_to_vf,
            volatile_run: params.volatile_run,
        }
    }

    pub(crate) fn require(
        &self,
        feature: Feature,
    ) -> Result<(), InvalidSpecError> {
        if self.features.supports(self.version, feature) {
            Ok(())
        } else {
            Err(InvalidSpecError::FeatureUnavailable {
                feature,
                version: self.version,
            })
        }
    }
}

/// A device placed in the guest's hardware topology.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Component {
    pub id: Uuid,
    pub address: Option<DeviceAddress>,
    pub device: DeviceV1,
}

/// A dialect-neutral description of a VM, ready to be rendered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spec {
    pub vm_id: Uuid,
    pub name: String,
    pub host_id: Uuid,
    pub cluster_version: ClusterVersion,
    pub volatile_run: bool,
    pub properties: BTreeMap<String, String>,
    pub cpu: CpuSection,
    pub memory: MemorySection,
    pub boot: Vec<BootEntry>,
    pub boot_menu: bool,
    pub kernel: Option<DirectKernelBoot>,
    pub clock: Option<Clock>,
    pub smbios_serial: Option<String>,
    pub network: Option<NetworkMetadata>,

    /// Devices in the order the pipeline added them.
    pub devices: Vec<Component>,
}

impl Spec {
    fn empty(input: &BuildInput<'_>) -> Self {
        Self {
            vm_id: input.vm.id,
            name: input.vm.name.clone(),
            host_id: input.host.id,
            cluster_version: input.version,
            volatile_run: false,
            properties: BTreeMap::new(),
            cpu: CpuSection {
                sockets: 0,
                cores_per_socket: 0,
                threads_per_core: 0,
                vcpus: 0,
                max_vcpus: 0,
                numa_cells: Vec::new(),
            },
            memory: MemorySection {
                size_mib: 0,
                max_size_mib: None,
                numa_tune: None,
            },
            boot: Vec::new(),
            boot_menu: false,
            kernel: None,
            clock: None,
            smbios_serial: None,
            network: None,
            devices: Vec::new(),
        }
    }

    pub fn device(&self, id: Uuid) -> Option<&Component> {
        self.devices.iter().find(|c| c.id == id)
    }

    /// The initialization payload device, if the spec has one.
    pub fn payload(&self) -> Option<&Component> {
        self.devices.iter().find(|c| matches!(c.device, DeviceV1::Payload(_)))
    }
}

/// Names of the pipeline's steps in the order they run.
pub fn step_names() -> impl Iterator<Item = &'static str> {
    steps::PIPELINE.iter().map(|(name, _)| *name)
}

/// Runs the builder pipeline over `input`.
///
/// The first failing step aborts the build; no partial spec is returned.
pub fn build(
    input: &BuildInput<'_>,
    log: &Logger,
) -> Result<Spec, InvalidSpecError> {
    let mut acc = Accumulator::new(input)?;
    for (name, step) in steps::PIPELINE {
        acc = step(input, acc).map_err(|e| {
            debug!(log, "builder step failed"; "step" => name, "error" => %e);
            e
        })?;
        debug!(log, "applied builder step";
               "step" => name,
               "devices" => acc.spec().devices.len());
    }

    Ok(acc.finish())
}

/// A descriptor in the dialect chosen for the target cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Unified(DomainDescriptor),
    Legacy(LegacyDescriptor),
}

/// The parts of a descriptor that must agree across dialects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DescriptorSummary {
    pub devices: BTreeSet<Uuid>,
    pub boot_order: Vec<Uuid>,
    pub payload: Option<PayloadSummary>,
    /// Host virtual function of each passthrough vNIC.
    pub passthrough_vfs: BTreeMap<Uuid, String>,
    pub numa_cells: Vec<NumaCell>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PayloadSummary {
    pub id: Uuid,
    pub media: String,
    /// File path to base64-encoded content.
    pub files: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn render(dialect: Dialect, spec: &Spec) -> Self {
        match dialect {
            Dialect::Unified => Descriptor::Unified(unified::render(spec)),
            Dialect::Legacy => Descriptor::Legacy(legacy::render(spec)),
        }
    }

    pub fn dialect(&self) -> Dialect {
        match self {
            Descriptor::Unified(_) => Dialect::Unified,
            Descriptor::Legacy(_) => Dialect::Legacy,
        }
    }

    pub fn summary(&self) -> DescriptorSummary {
        match self {
            Descriptor::Unified(d) => {
                let mut boot = d.os.boot.clone();
                boot.sort_by_key(|e| e.order);
                let payload = d.devices.iter().find_map(|dev| {
                    let DeviceV1::Payload(p) = &dev.device else {
                        return None;
                    };
                    Some(PayloadSummary {
                        id: dev.id,
                        media: p.media.as_str().to_owned(),
                        files: p.files.clone(),
                    })
                });
                DescriptorSummary {
                    devices: d.devices.iter().map(|dev| dev.id).collect(),
                    boot_order: boot.into_iter().map(|e| e.device_id).collect(),
                    payload,
                    passthrough_vfs: d
                        .devices
                        .iter()
                        .filter_map(|dev| match &dev.device {
                            DeviceV1::PassthroughNic(n) => {
                                Some((dev.id, n.host_vf.clone()))
                            }
                            _ => None,
                        })
                        .collect(),
                    numa_cells: d.cpu.numa_cells.clone(),
                }
            }
            Descriptor::Legacy(map) => {
                let drives: Vec<_> = map.device_maps(keys::DRIVES).collect();
                let all = || {
                    drives.iter().copied().chain(map.device_maps(keys::DEVICES))
                };
                DescriptorSummary {
                    devices: all().filter_map(legacy::device_id).collect(),
                    boot_order: legacy::boot_order(map),
                    payload: drives.iter().find_map(|dev| {
                        Some(PayloadSummary {
                            id: legacy::device_id(dev)?,
                            media: dev
                                .get(keys::device::DEVICE)?
                                .as_str()?
                                .to_owned(),
                            files: legacy::payload_files(dev)?,
                        })
                    }),
                    passthrough_vfs: all()
                        .filter_map(|dev| {
                            let vf = legacy::host_vf(dev)?;
                            Some((legacy::device_id(dev)?, vf))
                        })
                        .collect(),
                    numa_cells: legacy::numa_cells(map),
                }
            }
        }
    }
}
