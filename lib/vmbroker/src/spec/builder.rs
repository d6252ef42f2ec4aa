// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The accumulator threaded through the builder pipeline.

use std::collections::BTreeSet;
use std::ops::RangeInclusive;

use thiserror::Error;
use uuid::Uuid;
use vmbroker_api_types::descriptor::{DeviceAddress, DeviceV1};
use vmbroker_api_types::{ClusterVersion, DriveBus, PciPath};

use super::{BuildInput, Component, Spec};
use crate::compat::Feature;

/// Ways in which a VM definition can be internally inconsistent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpecError {
    #[error("a device with ID {0} already exists")]
    DeviceIdInUse(Uuid),

    #[error("a PCI device is already attached at {0}")]
    PciPathInUse(PciPath),

    #[error("device {0} is not a PCI device and cannot take a PCI address")]
    NotPciAddressable(Uuid),

    #[error("no free PCI slot for a {0} device")]
    PciSlotsExhausted(&'static str),

    #[error("no free unit on the {0} bus")]
    DriveUnitsExhausted(DriveBus),

    #[error("the VM has no vCPUs")]
    NoVcpus,

    #[error("the VM has no memory")]
    NoMemory,

    #[error(
        "maximum memory {max} MiB is below the VM's memory size {size} MiB"
    )]
    MaxMemoryTooSmall { size: u64, max: u64 },

    #[error("maximum vCPU count {max} is below the boot vCPU count {vcpus}")]
    MaxVcpusTooSmall { vcpus: u32, max: u32 },

    #[error("{feature:?} is not available at cluster version {version}")]
    FeatureUnavailable { feature: Feature, version: ClusterVersion },

    #[error("SCSI disk {0} requires a virtio-scsi controller")]
    MissingScsiController(Uuid),

    #[error("passthrough vNIC {0} has no virtual function assigned")]
    MissingVirtualFunction(Uuid),

    #[error("more than one {0} device specified")]
    SingletonInUse(&'static str),

    #[error("device {0} cannot be booted from")]
    NotBootable(Uuid),

    #[error("boot order {0} is used by more than one device")]
    BootOrderInUse(u32),

    #[error("boot option {0} is not an attached device")]
    BootOptionMissing(Uuid),

    #[error("kernel boot requires a kernel path")]
    EmptyKernelPath,

    #[error("custom serial number is empty")]
    EmptySerialNumber,

    #[error("NUMA node index {0} is used more than once")]
    NumaNodeInUse(u32),

    #[error("vCPU {0} is assigned to more than one NUMA node")]
    NumaCpuInUse(u32),

    #[error("vCPU {cpu} in NUMA node {node} is out of range")]
    NumaCpuOutOfRange { node: u32, cpu: u32 },

    #[error(
        "NUMA nodes hold {assigned} MiB of memory but the VM has {memory} MiB"
    )]
    NumaMemoryMismatch { assigned: u64, memory: u64 },
}

/// The PCI slot range each class of device is allocated from, so that adding
/// a device of one class never moves devices of another.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotClass {
    Video,
    Controller,
    Nic,
    Disk,
    Misc,
}

impl SlotClass {
    fn slots(&self) -> RangeInclusive<u8> {
        match self {
            SlotClass::Video => 0x02..=0x03,
            SlotClass::Controller => 0x04..=0x07,
            SlotClass::Nic => 0x08..=0x0F,
            SlotClass::Disk => 0x10..=0x17,
            SlotClass::Misc => 0x18..=0x1F,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SlotClass::Video => "video",
            SlotClass::Controller => "controller",
            SlotClass::Nic => "network",
            SlotClass::Disk => "disk",
            SlotClass::Misc => "miscellaneous",
        }
    }
}

/// A spec under construction.
///
/// Steps take the accumulator by value and hand it back, so no step can
/// observe or keep a partially built spec after the pipeline is done with it.
#[derive(Debug)]
pub(crate) struct Accumulator {
    spec: Spec,
    device_ids: BTreeSet<Uuid>,

    /// PCI addresses fixed by the VM definition. Automatic allocation skips
    /// these even before the owning device has been added.
    reserved_pci: BTreeSet<PciPath>,
    pci_paths: BTreeSet<PciPath>,
    drive_units: BTreeSet<(DriveBus, u8)>,
    singletons: BTreeSet<&'static str>,
}

impl Accumulator {
    pub(crate) fn new(
        input: &BuildInput<'_>,
    ) -> Result<Self, InvalidSpecError> {
        let mut reserved_pci = BTreeSet::new();
        for dev in &input.vm.devices {
            let Some(path) = dev.address else {
                continue;
            };

            if !reserved_pci.insert(path) {
                return Err(InvalidSpecError::PciPathInUse(path));
            }
        }

        Ok(Self {
            spec: Spec::empty(input),
            device_ids: BTreeSet::new(),
            reserved_pci,
            pci_paths: BTreeSet::new(),
            drive_units: BTreeSet::new(),
            singletons: BTreeSet::new(),
        })
    }

    pub(crate) fn spec(&self) -> &Spec {
        &self.spec
    }

    pub(crate) fn spec_mut(&mut self) -> &mut Spec {
        &mut self.spec
    }

    pub(crate) fn contains_device(&self, id: Uuid) -> bool {
        self.device_ids.contains(&id)
    }

    /// Adds a device on the PCI bus, at `explicit` if given or else at the
    /// first free slot of `class`.
    pub(crate) fn add_pci_device(
        &mut self,
        id: Uuid,
        explicit: Option<PciPath>,
        class: SlotClass,
        device: DeviceV1,
    ) -> Result<(), InvalidSpecError> {
        self.check_id(id)?;
        let path = match explicit {
            Some(path) => {
                if self.pci_paths.contains(&path) {
                    return Err(InvalidSpecError::PciPathInUse(path));
                }
                path
            }
            None => self.allocate_pci(class)?,
        };

        self.pci_paths.insert(path);
        self.push(id, Some(DeviceAddress::Pci { path }), device);
        Ok(())
    }

    /// Adds a device at the first free unit of controller 0 of `bus`.
    pub(crate) fn add_drive(
        &mut self,
        id: Uuid,
        explicit: Option<PciPath>,
        bus: DriveBus,
        device: DeviceV1,
    ) -> Result<(), InvalidSpecError> {
        self.check_id(id)?;
        if explicit.is_some() {
            return Err(InvalidSpecError::NotPciAddressable(id));
        }

        self.add_drive_on(id, &[bus], device)
    }

    /// Adds a device at the first free unit of the first bus in `buses` that
    /// has one.
    pub(crate) fn add_drive_on(
        &mut self,
        id: Uuid,
        buses: &[DriveBus],
        device: DeviceV1,
    ) -> Result<(), InvalidSpecError> {
        self.check_id(id)?;

        let mut exhausted = None;
        for &bus in buses {
            let free = (0..bus.units())
                .find(|unit| !self.drive_units.contains(&(bus, *unit)));
            let Some(unit) = free else {
                exhausted = Some(bus);
                continue;
            };

            self.drive_units.insert((bus, unit));
            let address = DeviceAddress::Drive { bus, controller: 0, unit };
            self.push(id, Some(address), device);
            return Ok(());
        }

        Err(InvalidSpecError::DriveUnitsExhausted(
            exhausted.unwrap_or(DriveBus::Ide),
        ))
    }

    /// Adds a device with no guest bus address.
    pub(crate) fn add_unaddressed(
        &mut self,
        id: Uuid,
        explicit: Option<PciPath>,
        device: DeviceV1,
    ) -> Result<(), InvalidSpecError> {
        self.check_id(id)?;
        if explicit.is_some() {
            return Err(InvalidSpecError::NotPciAddressable(id));
        }

        self.push(id, None, device);
        Ok(())
    }

    /// Records that a device which may appear at most once has been added.
    pub(crate) fn claim_singleton(
        &mut self,
        kind: &'static str,
    ) -> Result<(), InvalidSpecError> {
        if !self.singletons.insert(kind) {
            return Err(InvalidSpecError::SingletonInUse(kind));
        }

        Ok(())
    }

    pub(crate) fn finish(self) -> Spec {
        self.spec
    }

    fn check_id(&self, id: Uuid) -> Result<(), InvalidSpecError> {
        if self.device_ids.contains(&id) {
            Err(InvalidSpecError::DeviceIdInUse(id))
        } else {
            Ok(())
        }
    }

    fn allocate_pci(
        &self,
        class: SlotClass,
    ) -> Result<PciPath, InvalidSpecError> {
        class
            .slots()
            .filter_map(|slot| PciPath::new(0, slot, 0).ok())
            .find(|path| {
                !self.pci_paths.contains(path)
                    && !self.reserved_pci.contains(path)
            })
            .ok_or(InvalidSpecError::PciSlotsExhausted(class.name()))
    }

    fn push(
        &mut self,
        id: Uuid,
        address: Option<DeviceAddress>,
        device: DeviceV1,
    ) {
        self.device_ids.insert(id);
        self.spec.devices.push(Component { id, address, device });
    }
}
