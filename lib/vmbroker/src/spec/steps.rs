// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The builder pipeline's steps.
//!
//! Every step reads only the [`BuildInput`] and the accumulator it is handed,
//! and adds one concern to the spec under construction.

use std::collections::BTreeSet;

use base64::Engine;
use uuid::Uuid;
use vmbroker_api_types::descriptor::{
    BalloonModel, BootEntry, Cdrom, Clock, CpuSection, DeviceV1,
    DirectKernelBoot, Disk, DiskInterface, HostDeviceKind, MemorySection,
    NetworkMetadata, Nic, NumaCell, NumaNodePinning, NumaTune, PassthroughNic,
    Payload, PayloadMedia, Unmanaged, WatchdogModel,
};
use vmbroker_api_types::DriveBus;

use super::builder::{Accumulator, InvalidSpecError, SlotClass};
use super::BuildInput;
use crate::compat::Feature;
use crate::payload::{PayloadDevice, PayloadOrigin};
use crate::vm::{BootDeviceClass, DeviceKind, SerialNumberPolicy, VmSpec};

type StepResult = Result<Accumulator, InvalidSpecError>;
pub(super) type Step = fn(&BuildInput<'_>, Accumulator) -> StepResult;

/// The pipeline, in the order its steps must run.
///
/// The generated payload goes last so that it never displaces a device the
/// VM definition itself asked for.
pub(super) static PIPELINE: &[(&str, Step)] = &[
    ("properties", properties),
    ("video", video),
    ("graphics", graphics),
    ("optical_and_floppy", optical_and_floppy),
    ("drives", drives),
    ("network_interfaces", network_interfaces),
    ("network_topology", network_topology),
    ("boot_sequence", boot_sequence),
    ("boot_options", boot_options),
    ("sound", sound),
    ("console", console),
    ("timezone", timezone),
    ("usb", usb),
    ("balloon", balloon),
    ("watchdog", watchdog),
    ("virtio_scsi", virtio_scsi),
    ("virtio_serial", virtio_serial),
    ("rng", rng),
    ("unmanaged", unmanaged),
    ("serial_number", serial_number),
    ("numa", numa),
    ("host_devices", host_devices),
    ("payload", payload),
];

fn properties(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let vm = input.vm;
    let vcpus = vm.cpu.vcpus();
    if vcpus == 0 {
        return Err(InvalidSpecError::NoVcpus);
    }
    if vm.memory_mib == 0 {
        return Err(InvalidSpecError::NoMemory);
    }
    if let Some(max) = vm.max_memory_mib {
        if max < vm.memory_mib {
            return Err(InvalidSpecError::MaxMemoryTooSmall {
                size: vm.memory_mib,
                max,
            });
        }
    }

    let requested_max = vm.max_vcpus.unwrap_or(vcpus);
    if requested_max < vcpus {
        return Err(InvalidSpecError::MaxVcpusTooSmall {
            vcpus,
            max: requested_max,
        });
    }

    // The hotplug ceiling never exceeds the host's hardware threads, but never
    // drops below what the VM boots with either.
    let max_vcpus = requested_max.min(input.host.cpu_threads.max(vcpus));

    let spec = acc.spec_mut();
    spec.cpu = CpuSection {
        sockets: vm.cpu.sockets,
        cores_per_socket: vm.cpu.cores_per_socket,
        threads_per_core: vm.cpu.threads_per_core,
        vcpus,
        max_vcpus,
        numa_cells: Vec::new(),
    };
    spec.memory = MemorySection {
        size_mib: vm.memory_mib,
        max_size_mib: vm.max_memory_mib,
        numa_tune: None,
    };
    spec.properties = vm.custom_properties.clone();
    spec.volatile_run = input.volatile_run;
    Ok(acc)
}

fn video(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Video(video) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Video,
            DeviceV1::Video(video.clone()),
        )?;
    }

    Ok(acc)
}

fn graphics(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Graphics(graphics) = &dev.kind else {
            continue;
        };

        acc.claim_singleton(graphics.protocol.as_str())?;
        acc.add_unaddressed(
            dev.id,
            dev.address,
            DeviceV1::Graphics(graphics.clone()),
        )?;
    }

    Ok(acc)
}

fn optical_and_floppy(
    input: &BuildInput<'_>,
    mut acc: Accumulator,
) -> StepResult {
    for dev in &input.vm.devices {
        match &dev.kind {
            DeviceKind::Cdrom(cdrom) => {
                if cdrom.bus == DriveBus::Scsi {
                    require_scsi_controller(input.vm, dev.id)?;
                }
                acc.add_drive(
                    dev.id,
                    dev.address,
                    cdrom.bus,
                    DeviceV1::Cdrom(Cdrom { path: cdrom.path.clone() }),
                )?;
            }
            DeviceKind::Floppy(floppy) => {
                acc.add_drive(
                    dev.id,
                    dev.address,
                    DriveBus::Fdc,
                    DeviceV1::Floppy(floppy.clone()),
                )?;
            }
            _ => {}
        }
    }

    // Media handed in by the caller sits with the other removable drives.
    if let Some(payload) = input.payload {
        if payload.origin == PayloadOrigin::Supplied {
            add_payload(&mut acc, payload)?;
        }
    }

    Ok(acc)
}

fn drives(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Disk(disk) = &dev.kind else {
            continue;
        };

        let device = DeviceV1::Disk(Disk {
            path: disk.path.clone(),
            interface: disk.interface,
            read_only: disk.read_only,
            transient: input.volatile_run && !disk.read_only,
        });

        match disk.interface {
            DiskInterface::VirtioBlk => acc.add_pci_device(
                dev.id,
                dev.address,
                SlotClass::Disk,
                device,
            )?,
            DiskInterface::VirtioScsi => {
                require_scsi_controller(input.vm, dev.id)?;
                acc.add_drive(dev.id, dev.address, DriveBus::Scsi, device)?
            }
            DiskInterface::Ide => {
                acc.add_drive(dev.id, dev.address, DriveBus::Ide, device)?
            }
            DiskInterface::Sata => {
                acc.add_drive(dev.id, dev.address, DriveBus::Sata, device)?
            }
        }
    }

    Ok(acc)
}

fn network_interfaces(
    input: &BuildInput<'_>,
    mut acc: Accumulator,
) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Nic(nic) = &dev.kind else {
            continue;
        };

        let device = if nic.passthrough {
            input.require(Feature::VnicPassthrough)?;
            let host_vf = input
                .passthrough_vnic_to_vf
                .get(&dev.id)
                .ok_or(InvalidSpecError::MissingVirtualFunction(dev.id))?;

            DeviceV1::PassthroughNic(PassthroughNic {
                name: nic.name.clone(),
                mac: nic.mac.clone(),
                network: nic.network.clone(),
                host_vf: host_vf.clone(),
            })
        } else {
            DeviceV1::Nic(Nic {
                name: nic.name.clone(),
                mac: nic.mac.clone(),
                network: nic.network.clone(),
                model: nic.model,
                link_up: nic.link_up,
            })
        };

        acc.add_pci_device(dev.id, dev.address, SlotClass::Nic, device)?;
    }

    Ok(acc)
}

fn network_topology(
    input: &BuildInput<'_>,
    mut acc: Accumulator,
) -> StepResult {
    if let Some(network) = &input.vm.display_network {
        acc.spec_mut().network = Some(NetworkMetadata {
            display_network: network.clone(),
            display_address: input.host.display_address,
        });
    }

    Ok(acc)
}

fn boot_class(kind: &DeviceKind) -> Option<BootDeviceClass> {
    match kind {
        DeviceKind::Disk(_) => Some(BootDeviceClass::HardDisk),
        DeviceKind::Cdrom(_) => Some(BootDeviceClass::Cdrom),
        DeviceKind::Nic(_) => Some(BootDeviceClass::Network),
        _ => None,
    }
}

fn boot_sequence(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let vm = input.vm;
    let mut explicit: Vec<(u32, Uuid)> = Vec::new();
    let mut orders = BTreeSet::new();
    for dev in &vm.devices {
        let Some(order) = dev.boot_order else {
            continue;
        };

        if boot_class(&dev.kind).is_none() {
            return Err(InvalidSpecError::NotBootable(dev.id));
        }
        if !orders.insert(order) {
            return Err(InvalidSpecError::BootOrderInUse(order));
        }
        explicit.push((order, dev.id));
    }

    let entries: Vec<BootEntry> = if explicit.is_empty() {
        // Without per-device orders, boot from each requested class in turn,
        // taking devices of a class in definition order.
        let mut ids: Vec<Uuid> = Vec::new();
        for class in &vm.boot.sequence {
            for dev in &vm.devices {
                if boot_class(&dev.kind) == Some(*class)
                    && !ids.contains(&dev.id)
                {
                    ids.push(dev.id);
                }
            }
        }

        ids.into_iter()
            .zip(1..)
            .map(|(device_id, order)| BootEntry { device_id, order })
            .collect()
    } else {
        explicit.sort();
        explicit
            .into_iter()
            .map(|(order, device_id)| BootEntry { device_id, order })
            .collect()
    };

    for entry in &entries {
        if !acc.contains_device(entry.device_id) {
            return Err(InvalidSpecError::BootOptionMissing(entry.device_id));
        }
    }

    acc.spec_mut().boot = entries;
    Ok(acc)
}

fn boot_options(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let boot = &input.vm.boot;
    let kernel = match &boot.kernel {
        Some(k) if k.path.is_empty() => {
            return Err(InvalidSpecError::EmptyKernelPath)
        }
        Some(k) => Some(DirectKernelBoot {
            kernel: k.path.clone(),
            initrd: k.initrd.clone(),
            cmdline: k.cmdline.clone(),
        }),
        None => None,
    };

    let spec = acc.spec_mut();
    spec.boot_menu = boot.menu;
    spec.kernel = kernel;
    Ok(acc)
}

fn sound(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Sound(sound) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Misc,
            DeviceV1::Sound(sound.clone()),
        )?;
    }

    Ok(acc)
}

fn console(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Console(console) = &dev.kind else {
            continue;
        };

        acc.claim_singleton("console")?;
        acc.add_unaddressed(
            dev.id,
            dev.address,
            DeviceV1::Console(console.clone()),
        )?;
    }

    Ok(acc)
}

fn timezone(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    if let Some(tz) = &input.vm.timezone {
        acc.spec_mut().clock = Some(Clock {
            timezone: tz.name.clone(),
            utc_offset_seconds: tz.utc_offset_seconds,
        });
    }

    Ok(acc)
}

fn usb(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::UsbController(usb) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Controller,
            DeviceV1::UsbController(usb.clone()),
        )?;
    }

    Ok(acc)
}

fn balloon(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Balloon(balloon) = &dev.kind else {
            continue;
        };

        acc.claim_singleton("balloon")?;
        let device = DeviceV1::Balloon(balloon.clone());
        match balloon.model {
            BalloonModel::Virtio => acc.add_pci_device(
                dev.id,
                dev.address,
                SlotClass::Misc,
                device,
            )?,
            BalloonModel::None => {
                acc.add_unaddressed(dev.id, dev.address, device)?
            }
        }
    }

    Ok(acc)
}

fn watchdog(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Watchdog(watchdog) = &dev.kind else {
            continue;
        };

        acc.claim_singleton("watchdog")?;
        let device = DeviceV1::Watchdog(watchdog.clone());
        match watchdog.model {
            WatchdogModel::I6300esb => acc.add_pci_device(
                dev.id,
                dev.address,
                SlotClass::Misc,
                device,
            )?,
            // ISA device.
            WatchdogModel::Ib700 => {
                acc.add_unaddressed(dev.id, dev.address, device)?
            }
        }
    }

    Ok(acc)
}

fn virtio_scsi(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::VirtioScsi(ctrl) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Controller,
            DeviceV1::VirtioScsi(ctrl.clone()),
        )?;
    }

    Ok(acc)
}

fn virtio_serial(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::VirtioSerial(ctrl) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Controller,
            DeviceV1::VirtioSerial(ctrl.clone()),
        )?;
    }

    Ok(acc)
}

fn rng(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::Rng(rng) = &dev.kind else {
            continue;
        };

        acc.add_pci_device(
            dev.id,
            dev.address,
            SlotClass::Misc,
            DeviceV1::Rng(rng.clone()),
        )?;
    }

    Ok(acc)
}

fn unmanaged(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let resuming = input.hibernation_volume_handle.is_some();
    for dev in &input.vm.devices {
        let DeviceKind::Unmanaged(unmanaged) = &dev.kind else {
            continue;
        };

        if unmanaged.restore_only && !resuming {
            continue;
        }

        acc.add_unaddressed(
            dev.id,
            dev.address,
            DeviceV1::Unmanaged(Unmanaged {
                kind: unmanaged.device_type.clone(),
                params: unmanaged.params.clone(),
            }),
        )?;
    }

    Ok(acc)
}

fn serial_number(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let serial = match &input.vm.serial_number {
        None => return Ok(acc),
        Some(SerialNumberPolicy::Host) => input.host.id.to_string(),
        Some(SerialNumberPolicy::Vm) => input.vm.id.to_string(),
        Some(SerialNumberPolicy::Custom(s)) if s.is_empty() => {
            return Err(InvalidSpecError::EmptySerialNumber)
        }
        Some(SerialNumberPolicy::Custom(s)) => s.clone(),
    };

    acc.spec_mut().smbios_serial = Some(serial);
    Ok(acc)
}

fn numa(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    let Some(numa) = &input.vm.numa else {
        return Ok(acc);
    };
    if numa.nodes.is_empty() {
        return Ok(acc);
    }

    input.require(Feature::GuestNuma)?;

    let vcpus = acc.spec().cpu.vcpus;
    let mut indices = BTreeSet::new();
    let mut cpus = BTreeSet::new();
    let mut assigned = 0u64;
    for node in &numa.nodes {
        if !indices.insert(node.index) {
            return Err(InvalidSpecError::NumaNodeInUse(node.index));
        }
        for cpu in &node.cpus {
            if *cpu >= vcpus {
                return Err(InvalidSpecError::NumaCpuOutOfRange {
                    node: node.index,
                    cpu: *cpu,
                });
            }
            if !cpus.insert(*cpu) {
                return Err(InvalidSpecError::NumaCpuInUse(*cpu));
            }
        }
        assigned = assigned.saturating_add(node.memory_mib);
    }

    if assigned != input.vm.memory_mib {
        return Err(InvalidSpecError::NumaMemoryMismatch {
            assigned,
            memory: input.vm.memory_mib,
        });
    }

    let pinning: Vec<NumaNodePinning> = numa
        .nodes
        .iter()
        .filter(|node| !node.host_nodes.is_empty())
        .map(|node| NumaNodePinning {
            cell: node.index,
            host_nodes: node.host_nodes.clone(),
        })
        .collect();

    let spec = acc.spec_mut();
    spec.cpu.numa_cells = numa
        .nodes
        .iter()
        .map(|node| NumaCell {
            index: node.index,
            cpus: node.cpus.clone(),
            memory_mib: node.memory_mib,
        })
        .collect();
    if !pinning.is_empty() {
        spec.memory.numa_tune =
            Some(NumaTune { mode: numa.mode, nodes: pinning });
    }

    Ok(acc)
}

fn host_devices(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    for dev in &input.vm.devices {
        let DeviceKind::HostDevice(host_dev) = &dev.kind else {
            continue;
        };

        input.require(Feature::HostDevicePassthrough)?;
        let device = DeviceV1::HostDevice(host_dev.clone());
        match host_dev.kind {
            HostDeviceKind::Pci | HostDeviceKind::Mdev => acc
                .add_pci_device(dev.id, dev.address, SlotClass::Misc, device)?,
            HostDeviceKind::Usb => {
                acc.add_unaddressed(dev.id, dev.address, device)?
            }
        }
    }

    Ok(acc)
}

fn payload(input: &BuildInput<'_>, mut acc: Accumulator) -> StepResult {
    if let Some(payload) = input.payload {
        if payload.origin == PayloadOrigin::Generated {
            add_payload(&mut acc, payload)?;
        }
    }

    Ok(acc)
}

fn add_payload(
    acc: &mut Accumulator,
    payload: &PayloadDevice,
) -> Result<(), InvalidSpecError> {
    // A config drive may land on SATA when the VM's own media fill IDE.
    let buses: &[DriveBus] = match payload.media {
        PayloadMedia::Cdrom => &[DriveBus::Ide, DriveBus::Sata],
        PayloadMedia::Floppy => &[DriveBus::Fdc],
    };

    let engine = base64::engine::general_purpose::STANDARD;
    let files = payload
        .content
        .iter()
        .map(|(path, data)| (path.to_owned(), engine.encode(data)))
        .collect();

    acc.add_drive_on(
        payload.id,
        buses,
        DeviceV1::Payload(Payload {
            media: payload.media,
            volume_id: payload.volume_id.clone(),
            files,
        }),
    )
}

fn require_scsi_controller(
    vm: &VmSpec,
    id: Uuid,
) -> Result<(), InvalidSpecError> {
    if vm.devices.iter().any(|d| matches!(d.kind, DeviceKind::VirtioScsi(_))) {
        Ok(())
    } else {
        Err(InvalidSpecError::MissingScsiController(id))
    }
}
