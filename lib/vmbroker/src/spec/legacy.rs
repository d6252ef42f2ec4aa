// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Renders a [`Spec`] as a legacy attribute map.
//!
//! Drive-like devices (disks, optical and floppy drives, payloads) are listed
//! under `drives`; everything else under `devices`. Boot order appears both
//! as a `bootOrder` key on each bootable device and as the top-level `boot`
//! list of device IDs.

use std::collections::BTreeMap;

use uuid::Uuid;
use vmbroker_api_types::descriptor::{DeviceAddress, DeviceV1, NumaCell};
use vmbroker_api_types::legacy::{keys, LegacyDescriptor, LegacyValue};

use super::{Component, Spec};

type LegacyMap = BTreeMap<String, LegacyValue>;

/// The `specParams` key under which a payload drive carries its files.
pub const VM_PAYLOAD: &str = "vmPayload";

pub fn render(spec: &Spec) -> LegacyDescriptor {
    let mut map = LegacyDescriptor::new();
    map.insert(keys::VM_ID, spec.vm_id.to_string());
    map.insert(keys::VM_NAME, spec.name.as_str());
    map.insert(keys::HOST_ID, spec.host_id.to_string());
    map.insert(keys::CLUSTER_VERSION, spec.cluster_version.to_string());

    map.insert(keys::SMP, spec.cpu.vcpus.to_string());
    map.insert(
        keys::SMP_CORES_PER_SOCKET,
        spec.cpu.cores_per_socket.to_string(),
    );
    map.insert(
        keys::SMP_THREADS_PER_CORE,
        spec.cpu.threads_per_core.to_string(),
    );
    map.insert(keys::MAX_VCPUS, spec.cpu.max_vcpus.to_string());
    map.insert(keys::MEM_SIZE, spec.memory.size_mib.to_string());
    if let Some(max) = spec.memory.max_size_mib {
        map.insert(keys::MAX_MEM_SIZE, max.to_string());
    }

    if spec.volatile_run {
        map.insert(keys::VOLATILE_RUN, true);
    }
    if !spec.properties.is_empty() {
        let custom: LegacyMap = spec
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().into()))
            .collect();
        map.insert(keys::CUSTOM, custom);
    }

    map.insert(keys::BOOT_MENU_ENABLE, spec.boot_menu);
    if let Some(kernel) = &spec.kernel {
        map.insert(keys::KERNEL, kernel.kernel.as_str());
        if let Some(initrd) = &kernel.initrd {
            map.insert(keys::INITRD, initrd.as_str());
        }
        if let Some(cmdline) = &kernel.cmdline {
            map.insert(keys::KERNEL_ARGS, cmdline.as_str());
        }
    }

    if let Some(clock) = &spec.clock {
        map.insert(keys::TIMEZONE, clock.timezone.as_str());
        map.insert(keys::TIME_OFFSET, clock.utc_offset_seconds.to_string());
    }
    if let Some(serial) = &spec.smbios_serial {
        map.insert(keys::SERIAL, serial.as_str());
    }
    if let Some(network) = &spec.network {
        map.insert(keys::DISPLAY_NETWORK, network.display_network.as_str());
        if let Some(ip) = network.display_address {
            map.insert(keys::DISPLAY_IP, ip.to_string());
        }
    }

    if !spec.cpu.numa_cells.is_empty() {
        let nodes: Vec<LegacyValue> = spec
            .cpu
            .numa_cells
            .iter()
            .map(|cell| {
                let mut node = LegacyMap::new();
                node.insert("nodeIndex".into(), cell.index.to_string().into());
                node.insert("cpus".into(), join(&cell.cpus).into());
                node.insert(
                    "memory".into(),
                    cell.memory_mib.to_string().into(),
                );
                node.into()
            })
            .collect();
        map.insert(keys::GUEST_NUMA_NODES, nodes);
    }
    if let Some(tune) = &spec.memory.numa_tune {
        let nodeset: Vec<LegacyValue> = tune
            .nodes
            .iter()
            .map(|pin| {
                let mut entry = LegacyMap::new();
                entry
                    .insert("vmNodeIndex".into(), pin.cell.to_string().into());
                entry.insert("nodeset".into(), join(&pin.host_nodes).into());
                entry.into()
            })
            .collect();
        let mut numa_tune = LegacyMap::new();
        numa_tune.insert("mode".into(), tune.mode.as_str().into());
        numa_tune.insert("nodeset".into(), nodeset.into());
        map.insert(keys::NUMA_TUNE, numa_tune);
    }

    let boot_orders: BTreeMap<Uuid, u32> =
        spec.boot.iter().map(|e| (e.device_id, e.order)).collect();
    let (drives, devices): (Vec<&Component>, Vec<&Component>) =
        spec.devices.iter().partition(|c| c.device.is_drive());
    let render_all = |components: Vec<&Component>| -> Vec<LegacyValue> {
        components
            .into_iter()
            .map(|c| device(c, boot_orders.get(&c.id).copied()).into())
            .collect()
    };
    map.insert(keys::DRIVES, render_all(drives));
    map.insert(keys::DEVICES, render_all(devices));

    if !spec.boot.is_empty() {
        let mut boot = spec.boot.clone();
        boot.sort_by_key(|e| e.order);
        let ids: Vec<LegacyValue> = boot
            .iter()
            .map(|e| e.device_id.to_string().into())
            .collect();
        map.insert(keys::BOOT, ids);
    }

    map
}

fn join(values: &[u32]) -> String {
    values.iter().map(u32::to_string).collect::<Vec<_>>().join(",")
}

fn address(address: &DeviceAddress) -> LegacyMap {
    let mut map = LegacyMap::new();
    match address {
        DeviceAddress::Pci { path } => {
            map.insert("type".into(), "pci".into());
            map.insert("domain".into(), "0x0000".into());
            map.insert("bus".into(), format!("0x{:02x}", path.bus()).into());
            map.insert(
                "slot".into(),
                format!("0x{:02x}", path.device()).into(),
            );
            map.insert(
                "function".into(),
                format!("0x{:x}", path.function()).into(),
            );
        }
        DeviceAddress::Drive { bus, controller, unit } => {
            map.insert("type".into(), "drive".into());
            map.insert("interface".into(), bus.as_str().into());
            map.insert("controller".into(), controller.to_string().into());
            map.insert("unit".into(), unit.to_string().into());
        }
    }
    map
}

fn put(map: &mut LegacyMap, key: &str, value: LegacyValue) {
    map.insert(key.to_owned(), value);
}

fn device(c: &Component, boot_order: Option<u32>) -> LegacyMap {
    use keys::device as k;

    let mut map = LegacyMap::new();
    let mut params = LegacyMap::new();
    let device_name = match &c.device {
        DeviceV1::Unmanaged(u) => u.kind.clone(),
        other => other.device_name().to_owned(),
    };
    put(&mut map, k::TYPE, c.device.class().into());
    put(&mut map, k::DEVICE, device_name.into());
    put(&mut map, k::DEVICE_ID, c.id.to_string().into());
    if let Some(addr) = &c.address {
        put(&mut map, k::ADDRESS, address(addr).into());
    }
    if let Some(order) = boot_order {
        put(&mut map, k::BOOT_ORDER, order.to_string().into());
    }

    match &c.device {
        DeviceV1::Video(v) => {
            put(&mut params, "heads", v.heads.to_string().into());
            put(&mut params, "vram", v.vram_kib.to_string().into());
        }
        DeviceV1::Graphics(_) | DeviceV1::Sound(_) => {}
        DeviceV1::Cdrom(cd) => {
            let path = cd.path.as_deref().unwrap_or_default();
            put(&mut map, "path", path.into());
            put(&mut map, "readonly", true.into());
        }
        DeviceV1::Floppy(f) => {
            let path = f.path.as_deref().unwrap_or_default();
            put(&mut map, "path", path.into());
        }
        DeviceV1::Disk(d) => {
            put(&mut map, "path", d.path.as_str().into());
            put(&mut map, "iface", d.interface.as_str().into());
            put(&mut map, "readonly", d.read_only.into());
            if d.transient {
                put(&mut map, "transient", true.into());
            }
        }
        DeviceV1::Nic(n) => {
            put(&mut map, "macAddr", n.mac.as_str().into());
            put(&mut map, "network", n.network.as_str().into());
            put(&mut map, "nicModel", n.model.as_str().into());
            put(&mut map, "linkActive", n.link_up.into());
            put(&mut map, "name", n.name.as_str().into());
        }
        DeviceV1::PassthroughNic(n) => {
            put(&mut map, "macAddr", n.mac.as_str().into());
            put(&mut map, "network", n.network.as_str().into());
            put(&mut map, "hostdev", n.host_vf.as_str().into());
            put(&mut map, "name", n.name.as_str().into());
        }
        DeviceV1::Console(con) => {
            put(&mut params, "consoleType", con.kind.as_str().into());
        }
        DeviceV1::UsbController(u) => {
            put(&mut params, "model", u.model.as_str().into());
            put(&mut params, "index", u.index.to_string().into());
        }
        DeviceV1::Balloon(b) => {
            put(&mut params, "model", b.model.as_str().into());
        }
        DeviceV1::Watchdog(w) => {
            put(&mut params, "model", w.model.as_str().into());
            put(&mut params, "action", w.action.as_str().into());
        }
        DeviceV1::VirtioScsi(ctrl) => {
            put(&mut params, "index", ctrl.index.to_string().into());
        }
        DeviceV1::VirtioSerial(ctrl) => {
            put(&mut params, "index", ctrl.index.to_string().into());
        }
        DeviceV1::Rng(r) => {
            put(&mut params, "source", r.source.as_str().into());
            if let Some(rate) = r.rate {
                put(&mut params, "bytes", rate.bytes.to_string().into());
                let period = rate.period_ms.to_string();
                put(&mut params, "period", period.into());
            }
        }
        DeviceV1::Unmanaged(u) => {
            for (k, v) in &u.params {
                put(&mut params, k, v.as_str().into());
            }
        }
        DeviceV1::HostDevice(h) => {
            put(&mut params, "hostAddress", h.host_address.as_str().into());
        }
        DeviceV1::Payload(p) => {
            let files: LegacyMap = p
                .files
                .iter()
                .map(|(path, data)| (path.clone(), data.as_str().into()))
                .collect();
            let mut payload = LegacyMap::new();
            if let Some(vol) = &p.volume_id {
                put(&mut payload, "volId", vol.as_str().into());
            }
            put(&mut payload, "file", files.into());
            put(&mut params, VM_PAYLOAD, payload.into());
            put(&mut map, "readonly", true.into());
        }
    }

    put(&mut map, k::SPEC_PARAMS, params.into());
    map
}

/// The ID of the device described by a legacy device map.
pub fn device_id(map: &LegacyMap) -> Option<Uuid> {
    map.get(keys::device::DEVICE_ID)?.as_str()?.parse().ok()
}

/// Returns true if a legacy drive map describes an initialization payload.
pub fn is_payload(map: &LegacyMap) -> bool {
    map.get(keys::device::SPEC_PARAMS)
        .and_then(LegacyValue::as_map)
        .is_some_and(|params| params.contains_key(VM_PAYLOAD))
}

/// The files of a legacy payload drive, if `map` describes one.
pub fn payload_files(map: &LegacyMap) -> Option<BTreeMap<String, String>> {
    let payload = map
        .get(keys::device::SPEC_PARAMS)?
        .as_map()?
        .get(VM_PAYLOAD)?
        .as_map()?;
    payload
        .get("file")?
        .as_map()?
        .iter()
        .map(|(path, data)| Some((path.clone(), data.as_str()?.to_owned())))
        .collect()
}

/// The host virtual function of a passthrough vNIC's device map.
pub fn host_vf(map: &LegacyMap) -> Option<String> {
    map.get("hostdev")?.as_str().map(str::to_owned)
}

/// Reads the guest NUMA nodes back out of a legacy descriptor.
pub fn numa_cells(descriptor: &LegacyDescriptor) -> Vec<NumaCell> {
    let nodes = descriptor
        .get(keys::GUEST_NUMA_NODES)
        .and_then(LegacyValue::as_list)
        .unwrap_or_default();
    nodes
        .iter()
        .filter_map(|node| {
            let node = node.as_map()?;
            let field = |key: &str| node.get(key)?.as_str();
            let cpus = field("cpus")?;
            Some(NumaCell {
                index: field("nodeIndex")?.parse().ok()?,
                cpus: cpus
                    .split(',')
                    .filter(|c| !c.is_empty())
                    .map(str::parse)
                    .collect::<Result<_, _>>()
                    .ok()?,
                memory_mib: field("memory")?.parse().ok()?,
            })
        })
        .collect()
}

/// The device IDs listed under the top-level `boot` key, in boot order.
pub fn boot_order(descriptor: &LegacyDescriptor) -> Vec<Uuid> {
    descriptor
        .get(keys::BOOT)
        .and_then(LegacyValue::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(|v| v.as_str()?.parse().ok())
        .collect()
}
