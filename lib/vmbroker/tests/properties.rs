// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Properties that must hold for arbitrary VM definitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use slog::{o, Logger};
use uuid::Uuid;

use vmbroker::api::descriptor::{DiskInterface, NicModel, NumaTuneMode};
use vmbroker::api::runtime::VmRuntimeSnapshot;
use vmbroker::api::{ClusterVersion, CreateRequest, DriveBus};
use vmbroker::compat::{resolve_dialect, Dialect, FeatureMatrix};
use vmbroker::spec::Descriptor;
use vmbroker::vm::{
    BootDeviceClass, CdromSpec, CpuTopology, CreateParams, DeviceKind,
    DeviceSpec, DiskSpec, GuestOs, InitializationRequest, NicSpec, NumaConfig,
    SysprepParams, TargetHost, UnmanagedSpec, VirtualNumaNode, VmInit, VmSpec,
};
use vmbroker::{AgentError, Collaborators, HostAgent, VmCreator};

const LEGACY_VERSION: ClusterVersion = ClusterVersion::new(4, 1);
const UNIFIED_VERSION: ClusterVersion = ClusterVersion::new(4, 7);

fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn host() -> TargetHost {
    TargetHost {
        id: Uuid::from_u128(0x4057),
        name: "host-1".to_string(),
        cpu_threads: 32,
        display_address: None,
    }
}

fn disk_interface() -> impl Strategy<Value = DiskInterface> {
    prop_oneof![
        Just(DiskInterface::VirtioBlk),
        Just(DiskInterface::Sata),
        Just(DiskInterface::Ide),
    ]
}

fn boot_class() -> impl Strategy<Value = BootDeviceClass> {
    prop_oneof![
        Just(BootDeviceClass::HardDisk),
        Just(BootDeviceClass::Cdrom),
        Just(BootDeviceClass::Network),
    ]
}

/// Spreads the VM's vCPUs and memory round-robin over `count` nodes.
fn numa_config(
    vcpus: u32,
    memory_mib: u64,
    count: u32,
    pin: bool,
) -> NumaConfig {
    let nodes = (0..count)
        .map(|index| VirtualNumaNode {
            index,
            cpus: (0..vcpus).filter(|cpu| cpu % count == index).collect(),
            memory_mib: memory_mib / u64::from(count),
            host_nodes: if pin { vec![index] } else { vec![] },
        })
        .collect();
    NumaConfig { mode: NumaTuneMode::Preferred, nodes }
}

prop_compose! {
    fn vm_spec()(
        vm_id in any::<u128>(),
        sockets in 1u32..=2,
        cores in 1u32..=4,
        windows in any::<bool>(),
        disks in prop::collection::vec(disk_interface(), 0..5),
        nics in prop::collection::vec(any::<bool>(), 0..4),
        cdrom in any::<bool>(),
        unmanaged in prop::collection::vec(any::<bool>(), 0..3),
        numa_nodes in 0u32..=2,
        numa_pin in any::<bool>(),
        sequence in prop::collection::vec(boot_class(), 0..3),
        menu in any::<bool>(),
    ) -> VmSpec {
        let mut vm = VmSpec::new(
            Uuid::from_u128(vm_id),
            "prop",
            CpuTopology::new(sockets, cores, 1),
        );
        if windows {
            vm.os = GuestOs::Windows;
        }

        // At most four disks, so IDE can be filled completely.
        let mut ide = 0;
        for (i, interface) in disks.into_iter().enumerate() {
            if interface == DiskInterface::Ide {
                ide += 1;
            }
            vm.devices.push(DeviceSpec::new(
                Uuid::from_u128(0x100 + i as u128),
                DeviceKind::Disk(DiskSpec {
                    path: format!("/images/disk{i}"),
                    interface,
                    read_only: false,
                }),
            ));
        }
        for (i, passthrough) in nics.into_iter().enumerate() {
            vm.devices.push(DeviceSpec::new(
                Uuid::from_u128(0x200 + i as u128),
                DeviceKind::Nic(NicSpec {
                    name: format!("eth{i}"),
                    mac: format!("56:6f:00:00:00:{i:02x}"),
                    network: "ovirtmgmt".to_string(),
                    model: NicModel::Virtio,
                    link_up: true,
                    passthrough,
                }),
            ));
        }
        if cdrom {
            let bus = if ide < 4 { DriveBus::Ide } else { DriveBus::Sata };
            vm.devices.push(DeviceSpec::new(
                Uuid::from_u128(0x300),
                DeviceKind::Cdrom(CdromSpec {
                    path: Some("/iso/install.iso".to_string()),
                    bus,
                }),
            ));
        }
        for (i, restore_only) in unmanaged.into_iter().enumerate() {
            vm.devices.push(DeviceSpec::new(
                Uuid::from_u128(0x400 + i as u128),
                DeviceKind::Unmanaged(UnmanagedSpec {
                    device_type: "vhostuser".to_string(),
                    params: BTreeMap::from([(
                        "socket".to_string(),
                        format!("/run/vhost{i}.sock"),
                    )]),
                    restore_only,
                }),
            ));
        }
        if numa_nodes > 0 {
            vm.numa = Some(numa_config(
                vm.cpu.vcpus(),
                vm.memory_mib,
                numa_nodes,
                numa_pin,
            ));
        }
        vm.boot.sequence = sequence;
        vm.boot.menu = menu;
        vm
    }
}

fn initialization() -> impl Strategy<Value = InitializationRequest> {
    prop_oneof![
        Just(InitializationRequest::None),
        "[a-z]{1,12}".prop_map(|hostname| {
            InitializationRequest::CloudInit(VmInit {
                hostname: Some(hostname),
                ..Default::default()
            })
        }),
        "[A-Z]{1,15}".prop_map(|name| {
            InitializationRequest::Sysprep(SysprepParams {
                computer_name: Some(name),
                ..Default::default()
            })
        }),
    ]
}

fn supported_version() -> impl Strategy<Value = ClusterVersion> {
    (0u16..=7).prop_map(|minor| ClusterVersion::new(4, minor))
}

/// Versions on which every generated VM can be created. Passthrough vNICs
/// need at least 4.1.
fn creatable_version() -> impl Strategy<Value = ClusterVersion> {
    (1u16..=7).prop_map(|minor| ClusterVersion::new(4, minor))
}

/// Creation parameters for `vm`, with a virtual function for every
/// passthrough vNIC.
fn params(
    vm: VmSpec,
    version: ClusterVersion,
    init: InitializationRequest,
    hibernation: Option<String>,
) -> CreateParams {
    let vfs = vm
        .devices
        .iter()
        .filter(|d| matches!(&d.kind, DeviceKind::Nic(n) if n.passthrough))
        .enumerate()
        .map(|(i, d)| (d.id, format!("enp3s0f1v{i}")))
        .collect();

    let mut params = CreateParams::new(vm, host(), version);
    params.initialization = init;
    params.hibernation_volume_handle = hibernation;
    params.passthrough_vnic_to_vf = vfs;
    params
}

fn descriptor(request: CreateRequest) -> Descriptor {
    match request {
        CreateRequest::Unified { descriptor, .. } => {
            Descriptor::Unified(descriptor)
        }
        CreateRequest::Legacy(map) => Descriptor::Legacy(map),
    }
}

struct Unreachable;

#[async_trait::async_trait]
impl HostAgent for Unreachable {
    async fn create(
        &self,
        _request: &CreateRequest,
    ) -> Result<VmRuntimeSnapshot, AgentError> {
        Err(AgentError::Transport("unreachable".to_string()))
    }
}

fn creator() -> VmCreator {
    VmCreator::new(discard(), Collaborators::with_agent(Arc::new(Unreachable)))
}

proptest! {
    #[test]
    fn dialect_resolution_is_total_and_deterministic(
        version in supported_version()
    ) {
        let features = FeatureMatrix::default();
        let first = resolve_dialect(&features, version).unwrap();
        let second = resolve_dialect(&features, version).unwrap();
        prop_assert_eq!(first, second);
        let expected = if version >= ClusterVersion::new(4, 2) {
            Dialect::Unified
        } else {
            Dialect::Legacy
        };
        prop_assert_eq!(first, expected);
    }

    #[test]
    fn unsupported_versions_never_get_a_dialect(
        major in 0u16..10,
        minor in 0u16..20,
    ) {
        prop_assume!(!(major == 4 && minor <= 7));
        let version = ClusterVersion::new(major, minor);
        prop_assert!(
            resolve_dialect(&FeatureMatrix::default(), version).is_err()
        );
    }

    #[test]
    fn building_twice_is_deterministic(
        vm in vm_spec(),
        init in initialization(),
        version in creatable_version(),
        hibernation in proptest::option::of("[a-z0-9:]{1,24}"),
    ) {
        let params = params(vm, version, init, hibernation);

        let creator = creator();
        let first = creator.prepare(&params).unwrap();
        let second = creator.prepare(&params).unwrap();
        prop_assert_eq!(
            serde_json::to_vec(&first).unwrap(),
            serde_json::to_vec(&second).unwrap()
        );
        prop_assert_eq!(first, second);
    }

    #[test]
    fn dialects_are_semantically_equivalent(
        vm in vm_spec(),
        init in initialization(),
        hibernation in proptest::option::of("[a-z0-9:]{1,24}"),
    ) {
        let creator = creator();
        let legacy = creator
            .prepare(&params(
                vm.clone(),
                LEGACY_VERSION,
                init.clone(),
                hibernation.clone(),
            ))
            .unwrap();
        let unified = creator
            .prepare(&params(vm, UNIFIED_VERSION, init, hibernation.clone()))
            .unwrap();

        prop_assert_eq!(
            legacy.hibernation_volume_handle(),
            hibernation.as_deref()
        );
        prop_assert_eq!(
            unified.hibernation_volume_handle(),
            hibernation.as_deref()
        );

        let legacy = descriptor(legacy);
        let unified = descriptor(unified);
        prop_assert_eq!(legacy.dialect(), Dialect::Legacy);
        prop_assert_eq!(unified.dialect(), Dialect::Unified);
        prop_assert_eq!(legacy.summary(), unified.summary());
    }
}
