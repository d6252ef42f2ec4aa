// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end creations through `VmCreator` against in-process host agents.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use slog::{o, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vmbroker::api::descriptor::{
    DeviceAddress, DeviceV1, DiskInterface, NicModel, PayloadMedia,
};
use vmbroker::api::legacy::keys;
use vmbroker::api::runtime::{
    CpuCounters, DeviceRuntime, MemoryCounters, VmRuntimeSnapshot, VmStatus,
};
use vmbroker::api::{ClusterVersion, CreateRequest, DriveBus, PciPath};
use vmbroker::payload::SYSPREP_FILE_NAME;
use vmbroker::vm::{
    BootDeviceClass, CpuTopology, CreateParams, DeviceKind, DeviceSpec,
    DiskSpec, GuestOs, InitializationRequest, NicSpec, SysprepParams,
    TargetHost, VmDynamicState, VmInit, VmSpec,
};
use vmbroker::{AgentError, Collaborators, CreateError, HostAgent, VmCreator};

/// Answers every request with a fixed result and remembers what it saw.
struct ScriptedAgent {
    result: Result<VmRuntimeSnapshot, AgentError>,
    seen: Mutex<Vec<CreateRequest>>,
}

impl ScriptedAgent {
    fn new(result: Result<VmRuntimeSnapshot, AgentError>) -> Arc<Self> {
        Arc::new(Self { result, seen: Mutex::new(Vec::new()) })
    }

    fn last_request(&self) -> CreateRequest {
        self.seen.lock().unwrap().last().cloned().expect("no request seen")
    }
}

#[async_trait]
impl HostAgent for ScriptedAgent {
    async fn create(
        &self,
        request: &CreateRequest,
    ) -> Result<VmRuntimeSnapshot, AgentError> {
        self.seen.lock().unwrap().push(request.clone());
        self.result.clone()
    }
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn creator(agent: Arc<ScriptedAgent>) -> VmCreator {
    VmCreator::new(test_logger(), Collaborators::with_agent(agent))
}

const VM_ID: Uuid = Uuid::from_u128(0x5eed);
const NIC_ID: Uuid = Uuid::from_u128(0x10);
const DISK_ID: Uuid = Uuid::from_u128(0x20);

fn host() -> TargetHost {
    TargetHost {
        id: Uuid::from_u128(0x4057),
        name: "host-1".to_string(),
        cpu_threads: 16,
        display_address: None,
    }
}

fn bare_vm() -> VmSpec {
    VmSpec::new(VM_ID, "scenario", CpuTopology::new(1, 2, 1))
}

fn vm_with_nic_and_disk() -> VmSpec {
    let mut vm = bare_vm();
    vm.devices = vec![
        DeviceSpec::new(
            NIC_ID,
            DeviceKind::Nic(NicSpec {
                name: "eth0".to_string(),
                mac: "56:6f:00:00:00:01".to_string(),
                network: "ovirtmgmt".to_string(),
                model: NicModel::Virtio,
                link_up: true,
                passthrough: false,
            }),
        ),
        DeviceSpec::new(
            DISK_ID,
            DeviceKind::Disk(DiskSpec {
                path: "/rhev/data-center/images/root".to_string(),
                interface: DiskInterface::VirtioBlk,
                read_only: false,
            }),
        ),
    ];
    vm.boot.sequence = vec![BootDeviceClass::HardDisk];
    vm
}

fn answer(vm_id: Uuid) -> VmRuntimeSnapshot {
    VmRuntimeSnapshot::bare(vm_id, VmStatus::WaitForLaunch)
}

#[tokio::test]
async fn scenario_a_empty_vm_has_only_baseline_sections() {
    let agent = ScriptedAgent::new(Ok(answer(VM_ID)));
    let creator = creator(agent.clone());
    let params =
        CreateParams::new(bare_vm(), host(), ClusterVersion::new(4, 7));
    let mut dynamic = VmDynamicState::new(VM_ID);

    creator
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();

    let request = agent.last_request();
    let CreateRequest::Unified { descriptor, hibernation_volume_handle } =
        &request
    else {
        panic!("expected a unified request, got {request:?}");
    };
    assert_eq!(descriptor.cpu.vcpus, 2);
    assert_eq!(descriptor.memory.size_mib, 1024);
    assert!(descriptor.devices.is_empty());
    assert_eq!(*hibernation_volume_handle, None);

    let json = serde_json::to_value(&request).unwrap();
    assert!(json["create_info"].get("hibernationVolumeHandle").is_none());
}

#[tokio::test]
async fn scenario_b_sysprep_payload_is_the_last_device() {
    let agent = ScriptedAgent::new(Ok(answer(VM_ID)));
    let creator = creator(agent.clone());
    let mut vm = vm_with_nic_and_disk();
    vm.os = GuestOs::Windows;
    let mut params = CreateParams::new(vm, host(), ClusterVersion::new(4, 7));
    params.initialization = InitializationRequest::Sysprep(SysprepParams {
        computer_name: Some("WIN-SCENARIO".to_string()),
        ..Default::default()
    });
    let mut dynamic = VmDynamicState::new(VM_ID);

    creator
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();

    let CreateRequest::Unified { descriptor, .. } = agent.last_request() else {
        panic!("expected a unified request");
    };
    let ids: Vec<Uuid> = descriptor.devices.iter().map(|d| d.id).collect();
    assert!(ids.contains(&NIC_ID));
    assert!(ids.contains(&DISK_ID));

    let payloads: Vec<_> = descriptor
        .devices
        .iter()
        .filter(|d| matches!(d.device, DeviceV1::Payload(_)))
        .collect();
    assert_eq!(payloads.len(), 1);
    let last = descriptor.devices.last().unwrap();
    assert_eq!(last.id, payloads[0].id);

    let DeviceV1::Payload(payload) = &last.device else {
        unreachable!();
    };
    assert_eq!(payload.media, PayloadMedia::Floppy);
    assert!(payload.files.contains_key(SYSPREP_FILE_NAME));
}

#[tokio::test]
async fn scenario_c_empty_cloud_init_yields_no_payload() {
    let agent = ScriptedAgent::new(Ok(answer(VM_ID)));
    let creator = creator(agent.clone());
    let mut params = CreateParams::new(
        vm_with_nic_and_disk(),
        host(),
        ClusterVersion::new(4, 7),
    );
    params.initialization =
        InitializationRequest::CloudInit(VmInit::default());
    let mut dynamic = VmDynamicState::new(VM_ID);

    creator
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();

    let CreateRequest::Unified { descriptor, .. } = agent.last_request() else {
        panic!("expected a unified request");
    };
    assert_eq!(descriptor.devices.len(), 2);
    assert!(!descriptor
        .devices
        .iter()
        .any(|d| matches!(d.device, DeviceV1::Payload(_))));
    assert_eq!(dynamic.status, VmStatus::WaitForLaunch);
}

#[test]
fn config_drive_fits_next_to_a_full_ide_bus() {
    let mut vm = bare_vm();
    vm.devices = (1..=4u128)
        .map(|n| {
            DeviceSpec::new(
                Uuid::from_u128(0x30 + n),
                DeviceKind::Disk(DiskSpec {
                    path: format!("/images/ide{n}.img"),
                    interface: DiskInterface::Ide,
                    read_only: false,
                }),
            )
        })
        .collect();
    let creator = creator(ScriptedAgent::new(Ok(answer(VM_ID))));

    let mut params = CreateParams::new(vm, host(), ClusterVersion::new(4, 7));
    creator.prepare(&params).unwrap();

    params.initialization = InitializationRequest::CloudInit(VmInit {
        hostname: Some("full-ide".to_string()),
        ..Default::default()
    });
    let CreateRequest::Unified { descriptor, .. } =
        creator.prepare(&params).unwrap()
    else {
        panic!("expected a unified request");
    };
    let last = descriptor.devices.last().unwrap();
    assert!(matches!(last.device, DeviceV1::Payload(_)));
    assert!(matches!(
        last.address,
        Some(DeviceAddress::Drive { bus, .. }) if bus == DriveBus::Sata
    ));
}

#[tokio::test]
async fn scenario_d_legacy_request_carries_hibernation_handle() {
    const HANDLE: &str = "0c3b::9f1e::a4c2::sd-vol";

    let agent = ScriptedAgent::new(Ok(VmRuntimeSnapshot::bare(
        VM_ID,
        VmStatus::RestoringState,
    )));
    let creator = creator(agent.clone());
    let mut params = CreateParams::new(
        vm_with_nic_and_disk(),
        host(),
        ClusterVersion::new(4, 1),
    );
    params.hibernation_volume_handle = Some(HANDLE.to_string());
    let mut dynamic = VmDynamicState::new(VM_ID);

    creator
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();

    let request = agent.last_request();
    let CreateRequest::Legacy(map) = &request else {
        panic!("expected a legacy request, got {request:?}");
    };
    assert_eq!(map.get_str(keys::HIBER_VOL_HANDLE), Some(HANDLE));
    for unified_only in ["cpu", "memory", "os", "metadata"] {
        assert!(!map.contains_key(unified_only), "{unified_only} present");
    }
    assert_eq!(map.device_maps(keys::DRIVES).count(), 1);
    assert_eq!(map.device_maps(keys::DEVICES).count(), 1);
    assert_eq!(dynamic.status, VmStatus::RestoringState);
}

#[tokio::test]
async fn scenario_e_transport_timeout_leaves_state_untouched() {
    let agent = ScriptedAgent::new(Err(AgentError::Transport(
        "operation timed out".to_string(),
    )));
    let creator = creator(agent);
    let params = CreateParams::new(
        vm_with_nic_and_disk(),
        host(),
        ClusterVersion::new(4, 7),
    );
    let mut dynamic = VmDynamicState::new(VM_ID);
    let before = dynamic.clone();

    let err = creator
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap_err();
    let CreateError::HostCommunication(msg) = &err else {
        panic!("unexpected error {err:?}");
    };
    assert!(msg.contains("timed out"));
    assert_eq!(dynamic, before);
}

#[tokio::test]
async fn scenario_f_partial_snapshot_updates_cpu_only() {
    // First creation reports everything.
    let full = VmRuntimeSnapshot {
        memory: Some(MemoryCounters { actual_mib: 1024 }),
        devices: Some(vec![DeviceRuntime {
            device_id: NIC_ID,
            address: DeviceAddress::Pci {
                path: PciPath::new(0, 8, 0).unwrap(),
            },
            alias: Some("net0".to_string()),
        }]),
        pid: Some(31337),
        ..answer(VM_ID)
    };
    let params = CreateParams::new(
        vm_with_nic_and_disk(),
        host(),
        ClusterVersion::new(4, 7),
    );
    let mut dynamic = VmDynamicState::new(VM_ID);
    creator(ScriptedAgent::new(Ok(full)))
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();
    let before = dynamic.clone();

    // The next answer only carries CPU counters.
    let partial = VmRuntimeSnapshot {
        cpu: Some(CpuCounters {
            vcpu_count: 2,
            user_pct: 12.5,
            sys_pct: 3.0,
        }),
        ..answer(VM_ID)
    };
    creator(ScriptedAgent::new(Ok(partial)))
        .create(&params, &mut dynamic, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(dynamic.vcpu_count, Some(2));
    assert_eq!(dynamic.cpu_user_pct, Some(12.5));
    assert_eq!(dynamic.cpu_sys_pct, Some(3.0));
    assert_eq!(dynamic.actual_memory_mib, before.actual_memory_mib);
    assert_eq!(dynamic.device_addresses, before.device_addresses);
    assert_eq!(dynamic.device_aliases, before.device_aliases);
    assert_eq!(dynamic.pid, before.pid);
}

#[tokio::test]
async fn unsupported_versions_are_rejected_before_dispatch() {
    let agent = ScriptedAgent::new(Ok(answer(VM_ID)));
    let creator = creator(agent.clone());

    for version in [ClusterVersion::new(3, 6), ClusterVersion::new(4, 8)] {
        let params = CreateParams::new(bare_vm(), host(), version);
        let err = creator.prepare(&params).unwrap_err();
        assert!(
            matches!(err, CreateError::UnsupportedVersion(v) if v.0 == version),
            "unexpected error {err:?}"
        );
    }
    assert!(agent.seen.lock().unwrap().is_empty());
}
