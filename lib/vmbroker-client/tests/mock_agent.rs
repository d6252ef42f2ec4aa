// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Creations over HTTP against an in-process mock agent.

use std::sync::Arc;
use std::time::Duration;

use dropshot::ConfigDropshot;
use slog::{o, Logger};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use vmbroker::api::descriptor::{DeviceAddress, DiskInterface, NicModel};
use vmbroker::api::runtime::VmStatus;
use vmbroker::api::{ClusterVersion, PciPath};
use vmbroker::vm::{
    CpuTopology, CreateParams, DeviceKind, DeviceSpec, DiskSpec, NicSpec,
    TargetHost, VmDynamicState, VmSpec,
};
use vmbroker::{Collaborators, CreateError, VmCreator};
use vmbroker_client::Client;
use vmbroker_mock_agent::{Server, Settings};

const NIC_ID: Uuid = Uuid::from_u128(0x10);
const DISK_ID: Uuid = Uuid::from_u128(0x20);

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn start_agent(settings: Settings) -> Server {
    let config = ConfigDropshot {
        bind_address: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    vmbroker_mock_agent::start(config, settings, test_logger()).unwrap()
}

fn creator(server: &Server, timeout: Duration) -> VmCreator {
    let client =
        Client::new(server.local_addr(), timeout, test_logger()).unwrap();
    VmCreator::new(test_logger(), Collaborators::with_agent(Arc::new(client)))
}

fn params(
    vm_id: u128,
    memory_mib: u64,
    version: ClusterVersion,
) -> CreateParams {
    let mut vm = VmSpec::new(
        Uuid::from_u128(vm_id),
        "http",
        CpuTopology::new(1, 2, 1),
    );
    vm.memory_mib = memory_mib;
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
        )
        .with_address(PciPath::new(0, 9, 0).unwrap()),
        DeviceSpec::new(
            DISK_ID,
            DeviceKind::Disk(DiskSpec {
                path: "/images/root.img".to_string(),
                interface: DiskInterface::Sata,
                read_only: false,
            }),
        ),
    ];

    let host = TargetHost {
        id: Uuid::from_u128(0x4057),
        name: "mock-host".to_string(),
        cpu_threads: 8,
        display_address: None,
    };
    CreateParams::new(vm, host, version)
}

async fn create(
    creator: &VmCreator,
    params: &CreateParams,
) -> (Result<(), CreateError>, VmDynamicState) {
    let mut dynamic = VmDynamicState::new(params.vm.id);
    let result = creator
        .create(params, &mut dynamic, &CancellationToken::new())
        .await
        .map(|_| ());
    (result, dynamic)
}

#[tokio::test]
async fn created_vm_reports_assigned_addresses() {
    let server = start_agent(Settings::default());
    let creator = creator(&server, Duration::from_secs(10));

    for (vm_id, version) in
        [(1, ClusterVersion::new(4, 7)), (2, ClusterVersion::new(4, 1))]
    {
        let params = params(vm_id, 1024, version);
        let (result, dynamic) = create(&creator, &params).await;
        result.unwrap();

        assert_eq!(dynamic.status, VmStatus::WaitForLaunch, "{version}");
        assert_eq!(dynamic.vcpu_count, Some(2));
        assert_eq!(dynamic.actual_memory_mib, Some(1024));
        assert_eq!(dynamic.run_on_host, Some(params.host.id));
        assert_eq!(
            dynamic.device_addresses.get(&NIC_ID),
            Some(&DeviceAddress::Pci { path: PciPath::new(0, 9, 0).unwrap() }),
            "{version}"
        );
        assert!(matches!(
            dynamic.device_addresses.get(&DISK_ID),
            Some(DeviceAddress::Drive { .. })
        ));
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn rejections_keep_the_agent_diagnostic() {
    let server = start_agent(Settings {
        memory_capacity_mib: 4096,
        response_delay: None,
    });
    let creator = creator(&server, Duration::from_secs(10));

    let first = params(1, 2048, ClusterVersion::new(4, 7));
    create(&creator, &first).await.0.unwrap();

    let (result, dynamic) = create(&creator, &first).await;
    match result {
        Err(CreateError::HostRejection { code, message }) => {
            assert_eq!(code, vmbroker_mock_agent::VM_ALREADY_EXISTS);
            assert!(message.contains(&first.vm.id.to_string()));
        }
        other => panic!("unexpected result {other:?}"),
    }
    assert_eq!(dynamic, VmDynamicState::new(first.vm.id));

    let big = params(2, 4096, ClusterVersion::new(4, 7));
    match create(&creator, &big).await.0 {
        Err(CreateError::HostRejection { code, message }) => {
            assert_eq!(code, vmbroker_mock_agent::INSUFFICIENT_RESOURCES);
            assert!(message.contains("4096 MiB"), "{message}");
        }
        other => panic!("unexpected result {other:?}"),
    }

    server.close().await.unwrap();
}

#[tokio::test]
async fn slow_agent_is_a_communication_failure() {
    let server = start_agent(Settings {
        response_delay: Some(Duration::from_secs(5)),
        ..Default::default()
    });
    let creator = creator(&server, Duration::from_millis(200));

    let params = params(1, 1024, ClusterVersion::new(4, 7));
    let (result, dynamic) = create(&creator, &params).await;
    assert!(
        matches!(result, Err(CreateError::HostCommunication(_))),
        "unexpected result {result:?}"
    );
    assert_eq!(dynamic, VmDynamicState::new(params.vm.id));

    server.close().await.unwrap();
}

#[tokio::test]
async fn unreachable_agent_is_a_communication_failure() {
    // Nothing listens on the address once the server has closed.
    let server = start_agent(Settings::default());
    let creator = creator(&server, Duration::from_secs(2));
    server.close().await.unwrap();

    let params = params(1, 1024, ClusterVersion::new(4, 7));
    let (result, _) = create(&creator, &params).await;
    assert!(
        matches!(result, Err(CreateError::HostCommunication(_))),
        "unexpected result {result:?}"
    );
}
