// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The broker's model of a VM: its static definition, the host it is being
//! created on, the caller's initialization request, and the dynamic state
//! that is folded back from the host once the VM exists.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vmbroker_api_types::descriptor::{
    Balloon, Console, DeviceAddress, DiskInterface, Floppy, Graphics,
    HostDevice, NicModel, NumaTuneMode, Rng, Sound, UsbController, Video,
    VirtioScsiController, VirtioSerialController, Watchdog,
};
use vmbroker_api_types::runtime::{DisplayInfo, VmStatus};
use vmbroker_api_types::{ClusterVersion, DriveBus, PciPath};

use crate::payload::PayloadDevice;

/// The static definition of a VM.
///
/// A `VmSpec` is owned by the caller and only ever read by the broker.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct VmSpec {
    pub id: Uuid,
    pub name: String,

    #[serde(default)]
    pub os: GuestOs,

    pub cpu: CpuTopology,

    /// The largest vCPU count the VM may be hot-plugged up to. Defaults to the
    /// boot-time vCPU count.
    #[serde(default)]
    pub max_vcpus: Option<u32>,

    pub memory_mib: u64,

    #[serde(default)]
    pub max_memory_mib: Option<u64>,

    #[serde(default)]
    pub timezone: Option<TimeZone>,

    #[serde(default)]
    pub serial_number: Option<SerialNumberPolicy>,

    #[serde(default)]
    pub numa: Option<NumaConfig>,

    #[serde(default)]
    pub boot: BootConfig,

    /// The logical network the VM's graphical console is served on.
    #[serde(default)]
    pub display_network: Option<String>,

    #[serde(default)]
    pub custom_properties: BTreeMap<String, String>,

    /// Attached devices. Their order is the order in which devices of the
    /// same kind appear in the generated descriptor.
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl VmSpec {
    /// Returns a minimal VM definition with no devices.
    pub fn new(id: Uuid, name: impl Into<String>, cpu: CpuTopology) -> Self {
        Self {
            id,
            name: name.into(),
            os: GuestOs::default(),
            cpu,
            max_vcpus: None,
            memory_mib: 1024,
            max_memory_mib: None,
            timezone: None,
            serial_number: None,
            numa: None,
            boot: BootConfig::default(),
            display_network: None,
            custom_properties: BTreeMap::new(),
            devices: Vec::new(),
        }
    }

    pub fn device(&self, id: Uuid) -> Option<&DeviceSpec> {
        self.devices.iter().find(|d| d.id == id)
    }
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum GuestOs {
    #[default]
    Linux,
    Windows,
    Other,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,
}

impl CpuTopology {
    pub const fn new(
        sockets: u32,
        cores_per_socket: u32,
        threads_per_core: u32,
    ) -> Self {
        Self { sockets, cores_per_socket, threads_per_core }
    }

    /// The number of vCPUs online at boot.
    pub fn vcpus(&self) -> u32 {
        self.sockets
            .saturating_mul(self.cores_per_socket)
            .saturating_mul(self.threads_per_core)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TimeZone {
    pub name: String,

    #[serde(default)]
    pub utc_offset_seconds: i32,
}

/// Where the guest-visible SMBIOS serial number comes from.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "policy", content = "value", rename_all = "snake_case")]
pub enum SerialNumberPolicy {
    /// Use the target host's ID.
    Host,
    /// Use the VM's ID.
    Vm,
    Custom(String),
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NumaConfig {
    #[serde(default)]
    pub mode: NumaTuneMode,
    pub nodes: Vec<VirtualNumaNode>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VirtualNumaNode {
    pub index: u32,
    pub cpus: Vec<u32>,
    pub memory_mib: u64,

    /// Host NUMA nodes this node's memory is pinned to.
    #[serde(default)]
    pub host_nodes: Vec<u32>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct BootConfig {
    /// Device classes to boot from, in order. Ignored when any device carries
    /// an explicit boot order.
    #[serde(default)]
    pub sequence: Vec<BootDeviceClass>,

    #[serde(default)]
    pub menu: bool,

    #[serde(default)]
    pub kernel: Option<KernelBoot>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BootDeviceClass {
    HardDisk,
    Cdrom,
    Network,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct KernelBoot {
    pub path: String,

    #[serde(default)]
    pub initrd: Option<String>,

    #[serde(default)]
    pub cmdline: Option<String>,
}

/// A device attached to a VM.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DeviceSpec {
    pub id: Uuid,

    /// A fixed guest PCI address. Devices without one get an address from
    /// their kind's slot range when the descriptor is built.
    #[serde(default)]
    pub address: Option<PciPath>,

    #[serde(default)]
    pub boot_order: Option<u32>,

    #[serde(flatten)]
    pub kind: DeviceKind,
}

impl DeviceSpec {
    pub fn new(id: Uuid, kind: DeviceKind) -> Self {
        Self { id, address: None, boot_order: None, kind }
    }

    pub fn with_address(mut self, address: PciPath) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_boot_order(mut self, order: u32) -> Self {
        self.boot_order = Some(order);
        self
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceKind {
    Disk(DiskSpec),
    Cdrom(CdromSpec),
    Floppy(Floppy),
    Nic(NicSpec),
    Video(Video),
    Graphics(Graphics),
    Sound(Sound),
    Console(Console),
    UsbController(UsbController),
    Balloon(Balloon),
    Watchdog(Watchdog),
    VirtioScsi(VirtioScsiController),
    VirtioSerial(VirtioSerialController),
    Rng(Rng),
    HostDevice(HostDevice),
    Unmanaged(UnmanagedSpec),
}

impl DeviceKind {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceKind::Disk(_) => "disk",
            DeviceKind::Cdrom(_) => "cdrom",
            DeviceKind::Floppy(_) => "floppy",
            DeviceKind::Nic(_) => "nic",
            DeviceKind::Video(_) => "video",
            DeviceKind::Graphics(_) => "graphics",
            DeviceKind::Sound(_) => "sound",
            DeviceKind::Console(_) => "console",
            DeviceKind::UsbController(_) => "usb_controller",
            DeviceKind::Balloon(_) => "balloon",
            DeviceKind::Watchdog(_) => "watchdog",
            DeviceKind::VirtioScsi(_) => "virtio_scsi",
            DeviceKind::VirtioSerial(_) => "virtio_serial",
            DeviceKind::Rng(_) => "rng",
            DeviceKind::HostDevice(_) => "host_device",
            DeviceKind::Unmanaged(_) => "unmanaged",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct DiskSpec {
    pub path: String,
    pub interface: DiskInterface,

    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct CdromSpec {
    #[serde(default)]
    pub path: Option<String>,

    #[serde(default = "default_cdrom_bus")]
    pub bus: DriveBus,
}

fn default_cdrom_bus() -> DriveBus {
    DriveBus::Ide
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NicSpec {
    pub name: String,
    pub mac: String,
    pub network: String,

    #[serde(default = "default_nic_model")]
    pub model: NicModel,

    #[serde(default = "default_true")]
    pub link_up: bool,

    /// Back this vNIC with an SR-IOV virtual function on the host instead of
    /// an emulated device.
    #[serde(default)]
    pub passthrough: bool,
}

fn default_nic_model() -> NicModel {
    NicModel::Virtio
}

fn default_true() -> bool {
    true
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnmanagedSpec {
    pub device_type: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,

    /// Only meaningful when resuming from a hibernation volume; left out of
    /// cold boots.
    #[serde(default)]
    pub restore_only: bool,
}

/// The host a VM is being created on.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct TargetHost {
    pub id: Uuid,
    pub name: String,

    /// Hardware threads available on the host. Bounds the VM's hotplug vCPU
    /// ceiling.
    pub cpu_threads: u32,

    #[serde(default)]
    pub display_address: Option<IpAddr>,
}

/// What, if anything, the guest should be initialized with on first boot.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitializationRequest {
    #[default]
    None,
    Sysprep(SysprepParams),
    CloudInit(VmInit),
}

/// Parameters for a Windows unattended setup answer file.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SysprepParams {
    #[serde(default)]
    pub computer_name: Option<String>,

    #[serde(default)]
    pub domain: Option<String>,

    #[serde(default)]
    pub admin_password: Option<String>,

    #[serde(default)]
    pub org_name: Option<String>,

    #[serde(default)]
    pub product_key: Option<String>,

    #[serde(default)]
    pub locale: Option<String>,
}

/// Guest initialization settings delivered through cloud-init.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct VmInit {
    #[serde(default)]
    pub hostname: Option<String>,

    #[serde(default)]
    pub user_name: Option<String>,

    #[serde(default)]
    pub root_password: Option<String>,

    #[serde(default)]
    pub ssh_authorized_keys: Vec<String>,

    #[serde(default)]
    pub regenerate_ssh_keys: bool,

    #[serde(default)]
    pub timezone: Option<String>,

    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,

    #[serde(default)]
    pub dns_search: Vec<String>,

    #[serde(default)]
    pub network_interfaces: Vec<InitNetworkInterface>,

    /// Extra cloud-config content appended verbatim to the generated user
    /// data.
    #[serde(default)]
    pub custom_script: Option<String>,
}

impl VmInit {
    /// Returns true if nothing would be configured in the guest.
    pub fn is_empty(&self) -> bool {
        self == &VmInit::default()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct InitNetworkInterface {
    pub name: String,

    #[serde(default)]
    pub boot_protocol: BootProtocol,

    #[serde(default)]
    pub address: Option<IpAddr>,

    #[serde(default)]
    pub netmask: Option<String>,

    #[serde(default)]
    pub gateway: Option<IpAddr>,

    #[serde(default = "default_true")]
    pub on_boot: bool,
}

#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum BootProtocol {
    #[default]
    Dhcp,
    Static,
    None,
}

/// Everything one create command needs.
#[derive(Clone, Debug)]
pub struct CreateParams {
    pub vm: VmSpec,
    pub host: TargetHost,
    pub cluster_version: ClusterVersion,

    /// Resume from this saved-state volume instead of cold-booting.
    pub hibernation_volume_handle: Option<String>,

    pub initialization: InitializationRequest,

    /// Removable-media payload supplied by the caller, used as-is when no
    /// initialization is requested.
    pub supplied_payload: Option<PayloadDevice>,

    /// Host virtual function assigned to each passthrough vNIC, by device ID.
    pub passthrough_vnic_to_vf: BTreeMap<Uuid, String>,

    /// Discard guest writes to writable disks when the VM stops.
    pub volatile_run: bool,
}

impl CreateParams {
    pub fn new(
        vm: VmSpec,
        host: TargetHost,
        cluster_version: ClusterVersion,
    ) -> Self {
        Self {
            vm,
            host,
            cluster_version,
            hibernation_volume_handle: None,
            initialization: InitializationRequest::None,
            supplied_payload: None,
            passthrough_vnic_to_vf: BTreeMap::new(),
            volatile_run: false,
        }
    }

    /// The hibernation handle, treating an empty string as no handle.
    pub fn hibernation_volume_handle(&self) -> Option<&str> {
        self.hibernation_volume_handle.as_deref().filter(|h| !h.is_empty())
    }
}

/// The broker's record of a VM's host-authoritative runtime attributes.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VmDynamicState {
    pub vm_id: Uuid,
    pub status: VmStatus,
    pub run_on_host: Option<Uuid>,
    pub vcpu_count: Option<u32>,
    pub cpu_user_pct: Option<f64>,
    pub cpu_sys_pct: Option<f64>,
    pub actual_memory_mib: Option<u64>,
    pub device_addresses: BTreeMap<Uuid, DeviceAddress>,
    pub device_aliases: BTreeMap<Uuid, String>,
    pub display: Option<DisplayInfo>,
    pub pid: Option<u32>,
}

impl VmDynamicState {
    pub fn new(vm_id: Uuid) -> Self {
        Self {
            vm_id,
            status: VmStatus::Down,
            run_on_host: None,
            vcpu_count: None,
            cpu_user_pct: None,
            cpu_sys_pct: None,
            actual_memory_mib: None,
            device_addresses: BTreeMap::new(),
            device_aliases: BTreeMap::new(),
            display: None,
            pid: None,
        }
    }
}
