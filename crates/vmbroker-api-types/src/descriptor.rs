// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The unified VM descriptor: a single structured document with `cpu`,
//! `memory`, `os`, `devices`, and `metadata` sections.
//!
//! The device model types in this module double as the vocabulary of the
//! broker's VM definitions, so a device kind's attributes are spelled the same
//! way in a VM definition and in the descriptor generated from it.

use std::collections::BTreeMap;
use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ClusterVersion, DriveBus, PciPath};

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DomainDescriptor {
    pub vm_id: Uuid,
    pub name: String,
    pub cpu: CpuSection,
    pub memory: MemorySection,
    pub os: OsSection,

    /// Every device attached to the VM, in the order the builder produced
    /// them. A generated initialization payload comes last; a payload
    /// supplied by the caller sits with the other removable media.
    pub devices: Vec<DeviceDescriptor>,
    pub metadata: MetadataSection,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CpuSection {
    pub sockets: u32,
    pub cores_per_socket: u32,
    pub threads_per_core: u32,

    /// The number of vCPUs online at boot.
    pub vcpus: u32,

    /// The number of vCPUs the VM may grow to via hotplug.
    pub max_vcpus: u32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub numa_cells: Vec<NumaCell>,
}

/// A guest-visible NUMA node.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NumaCell {
    pub index: u32,
    pub cpus: Vec<u32>,
    pub memory_mib: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MemorySection {
    pub size_mib: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size_mib: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numa_tune: Option<NumaTune>,
}

/// Pinning of guest NUMA cells to host NUMA nodes.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NumaTune {
    pub mode: NumaTuneMode,
    pub nodes: Vec<NumaNodePinning>,
}

#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Serialize,
    JsonSchema,
    PartialEq,
    Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum NumaTuneMode {
    #[default]
    Strict,
    Interleave,
    Preferred,
}

impl NumaTuneMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NumaTuneMode::Strict => "strict",
            NumaTuneMode::Interleave => "interleave",
            NumaTuneMode::Preferred => "preferred",
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NumaNodePinning {
    pub cell: u32,
    pub host_nodes: Vec<u32>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OsSection {
    /// Bootable devices in the order the firmware should try them.
    #[serde(default)]
    pub boot: Vec<BootEntry>,
    pub boot_menu: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<DirectKernelBoot>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smbios_serial: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock: Option<Clock>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BootEntry {
    pub device_id: Uuid,
    pub order: u32,
}

/// Boot directly into a kernel image instead of going through firmware
/// device selection.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DirectKernelBoot {
    pub kernel: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmdline: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Clock {
    pub timezone: String,
    pub utc_offset_seconds: i32,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetadataSection {
    /// The host this descriptor was built for.
    pub host_id: Uuid,
    pub cluster_version: ClusterVersion,

    /// Writable disks are discarded when the VM stops.
    #[serde(default)]
    pub volatile_run: bool,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkMetadata>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct NetworkMetadata {
    /// The logical network the VM's graphical console is served on.
    pub display_network: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_address: Option<IpAddr>,
}

/// Where a device sits in the guest's hardware topology.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash,
)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceAddress {
    Pci { path: PciPath },
    Drive { bus: DriveBus, controller: u8, unit: u8 },
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceAddress::Pci { path } => write!(f, "pci:{path}"),
            DeviceAddress::Drive { bus, controller, unit } => {
                write!(f, "{bus}:{controller}:{unit}")
            }
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct DeviceDescriptor {
    pub id: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<DeviceAddress>,

    pub device: DeviceV1,
}

/// A device attached to a VM, tagged by kind.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, tag = "type", content = "component")]
pub enum DeviceV1 {
    Video(Video),
    Graphics(Graphics),
    Cdrom(Cdrom),
    Floppy(Floppy),
    Disk(Disk),
    Nic(Nic),
    PassthroughNic(PassthroughNic),
    Sound(Sound),
    Console(Console),
    UsbController(UsbController),
    Balloon(Balloon),
    Watchdog(Watchdog),
    VirtioScsi(VirtioScsiController),
    VirtioSerial(VirtioSerialController),
    Rng(Rng),
    Unmanaged(Unmanaged),
    HostDevice(HostDevice),
    Payload(Payload),
}

impl DeviceV1 {
    /// The device class name used by the legacy attribute map's `type` key.
    pub fn class(&self) -> &'static str {
        match self {
            DeviceV1::Video(_) => "video",
            DeviceV1::Graphics(_) => "graphics",
            DeviceV1::Cdrom(_) | DeviceV1::Floppy(_) | DeviceV1::Disk(_) => {
                "disk"
            }
            DeviceV1::Payload(_) => "disk",
            DeviceV1::Nic(_) | DeviceV1::PassthroughNic(_) => "interface",
            DeviceV1::Sound(_) => "sound",
            DeviceV1::Console(_) => "console",
            DeviceV1::UsbController(_)
            | DeviceV1::VirtioScsi(_)
            | DeviceV1::VirtioSerial(_) => "controller",
            DeviceV1::Balloon(_) => "balloon",
            DeviceV1::Watchdog(_) => "watchdog",
            DeviceV1::Rng(_) => "rng",
            DeviceV1::Unmanaged(_) => "unmanaged",
            DeviceV1::HostDevice(_) => "hostdev",
        }
    }

    /// The concrete device name used by the legacy attribute map's `device`
    /// key.
    pub fn device_name(&self) -> &'static str {
        match self {
            DeviceV1::Video(v) => v.model.as_str(),
            DeviceV1::Graphics(g) => g.protocol.as_str(),
            DeviceV1::Cdrom(_) => "cdrom",
            DeviceV1::Floppy(_) => "floppy",
            DeviceV1::Disk(_) => "disk",
            DeviceV1::Nic(_) => "bridge",
            DeviceV1::PassthroughNic(_) => "hostdev",
            DeviceV1::Sound(s) => s.model.as_str(),
            DeviceV1::Console(_) => "console",
            DeviceV1::UsbController(_) => "usb",
            DeviceV1::Balloon(_) => "memballoon",
            DeviceV1::Watchdog(_) => "watchdog",
            DeviceV1::VirtioScsi(_) => "virtio-scsi",
            DeviceV1::VirtioSerial(_) => "virtio-serial",
            DeviceV1::Rng(_) => "virtio",
            DeviceV1::Unmanaged(_) => "unmanaged",
            DeviceV1::HostDevice(h) => h.kind.as_str(),
            DeviceV1::Payload(p) => p.media.as_str(),
        }
    }

    /// Returns true for devices that live on a drive controller rather than
    /// directly on the PCI bus.
    pub fn is_drive(&self) -> bool {
        matches!(
            self,
            DeviceV1::Cdrom(_)
                | DeviceV1::Floppy(_)
                | DeviceV1::Disk(_)
                | DeviceV1::Payload(_)
        )
    }
}

macro_rules! str_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident => $s:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(
            Clone,
            Copy,
            Debug,
            Deserialize,
            Serialize,
            JsonSchema,
            PartialEq,
            Eq,
        )]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $s),+
                }
            }
        }
    };
}

str_enum! {
    pub enum VideoModel {
        Qxl => "qxl",
        Vga => "vga",
        Bochs => "bochs",
        Cirrus => "cirrus",
    }
}

str_enum! {
    pub enum GraphicsProtocol { Spice => "spice", Vnc => "vnc" }
}

str_enum! {
    /// The guest-visible bus a disk is presented on.
    pub enum DiskInterface {
        VirtioBlk => "virtio",
        VirtioScsi => "scsi",
        Ide => "ide",
        Sata => "sata",
    }
}

str_enum! {
    pub enum NicModel {
        Virtio => "virtio",
        E1000 => "e1000",
        Rtl8139 => "rtl8139",
    }
}

str_enum! {
    pub enum SoundModel { Ich6 => "ich6", Ich9 => "ich9", Ac97 => "ac97" }
}

str_enum! {
    pub enum ConsoleKind { Virtio => "virtio", Serial => "serial" }
}

str_enum! {
    pub enum UsbModel {
        Piix3Uhci => "piix3-uhci",
        Ich9Ehci1 => "ich9-ehci1",
        QemuXhci => "qemu-xhci",
    }
}

str_enum! {
    pub enum BalloonModel { Virtio => "virtio", None => "none" }
}

str_enum! {
    pub enum WatchdogModel { I6300esb => "i6300esb", Ib700 => "ib700" }
}

str_enum! {
    pub enum WatchdogAction {
        None => "none",
        Reset => "reset",
        Poweroff => "poweroff",
        Pause => "pause",
        Dump => "dump",
    }
}

str_enum! {
    pub enum RngSource {
        Random => "random",
        Urandom => "urandom",
        Hwrng => "hwrng",
    }
}

str_enum! {
    pub enum HostDeviceKind { Pci => "pci", Usb => "usb", Mdev => "mdev" }
}

str_enum! {
    /// The removable medium an initialization payload is presented on.
    pub enum PayloadMedia { Cdrom => "cdrom", Floppy => "floppy" }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Video {
    pub model: VideoModel,
    pub heads: u8,
    pub vram_kib: u32,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Graphics {
    pub protocol: GraphicsProtocol,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Cdrom {
    /// Image to insert, or `None` for an empty tray.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Floppy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub path: String,
    pub interface: DiskInterface,
    pub read_only: bool,

    /// Guest writes are discarded when the VM stops.
    #[serde(default)]
    pub transient: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Nic {
    pub name: String,
    pub mac: String,
    pub network: String,
    pub model: NicModel,
    pub link_up: bool,
}

/// A vNIC backed directly by an SR-IOV virtual function on the host.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PassthroughNic {
    pub name: String,
    pub mac: String,
    pub network: String,

    /// Host address of the virtual function assigned to this vNIC.
    pub host_vf: String,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Sound {
    pub model: SoundModel,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Console {
    pub kind: ConsoleKind,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct UsbController {
    pub model: UsbModel,
    pub index: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Balloon {
    pub model: BalloonModel,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Watchdog {
    pub model: WatchdogModel,
    pub action: WatchdogAction,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtioScsiController {
    pub index: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct VirtioSerialController {
    pub index: u8,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Rng {
    pub source: RngSource,

    /// Entropy rate limit: at most `bytes` per `period_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<RngRate>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RngRate {
    pub bytes: u32,
    pub period_ms: u32,
}

/// A device the broker does not model, passed through to the host as an
/// opaque kind plus parameters.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Unmanaged {
    pub kind: String,

    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct HostDevice {
    pub kind: HostDeviceKind,

    /// The host-side name of the device, e.g. "pci_0000_05_00_0".
    pub host_address: String,
}

/// Generated initialization content, presented to the guest as removable
/// media.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Payload {
    pub media: PayloadMedia,

    /// The filesystem label the guest looks for, e.g. "config-2".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,

    /// File path to base64-encoded content.
    pub files: BTreeMap<String, String>,
}
