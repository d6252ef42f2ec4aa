// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What a host agent reports back after creating a VM.

use std::net::IpAddr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::descriptor::{DeviceAddress, GraphicsProtocol};

/// The VM's lifecycle state as observed by the host.
#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Down,
    WaitForLaunch,
    PoweringUp,
    RestoringState,
    Up,
}

/// Runtime attributes of a VM whose authoritative source is the host.
///
/// Every section other than `vm_id` and `status` is optional: agents commonly
/// answer a create call before all counters are available.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct VmRuntimeSnapshot {
    pub vm_id: Uuid,
    pub status: VmStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<CpuCounters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryCounters>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devices: Option<Vec<DeviceRuntime>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<DisplayInfo>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

impl VmRuntimeSnapshot {
    /// A snapshot carrying nothing but the VM's identity and status.
    pub fn bare(vm_id: Uuid, status: VmStatus) -> Self {
        Self {
            vm_id,
            status,
            cpu: None,
            memory: None,
            devices: None,
            display: None,
            pid: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct CpuCounters {
    pub vcpu_count: u32,
    pub user_pct: f64,
    pub sys_pct: f64,
}

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
pub struct MemoryCounters {
    /// Memory actually backing the guest, which can trail the configured size
    /// while the balloon is inflated.
    pub actual_mib: u64,
}

/// The host-assigned identity of one device.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DeviceRuntime {
    pub device_id: Uuid,
    pub address: DeviceAddress,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct DisplayInfo {
    pub protocol: GraphicsProtocol,
    pub address: IpAddr,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_port: Option<u16>,
}
