// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The legacy VM descriptor: a flat map from documented keys to string, list,
//! or nested map values, consumed by host agents that predate the unified
//! descriptor.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Documented top-level keys of a legacy descriptor.
pub mod keys {
    pub const VM_ID: &str = "vmId";
    pub const VM_NAME: &str = "vmName";
    pub const HOST_ID: &str = "hostId";
    pub const SMP: &str = "smp";
    pub const SMP_CORES_PER_SOCKET: &str = "smpCoresPerSocket";
    pub const SMP_THREADS_PER_CORE: &str = "smpThreadsPerCore";
    pub const MAX_VCPUS: &str = "maxVCpus";
    pub const MEM_SIZE: &str = "memSize";
    pub const MAX_MEM_SIZE: &str = "maxMemSize";
    pub const DRIVES: &str = "drives";
    pub const DEVICES: &str = "devices";
    pub const BOOT: &str = "boot";
    pub const BOOT_MENU_ENABLE: &str = "bootMenuEnable";
    pub const KERNEL: &str = "kernel";
    pub const INITRD: &str = "initrd";
    pub const KERNEL_ARGS: &str = "kernelArgs";
    pub const TIMEZONE: &str = "timezone";
    pub const TIME_OFFSET: &str = "timeOffset";
    pub const SERIAL: &str = "serial";
    pub const DISPLAY_NETWORK: &str = "displayNetwork";
    pub const DISPLAY_IP: &str = "displayIp";
    pub const GUEST_NUMA_NODES: &str = "guestNumaNodes";
    pub const NUMA_TUNE: &str = "numaTune";
    pub const CUSTOM: &str = "custom";
    pub const VOLATILE_RUN: &str = "volatileRun";
    pub const CLUSTER_VERSION: &str = "clusterVersion";
    pub const HIBER_VOL_HANDLE: &str = "hiberVolHandle";

    /// Keys of the per-device maps found under [`DRIVES`] and [`DEVICES`].
    pub mod device {
        pub const TYPE: &str = "type";
        pub const DEVICE: &str = "device";
        pub const DEVICE_ID: &str = "deviceId";
        pub const ADDRESS: &str = "address";
        pub const SPEC_PARAMS: &str = "specParams";
        pub const BOOT_ORDER: &str = "bootOrder";
    }
}

/// A value in a legacy descriptor.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(untagged)]
pub enum LegacyValue {
    String(String),
    List(Vec<LegacyValue>),
    Map(BTreeMap<String, LegacyValue>),
}

impl LegacyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            LegacyValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[LegacyValue]> {
        match self {
            LegacyValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, LegacyValue>> {
        match self {
            LegacyValue::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<String> for LegacyValue {
    fn from(value: String) -> Self {
        LegacyValue::String(value)
    }
}

impl From<&str> for LegacyValue {
    fn from(value: &str) -> Self {
        LegacyValue::String(value.to_owned())
    }
}

impl From<bool> for LegacyValue {
    fn from(value: bool) -> Self {
        LegacyValue::String(value.to_string())
    }
}

impl From<Vec<LegacyValue>> for LegacyValue {
    fn from(value: Vec<LegacyValue>) -> Self {
        LegacyValue::List(value)
    }
}

impl From<BTreeMap<String, LegacyValue>> for LegacyValue {
    fn from(value: BTreeMap<String, LegacyValue>) -> Self {
        LegacyValue::Map(value)
    }
}

/// A complete legacy descriptor.
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq,
)]
#[serde(transparent)]
pub struct LegacyDescriptor(pub BTreeMap<String, LegacyValue>);

impl LegacyDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<LegacyValue>,
    ) -> Option<LegacyValue> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&LegacyValue> {
        self.0.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Iterates over the per-device maps under `key` (either [`keys::DRIVES`]
    /// or [`keys::DEVICES`]), skipping entries that are not maps.
    pub fn device_maps<'a>(
        &'a self,
        key: &str,
    ) -> impl Iterator<Item = &'a BTreeMap<String, LegacyValue>> + 'a {
        self.get(key)
            .and_then(LegacyValue::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(LegacyValue::as_map)
    }
}
