// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of a mock host agent
//!
//! The mock keeps a table of the VMs it has "created" and a memory budget.
//! It refuses duplicate VM IDs and requests that would exceed the budget, and
//! otherwise answers with a runtime snapshot that echoes the device addresses
//! found in the request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dropshot::{
    endpoint, ApiDescription, HttpError, HttpResponseOk, RequestContext,
    TypedBody,
};
use slog::{info, o, warn, Logger};
use tokio::sync::Mutex;
use uuid::Uuid;
use vmbroker_api_types::descriptor::DeviceAddress;
use vmbroker_api_types::legacy::{keys, LegacyDescriptor, LegacyValue};
use vmbroker_api_types::runtime::{
    CpuCounters, DeviceRuntime, MemoryCounters, VmRuntimeSnapshot, VmStatus,
};
use vmbroker_api_types::{CreateRequest, DriveBus, PciPath};

/// Error code for requests the host does not have the memory for.
pub const INSUFFICIENT_RESOURCES: &str = "InsufficientResources";
/// Error code for a VM ID the host already runs.
pub const VM_ALREADY_EXISTS: &str = "VmAlreadyExists";
/// Error code for requests missing their VM ID or memory size.
pub const INVALID_REQUEST: &str = "InvalidRequest";

/// Behavior of the simulated host.
#[derive(Clone, Debug)]
pub struct Settings {
    pub memory_capacity_mib: u64,

    /// Hold every successful answer back for this long.
    pub response_delay: Option<Duration>,
}

impl Default for Settings {
    fn default() -> Self {
        Self { memory_capacity_mib: 64 * 1024, response_delay: None }
    }
}

struct Host {
    /// Memory committed to each VM, in MiB.
    vms: BTreeMap<Uuid, u64>,
    last_pid: u32,
}

/// Contextual information accessible from mock HTTP callbacks.
pub struct Context {
    settings: Settings,
    host: Mutex<Host>,
    log: Logger,
}

impl Context {
    pub fn new(settings: Settings, log: Logger) -> Self {
        Context {
            settings,
            host: Mutex::new(Host { vms: BTreeMap::new(), last_pid: 1000 }),
            log,
        }
    }
}

fn rejection(code: &str, message: String) -> HttpError {
    HttpError::for_bad_request(Some(code.to_string()), message)
}

#[endpoint {
    method = PUT,
    path = "/vm/create",
}]
async fn vm_create(
    rqctx: RequestContext<Arc<Context>>,
    request: TypedBody<CreateRequest>,
) -> Result<HttpResponseOk<VmRuntimeSnapshot>, HttpError> {
    let ctx = rqctx.context();
    let request = request.into_inner();

    let vm_id = request.vm_id().ok_or_else(|| {
        rejection(INVALID_REQUEST, "request does not name a VM".to_string())
    })?;
    let memory_mib = request.memory_mib().ok_or_else(|| {
        rejection(INVALID_REQUEST, "request has no memory size".to_string())
    })?;
    let log = ctx.log.new(o!("vm_id" => vm_id.to_string()));

    let snapshot = {
        let mut host = ctx.host.lock().await;
        if host.vms.contains_key(&vm_id) {
            warn!(log, "refusing duplicate VM");
            return Err(rejection(
                VM_ALREADY_EXISTS,
                format!("VM {vm_id} already exists on this host"),
            ));
        }

        let committed: u64 = host.vms.values().sum();
        let capacity = ctx.settings.memory_capacity_mib;
        if committed.saturating_add(memory_mib) > capacity {
            warn!(log, "refusing VM for lack of memory";
                  "requested_mib" => memory_mib,
                  "committed_mib" => committed);
            return Err(rejection(
                INSUFFICIENT_RESOURCES,
                format!(
                    "cannot allocate {memory_mib} MiB: {committed} of \
                     {capacity} MiB already committed"
                ),
            ));
        }

        host.vms.insert(vm_id, memory_mib);
        host.last_pid += 1;
        snapshot(&request, vm_id, memory_mib, host.last_pid)
    };
    info!(log, "created VM";
          "memory_mib" => memory_mib,
          "status" => ?snapshot.status);

    if let Some(delay) = ctx.settings.response_delay {
        tokio::time::sleep(delay).await;
    }
    Ok(HttpResponseOk(snapshot))
}

fn snapshot(
    request: &CreateRequest,
    vm_id: Uuid,
    memory_mib: u64,
    pid: u32,
) -> VmRuntimeSnapshot {
    let (vcpus, addresses): (Option<u32>, Vec<(Uuid, DeviceAddress)>) =
        match request {
            CreateRequest::Unified { descriptor, .. } => (
                Some(descriptor.cpu.vcpus),
                descriptor
                    .devices
                    .iter()
                    .filter_map(|dev| Some((dev.id, dev.address?)))
                    .collect(),
            ),
            CreateRequest::Legacy(map) => (
                map.get_str(keys::SMP).and_then(|s| s.parse().ok()),
                legacy_addresses(map),
            ),
        };
    let status = if request.hibernation_volume_handle().is_some() {
        VmStatus::RestoringState
    } else {
        VmStatus::WaitForLaunch
    };

    let devices = addresses
        .into_iter()
        .enumerate()
        .map(|(i, (device_id, address))| DeviceRuntime {
            device_id,
            address,
            alias: Some(format!("ua-{i}")),
        })
        .collect();

    VmRuntimeSnapshot {
        cpu: vcpus.map(|vcpu_count| CpuCounters {
            vcpu_count,
            user_pct: 0.0,
            sys_pct: 0.0,
        }),
        memory: Some(MemoryCounters { actual_mib: memory_mib }),
        devices: Some(devices),
        pid: Some(pid),
        ..VmRuntimeSnapshot::bare(vm_id, status)
    }
}

fn legacy_addresses(map: &LegacyDescriptor) -> Vec<(Uuid, DeviceAddress)> {
    map.device_maps(keys::DRIVES)
        .chain(map.device_maps(keys::DEVICES))
        .filter_map(|dev| {
            let id = dev.get(keys::device::DEVICE_ID)?.as_str()?.parse().ok()?;
            let address = dev.get(keys::device::ADDRESS)?.as_map()?;
            Some((id, parse_legacy_address(address)?))
        })
        .collect()
}

fn parse_legacy_address(
    address: &BTreeMap<String, LegacyValue>,
) -> Option<DeviceAddress> {
    let field = |key: &str| address.get(key).and_then(LegacyValue::as_str);
    let hex = |key: &str| {
        field(key).and_then(|s| {
            u8::from_str_radix(s.trim_start_matches("0x"), 16).ok()
        })
    };

    match field("type")? {
        "pci" => {
            let path =
                PciPath::new(hex("bus")?, hex("slot")?, hex("function")?)
                    .ok()?;
            Some(DeviceAddress::Pci { path })
        }
        "drive" => {
            let bus = match field("interface")? {
                "ide" => DriveBus::Ide,
                "sata" => DriveBus::Sata,
                "scsi" => DriveBus::Scsi,
                "fdc" => DriveBus::Fdc,
                _ => return None,
            };
            Some(DeviceAddress::Drive {
                bus,
                controller: field("controller")?.parse().ok()?,
                unit: field("unit")?.parse().ok()?,
            })
        }
        _ => None,
    }
}

/// Returns a Dropshot [`ApiDescription`] object to launch a mock host agent.
pub fn api() -> Result<ApiDescription<Arc<Context>>, String> {
    let mut api = ApiDescription::new();
    api.register(vm_create).map_err(|e| e.to_string())?;
    Ok(api)
}

/// configuration for the dropshot server
pub type Config = dropshot::ConfigDropshot;
/// the dropshot server itself
pub type Server = dropshot::HttpServer<Arc<Context>>;
/// errors returned from attempting to start a dropshot server
pub type ServerStartError = Box<dyn std::error::Error + Send + Sync>;

/// Starts a mock host agent
pub fn start(
    config: Config,
    settings: Settings,
    log: Logger,
) -> Result<Server, ServerStartError> {
    let agent_log = log.new(o!("component" => "mock-agent"));
    let dropshot_log = log.new(o!("component" => "dropshot"));
    let private = Arc::new(Context::new(settings, agent_log));
    let starter = dropshot::HttpServerStarter::new(
        &config,
        api()?,
        private,
        &dropshot_log,
    )?;
    Ok(starter.start())
}
