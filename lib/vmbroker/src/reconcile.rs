// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Folding a host's runtime snapshot into a VM's dynamic state.

use vmbroker_api_types::runtime::VmRuntimeSnapshot;

use crate::vm::VmDynamicState;

/// Copies the host-authoritative fields present in `snapshot` into `state`.
///
/// Sections the snapshot omits leave the corresponding state untouched.
/// Applying the same snapshot again changes nothing. Callers must only pass
/// snapshots from successful creations.
pub fn reconcile(state: &mut VmDynamicState, snapshot: &VmRuntimeSnapshot) {
    state.status = snapshot.status;

    if let Some(cpu) = &snapshot.cpu {
        state.vcpu_count = Some(cpu.vcpu_count);
        state.cpu_user_pct = Some(cpu.user_pct);
        state.cpu_sys_pct = Some(cpu.sys_pct);
    }
    if let Some(memory) = &snapshot.memory {
        state.actual_memory_mib = Some(memory.actual_mib);
    }
    if let Some(devices) = &snapshot.devices {
        for dev in devices {
            state.device_addresses.insert(dev.device_id, dev.address);
            if let Some(alias) = &dev.alias {
                state.device_aliases.insert(dev.device_id, alias.clone());
            }
        }
    }
    if let Some(display) = &snapshot.display {
        state.display = Some(display.clone());
    }
    if let Some(pid) = snapshot.pid {
        state.pid = Some(pid);
    }
}
