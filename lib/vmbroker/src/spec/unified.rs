// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Renders a [`Spec`] as a unified descriptor document.

use vmbroker_api_types::descriptor::{
    DeviceDescriptor, DomainDescriptor, MetadataSection, OsSection,
};

use super::{Component, Spec};

impl From<&Component> for DeviceDescriptor {
    fn from(c: &Component) -> Self {
        DeviceDescriptor {
            id: c.id,
            address: c.address,
            device: c.device.clone(),
        }
    }
}

pub fn render(spec: &Spec) -> DomainDescriptor {
    DomainDescriptor {
        vm_id: spec.vm_id,
        name: spec.name.clone(),
        cpu: spec.cpu.clone(),
        memory: spec.memory.clone(),
        os: OsSection {
            boot: spec.boot.clone(),
            boot_menu: spec.boot_menu,
            kernel: spec.kernel.clone(),
            smbios_serial: spec.smbios_serial.clone(),
            clock: spec.clock.clone(),
        },
        devices: spec.devices.iter().map(Into::into).collect(),
        metadata: MetadataSection {
            host_id: spec.host_id,
            cluster_version: spec.cluster_version,
            volatile_run: spec.volatile_run,
            properties: spec.properties.clone(),
            network: spec.network.clone(),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::test_support::Fixture;
    use crate::vm::{DeviceKind, DeviceSpec, TimeZone};
    use uuid::Uuid;
    use vmbroker_api_types::descriptor::{Sound, SoundModel};

    #[test]
    fn renders_every_section() {
        let mut fx = Fixture::empty();
        fx.vm.timezone = Some(TimeZone {
            name: "Etc/UTC".to_string(),
            utc_offset_seconds: 0,
        });
        fx.vm.custom_properties.insert("hugepages".into(), "1048576".into());
        fx.vm.devices.push(DeviceSpec::new(
            Uuid::from_u128(5),
            DeviceKind::Sound(Sound { model: SoundModel::Ich9 }),
        ));

        let spec = fx.build().unwrap();
        let doc = render(&spec);
        assert_eq!(doc.vm_id, fx.vm.id);
        assert_eq!(doc.metadata.host_id, fx.host.id);
        assert_eq!(doc.os.clock.as_ref().unwrap().timezone, "Etc/UTC");
        assert_eq!(doc.metadata.properties["hugepages"], "1048576");
        assert_eq!(doc.devices.len(), 1);
        assert_eq!(doc.devices[0].address, spec.devices[0].address);

        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(json["devices"][0]["device"]["type"], "Sound");
        assert_eq!(json["devices"][0]["address"]["type"], "pci");
    }
}
