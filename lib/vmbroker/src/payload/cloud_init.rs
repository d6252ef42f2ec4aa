// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! cloud-init data in the OpenStack config-drive layout.

use std::net::IpAddr;

use serde_json::{json, Map, Value};

use super::{GenerationError, PayloadContent};
use crate::vm::{BootProtocol, InitNetworkInterface, VmInit, VmSpec};

pub const META_DATA_PATH: &str = "openstack/latest/meta_data.json";
pub const USER_DATA_PATH: &str = "openstack/latest/user_data";
pub const NETWORK_DATA_PATH: &str = "openstack/latest/network_data.json";

/// Produces the files of a cloud-init payload.
pub trait CloudInitGenerator: Send + Sync {
    /// Returns the payload files, or an empty mapping if nothing needs to be
    /// configured in the guest.
    fn generate(
        &self,
        vm: &VmSpec,
        init: &VmInit,
    ) -> Result<PayloadContent, GenerationError>;
}

/// Generates an OpenStack-style config drive.
///
/// Output depends only on the VM and its initialization settings: generating
/// twice yields identical bytes.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDriveCloudInit;

impl CloudInitGenerator for ConfigDriveCloudInit {
    fn generate(
        &self,
        vm: &VmSpec,
        init: &VmInit,
    ) -> Result<PayloadContent, GenerationError> {
        if init.is_empty() {
            return Ok(PayloadContent::new());
        }

        let mut content = PayloadContent::new();
        let meta = meta_data(vm, init);
        content.insert(META_DATA_PATH, to_json(META_DATA_PATH, &meta)?);
        content.insert(USER_DATA_PATH, user_data(init)?);
        if let Some(network) = network_data(init)? {
            let network = to_json(NETWORK_DATA_PATH, &network)?;
            content.insert(NETWORK_DATA_PATH, network);
        }

        Ok(content)
    }
}

fn to_json(
    file: &'static str,
    value: &Value,
) -> Result<Vec<u8>, GenerationError> {
    serde_json::to_vec_pretty(value)
        .map_err(|source| GenerationError::Serialize { file, source })
}

fn meta_data(vm: &VmSpec, init: &VmInit) -> Value {
    let hostname = init.hostname.as_deref().unwrap_or(&vm.name);
    let mut meta = json!({
        "uuid": vm.id,
        "hostname": hostname,
        "name": hostname,
        "launch_index": 0,
        "availability_zone": "nova",
    });

    if !init.ssh_authorized_keys.is_empty() {
        let keys: Map<String, Value> = init
            .ssh_authorized_keys
            .iter()
            .enumerate()
            .map(|(i, key)| (i.to_string(), Value::from(key.as_str())))
            .collect();
        meta["public_keys"] = Value::Object(keys);
    }

    meta
}

/// Renders user data as cloud-config YAML. Scalars are written as JSON
/// strings, which YAML reads as double-quoted scalars.
fn user_data(init: &VmInit) -> Result<Vec<u8>, GenerationError> {
    let quote = |s: &str| {
        serde_json::to_string(s).map_err(|source| GenerationError::Serialize {
            file: USER_DATA_PATH,
            source,
        })
    };

    let mut lines = vec!["#cloud-config".to_string()];
    if let Some(user) = &init.user_name {
        lines.push(format!("user: {}", quote(user)?));
    }
    if let Some(password) = &init.root_password {
        lines.push(format!("password: {}", quote(password)?));
        lines.push("ssh_pwauth: true".to_string());
        lines.push("chpasswd:".to_string());
        lines.push("  expire: false".to_string());
    }
    if !init.ssh_authorized_keys.is_empty() {
        lines.push("ssh_authorized_keys:".to_string());
        for key in &init.ssh_authorized_keys {
            lines.push(format!("  - {}", quote(key)?));
        }
    }
    if init.regenerate_ssh_keys {
        lines.push("ssh_deletekeys: true".to_string());
    }
    if let Some(tz) = &init.timezone {
        lines.push(format!("timezone: {}", quote(tz)?));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    if let Some(script) = &init.custom_script {
        out.push_str(script);
        if !script.ends_with('\n') {
            out.push('\n');
        }
    }

    Ok(out.into_bytes())
}

fn network_data(init: &VmInit) -> Result<Option<Value>, GenerationError> {
    if init.network_interfaces.is_empty() && init.dns_servers.is_empty() {
        return Ok(None);
    }

    let mut links = Vec::new();
    let mut networks = Vec::new();
    for nic in &init.network_interfaces {
        links.push(json!({
            "id": nic.name,
            "name": nic.name,
            "type": "vif",
        }));
        if let Some(network) = network_entry(nic)? {
            networks.push(network);
        }
    }

    let mut services: Vec<Value> = init
        .dns_servers
        .iter()
        .map(|addr| json!({ "type": "dns", "address": addr }))
        .collect();
    if !init.dns_search.is_empty() {
        services.push(json!({ "type": "dns", "search": init.dns_search }));
    }

    Ok(Some(json!({
        "links": links,
        "networks": networks,
        "services": services,
    })))
}

fn network_entry(
    nic: &InitNetworkInterface,
) -> Result<Option<Value>, GenerationError> {
    let mut entry = json!({
        "id": nic.name,
        "link": nic.name,
    });

    match nic.boot_protocol {
        BootProtocol::None => return Ok(None),
        BootProtocol::Dhcp => entry["type"] = "ipv4_dhcp".into(),
        BootProtocol::Static => {
            let Some(address) = nic.address else {
                return Err(GenerationError::Invalid(format!(
                    "interface {} uses static addressing but has no address",
                    nic.name
                )));
            };

            entry["type"] = match address {
                IpAddr::V4(_) => "ipv4",
                IpAddr::V6(_) => "ipv6",
            }
            .into();
            entry["ip_address"] = json!(address);
            if let Some(netmask) = &nic.netmask {
                entry["netmask"] = json!(netmask);
            }
            if let Some(gateway) = nic.gateway {
                entry["gateway"] = json!(gateway);
            }
        }
    }

    if !nic.on_boot {
        entry["on_boot"] = false.into();
    }

    Ok(Some(entry))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::vm::CpuTopology;
    use uuid::Uuid;

    fn vm() -> VmSpec {
        VmSpec::new(Uuid::from_u128(42), "web-1", CpuTopology::new(1, 1, 1))
    }

    fn json_file(content: &PayloadContent, path: &str) -> Value {
        serde_json::from_slice(content.get(path).unwrap()).unwrap()
    }

    #[test]
    fn nothing_configured_yields_empty_mapping() {
        let content =
            ConfigDriveCloudInit.generate(&vm(), &VmInit::default()).unwrap();
        assert!(content.is_empty());
    }

    #[test]
    fn hostname_and_keys_land_in_metadata() {
        let init = VmInit {
            hostname: Some("web-1.example.com".to_string()),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAA a@b".to_string()],
            ..Default::default()
        };

        let content = ConfigDriveCloudInit.generate(&vm(), &init).unwrap();
        assert!(content.get(NETWORK_DATA_PATH).is_none());

        let meta = json_file(&content, META_DATA_PATH);
        assert_eq!(meta["hostname"], "web-1.example.com");
        assert_eq!(meta["uuid"], Uuid::from_u128(42).to_string());
        assert_eq!(meta["public_keys"]["0"], "ssh-ed25519 AAAA a@b");

        let user = String::from_utf8(
            content.get(USER_DATA_PATH).unwrap().to_vec(),
        )
        .unwrap();
        assert!(user.starts_with("#cloud-config\n"));
        assert!(user.contains("  - \"ssh-ed25519 AAAA a@b\"\n"));
    }

    #[test]
    fn custom_script_is_appended() {
        let init = VmInit {
            root_password: Some("pw\"1".to_string()),
            custom_script: Some("runcmd:\n  - [touch, /ok]".to_string()),
            ..Default::default()
        };

        let content = ConfigDriveCloudInit.generate(&vm(), &init).unwrap();
        let user = std::str::from_utf8(content.get(USER_DATA_PATH).unwrap())
            .unwrap()
            .to_string();
        assert!(user.contains("password: \"pw\\\"1\"\n"));
        assert!(user.ends_with("runcmd:\n  - [touch, /ok]\n"));
    }

    #[test]
    fn static_interfaces_need_an_address() {
        let init = VmInit {
            network_interfaces: vec![InitNetworkInterface {
                name: "eth0".to_string(),
                boot_protocol: BootProtocol::Static,
                address: None,
                netmask: None,
                gateway: None,
                on_boot: true,
            }],
            ..Default::default()
        };

        assert!(matches!(
            ConfigDriveCloudInit.generate(&vm(), &init),
            Err(GenerationError::Invalid(_))
        ));
    }

    #[test]
    fn network_data_describes_interfaces_and_dns() {
        let init = VmInit {
            dns_servers: vec!["10.0.0.53".parse().unwrap()],
            dns_search: vec!["example.com".to_string()],
            network_interfaces: vec![
                InitNetworkInterface {
                    name: "eth0".to_string(),
                    boot_protocol: BootProtocol::Static,
                    address: Some("10.0.0.10".parse().unwrap()),
                    netmask: Some("255.255.255.0".to_string()),
                    gateway: Some("10.0.0.1".parse().unwrap()),
                    on_boot: true,
                },
                InitNetworkInterface {
                    name: "eth1".to_string(),
                    boot_protocol: BootProtocol::Dhcp,
                    address: None,
                    netmask: None,
                    gateway: None,
                    on_boot: false,
                },
            ],
            ..Default::default()
        };

        let content = ConfigDriveCloudInit.generate(&vm(), &init).unwrap();
        let net = json_file(&content, NETWORK_DATA_PATH);
        assert_eq!(net["links"].as_array().unwrap().len(), 2);
        assert_eq!(net["networks"][0]["type"], "ipv4");
        assert_eq!(net["networks"][0]["ip_address"], "10.0.0.10");
        assert_eq!(net["networks"][1]["type"], "ipv4_dhcp");
        assert_eq!(net["networks"][1]["on_boot"], false);
        assert_eq!(net["services"][0]["address"], "10.0.0.53");
        assert_eq!(net["services"][1]["search"][0], "example.com");
    }

    #[test]
    fn generation_is_deterministic() {
        let init = VmInit {
            hostname: Some("h".to_string()),
            user_name: Some("admin".to_string()),
            timezone: Some("Etc/UTC".to_string()),
            ..Default::default()
        };
        let a = ConfigDriveCloudInit.generate(&vm(), &init).unwrap();
        let b = ConfigDriveCloudInit.generate(&vm(), &init).unwrap();
        assert_eq!(a, b);
    }
}
