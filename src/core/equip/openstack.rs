//! OpenStack adapter driving the `openstack` CLI client.
//!
//! Every call shells out with `-f json` and parses the result, the same way
//! the rest of the tool drives `ssh`. Credentials come from the standard
//! clouds.yaml mechanism via `--os-cloud`.

use super::api::{AddressRecord, ComputeApi, FloatingIp, ServerParams, ServerStatus};
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::process::Command;

pub struct OpenStackCli {
    cloud: Option<String>,
    debug: bool,
}

impl OpenStackCli {
    pub fn new(cloud: Option<String>, debug: bool) -> Self {
        OpenStackCli { cloud, debug }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("openstack");
        if let Some(cloud) = &self.cloud {
            cmd.arg("--os-cloud").arg(cloud);
        }
        cmd.args(args);

        if self.debug {
            log_status!("openstack", "openstack {}", args.join(" "));
        }

        let output = cmd
            .output()
            .map_err(|e| Error::Equipment(format!("Failed to run openstack client: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Equipment(format!(
                "openstack {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_json(&self, args: &[&str]) -> Result<Value> {
        let stdout = self.run(args)?;
        serde_json::from_str(&stdout)
            .map_err(|e| Error::Equipment(format!("Unexpected openstack client output: {}", e)))
    }

    fn show(&self, id: &str) -> Result<Value> {
        self.run_json(&["server", "show", id, "-f", "json"])
    }
}

impl ComputeApi for OpenStackCli {
    fn create_server(&self, params: &ServerParams) -> Result<String> {
        let mut args: Vec<String> = vec![
            "server".into(),
            "create".into(),
            "--image".into(),
            params.image.clone(),
            "--flavor".into(),
            params.flavor.clone(),
            "--key-name".into(),
            params.key_name.clone(),
            "-f".into(),
            "json".into(),
        ];

        if let Some(network) = &params.network {
            args.push("--network".into());
            args.push(network.clone());
        }

        // The client only takes user data as a file.
        let mut userdata_file = None;
        if let Some(user_data) = &params.user_data {
            let path = std::env::temp_dir().join(format!("rigger-userdata-{}", std::process::id()));
            std::fs::write(&path, user_data)?;
            args.push("--user-data".into());
            args.push(path.display().to_string());
            userdata_file = Some(path);
        }

        args.push(params.name.clone());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let result = self.run_json(&arg_refs);

        if let Some(path) = userdata_file {
            let _ = std::fs::remove_file(path);
        }

        let value = result?;
        value
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Equipment("Server create returned no id".to_string()))
    }

    fn server_status(&self, id: &str) -> Result<ServerStatus> {
        let server = self.show(id)?;
        let status = server.get("status").and_then(|v| v.as_str()).unwrap_or("");
        match status {
            "ACTIVE" => Ok(ServerStatus::Active),
            "ERROR" => {
                let message = server
                    .get("fault")
                    .and_then(|f| f.get("message"))
                    .and_then(|m| m.as_str())
                    .map(|m| m.to_string());
                Ok(ServerStatus::Error(message))
            }
            _ => Ok(ServerStatus::Pending),
        }
    }

    fn server_name(&self, id: &str) -> Result<String> {
        let server = self.show(id)?;
        server
            .get("name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::Equipment(format!("Server {} has no name", id)))
    }

    fn server_addresses(&self, id: &str) -> Result<BTreeMap<String, Vec<AddressRecord>>> {
        let server = self.show(id)?;
        let mut result = BTreeMap::new();

        // `server show -f json` renders addresses as network -> list of
        // address strings.
        if let Some(Value::Object(networks)) = server.get("addresses") {
            for (network, addrs) in networks {
                let records = match addrs {
                    Value::Array(list) => list
                        .iter()
                        .filter_map(|a| a.as_str())
                        .map(|addr| AddressRecord {
                            addr: addr.to_string(),
                            version: if addr.contains(':') { 6 } else { 4 },
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                result.insert(network.clone(), records);
            }
        }
        Ok(result)
    }

    fn rename_server(&self, id: &str, name: &str) -> Result<()> {
        self.run(&["server", "set", "--name", name, id])?;
        Ok(())
    }

    fn list_server_names(&self) -> Result<Vec<String>> {
        let list = self.run_json(&["server", "list", "-f", "json"])?;
        let names = list
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("Name"))
                    .filter_map(|n| n.as_str())
                    .map(|n| n.to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(names)
    }

    fn delete_server(&self, id: &str) -> Result<()> {
        self.run(&["server", "delete", id])?;
        Ok(())
    }

    fn create_floating_ip(&self, network: &str, server_id: &str, fixed: &str) -> Result<FloatingIp> {
        let fip = self.run_json(&["floating", "ip", "create", network, "-f", "json"])?;
        let id = fip
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Equipment("Floating ip create returned no id".to_string()))?
            .to_string();
        let address = fip
            .get("floating_ip_address")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Equipment("Floating ip create returned no address".to_string()))?
            .to_string();

        self.run(&[
            "server",
            "add",
            "floating",
            "ip",
            "--fixed-ip-address",
            fixed,
            server_id,
            &address,
        ])?;

        Ok(FloatingIp { id, address })
    }

    fn delete_floating_ip(&self, id: &str) -> Result<()> {
        self.run(&["floating", "ip", "delete", id])?;
        Ok(())
    }
}
