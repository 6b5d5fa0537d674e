//! Libvirt adapter driving `virsh` and `virt-clone`.
//!
//! A node is cloned from a base image domain and addressed by UUID from then
//! on, so renaming never invalidates the stored identifier. Floating
//! addresses have no libvirt equivalent; asking for one is a configuration
//! error.

use super::api::{AddressRecord, ComputeApi, FloatingIp, ServerParams, ServerStatus};
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::process::Command;

pub struct VirshCli {
    uri: Option<String>,
}

impl VirshCli {
    pub fn new(uri: Option<String>) -> Self {
        VirshCli { uri }
    }

    fn virsh(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.uri {
            cmd.arg("-c").arg(uri);
        }
        cmd.args(args);

        let output = cmd
            .output()
            .map_err(|e| Error::Equipment(format!("Failed to run virsh: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Equipment(format!(
                "virsh {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl ComputeApi for VirshCli {
    fn create_server(&self, params: &ServerParams) -> Result<String> {
        let mut clone = Command::new("virt-clone");
        if let Some(uri) = &self.uri {
            clone.arg("--connect").arg(uri);
        }
        clone.args([
            "--original",
            &params.image,
            "--name",
            &params.name,
            "--auto-clone",
        ]);

        let output = clone
            .output()
            .map_err(|e| Error::Equipment(format!("Failed to run virt-clone: {}", e)))?;
        if !output.status.success() {
            return Err(Error::Equipment(format!(
                "virt-clone from '{}' failed: {}",
                params.image,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        self.virsh(&["start", &params.name])?;
        let uuid = self.virsh(&["domuuid", &params.name])?;
        Ok(uuid.trim().to_string())
    }

    fn server_status(&self, id: &str) -> Result<ServerStatus> {
        let state = self.virsh(&["domstate", id])?;
        match state.trim() {
            "running" => Ok(ServerStatus::Active),
            "crashed" => Ok(ServerStatus::Error(Some("domain crashed".to_string()))),
            _ => Ok(ServerStatus::Pending),
        }
    }

    fn server_name(&self, id: &str) -> Result<String> {
        Ok(self.virsh(&["domname", id])?.trim().to_string())
    }

    fn server_addresses(&self, id: &str) -> Result<BTreeMap<String, Vec<AddressRecord>>> {
        let table = self.virsh(&["domifaddr", id, "--source", "lease"])?;
        let mut result: BTreeMap<String, Vec<AddressRecord>> = BTreeMap::new();

        // Table rows: Name, MAC address, Protocol, Address/Prefix
        for line in table.lines().skip(2) {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() < 4 {
                continue;
            }
            let version = match columns[2] {
                "ipv4" => 4,
                "ipv6" => 6,
                _ => continue,
            };
            let addr = columns[3].split('/').next().unwrap_or("").to_string();
            if addr.is_empty() {
                continue;
            }
            result
                .entry(columns[0].to_string())
                .or_default()
                .push(AddressRecord { addr, version });
        }
        Ok(result)
    }

    fn rename_server(&self, id: &str, name: &str) -> Result<()> {
        self.virsh(&["domrename", id, name])?;
        Ok(())
    }

    fn list_server_names(&self) -> Result<Vec<String>> {
        let output = self.virsh(&["list", "--all", "--name"])?;
        Ok(output
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }

    fn delete_server(&self, id: &str) -> Result<()> {
        // A domain that is already off fails destroy; undefine still runs.
        if let Err(e) = self.virsh(&["destroy", id]) {
            log_warn!("libvirt", "{}", e);
        }
        self.virsh(&["undefine", id, "--remove-all-storage"])?;
        Ok(())
    }

    fn create_floating_ip(
        &self,
        _network: &str,
        _server_id: &str,
        _fixed: &str,
    ) -> Result<FloatingIp> {
        Err(Error::Config(
            "libvirt equipment does not support floating addresses".to_string(),
        ))
    }

    fn delete_floating_ip(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}
