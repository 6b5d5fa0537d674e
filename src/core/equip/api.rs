//! Compute-provider boundary.
//!
//! The orchestration core only needs this narrow, synchronous capability set
//! from a provider; the shipped adapters drive the `openstack` and `virsh`
//! command-line clients, and tests substitute an in-memory fake.

use crate::error::Result;
use std::collections::BTreeMap;

/// Parameters for one provisioning request.
#[derive(Debug, Clone, Default)]
pub struct ServerParams {
    pub name: String,
    pub image: String,
    pub flavor: String,
    pub key_name: String,
    pub network: Option<String>,
    pub user_data: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Pending,
    Active,
    /// Terminal failure; carries the provider fault message when available.
    Error(Option<String>),
}

#[derive(Debug, Clone)]
pub struct AddressRecord {
    pub addr: String,
    pub version: u8,
}

#[derive(Debug, Clone)]
pub struct FloatingIp {
    pub id: String,
    pub address: String,
}

pub trait ComputeApi {
    /// Submit a provisioning request; returns the provider-assigned id.
    fn create_server(&self, params: &ServerParams) -> Result<String>;

    fn server_status(&self, id: &str) -> Result<ServerStatus>;

    /// Current name of the server, for rename verification.
    fn server_name(&self, id: &str) -> Result<String>;

    /// Mapping of network name to attached address records.
    fn server_addresses(&self, id: &str) -> Result<BTreeMap<String, Vec<AddressRecord>>>;

    fn rename_server(&self, id: &str, name: &str) -> Result<()>;

    /// Names of all instances currently known to the provider.
    fn list_server_names(&self) -> Result<Vec<String>>;

    fn delete_server(&self, id: &str) -> Result<()>;

    fn create_floating_ip(&self, network: &str, server_id: &str, fixed: &str)
        -> Result<FloatingIp>;

    fn delete_floating_ip(&self, id: &str) -> Result<()>;
}
