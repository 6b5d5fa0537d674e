//! Equipment: the create/delete lifecycle of one compute node.
//!
//! Every equipment kind follows the same canonical create shape (resolve
//! mandatory fields, submit, allocate a name when the configured name is a
//! template, poll until active, wire up addresses), driven through the
//! [`api::ComputeApi`] boundary. The kind only decides which adapter
//! backs the API and which fields are mandatory.

pub mod api;
pub mod libvirt;
pub mod openstack;

use crate::error::{Error, Result};
use crate::interrupt;
use crate::lock::NamedLock;
use crate::spec::{is_present_block, EQUIPMENT_KEYWORDS};
use crate::state::{NodeRecord, NodeSlot, RunState};
use api::{ComputeApi, ServerParams, ServerStatus};
use regex::Regex;
use serde_json::{json, Value};
use std::time::{Duration, Instant};

/// Closed set of supported equipment kinds. The declaration order matches
/// the keyword precedence in [`EQUIPMENT_KEYWORDS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquipmentKind {
    Libvirt,
    OpenStack,
}

impl EquipmentKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            EquipmentKind::Libvirt => "libvirt",
            EquipmentKind::OpenStack => "openstack",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<EquipmentKind> {
        match keyword {
            "libvirt" => Some(EquipmentKind::Libvirt),
            "openstack" => Some(EquipmentKind::OpenStack),
            _ => None,
        }
    }

    /// First equipment keyword present with a non-empty value in a node
    /// entry, per the fixed precedence list.
    pub fn resolve(entry: &Value) -> Option<EquipmentKind> {
        EQUIPMENT_KEYWORDS
            .iter()
            .find(|k| is_present_block(entry.get(**k)))
            .and_then(|k| EquipmentKind::from_keyword(k))
    }

    fn mandatory_fields(&self) -> &'static [&'static str] {
        match self {
            EquipmentKind::Libvirt => &["name", "image"],
            EquipmentKind::OpenStack => &["name", "image", "flavor", "keyname"],
        }
    }
}

/// Sleep and retry bounds for the create path. Tests run with zeros.
#[derive(Debug, Clone)]
pub struct CreateTiming {
    pub grace_wait: Duration,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub rename_tries: u32,
    pub rename_wait: Duration,
    pub lock_timeout: Duration,
    pub lock_wait: Duration,
}

impl Default for CreateTiming {
    fn default() -> Self {
        CreateTiming {
            grace_wait: Duration::from_secs(5),
            poll_interval: Duration::from_secs(10),
            poll_timeout: Duration::from_secs(8 * 60),
            rename_tries: 20,
            rename_wait: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(5 * 60),
            lock_wait: Duration::from_secs(2),
        }
    }
}

impl CreateTiming {
    #[cfg(test)]
    pub fn immediate() -> Self {
        CreateTiming {
            grace_wait: Duration::ZERO,
            poll_interval: Duration::ZERO,
            poll_timeout: Duration::from_secs(2),
            rename_tries: 3,
            rename_wait: Duration::ZERO,
            lock_timeout: Duration::from_millis(200),
            lock_wait: Duration::from_millis(10),
        }
    }
}

/// A node-name template in the `target%02d` style. A name without an index
/// placeholder is a literal and never triggers renaming.
#[derive(Debug, Clone)]
pub struct NameTemplate {
    raw: String,
    placeholder: Option<Placeholder>,
}

/// One printf-style index placeholder: the matched token, the field width
/// and whether the `0` flag was given.
#[derive(Debug, Clone)]
struct Placeholder {
    token: String,
    width: usize,
    zero_pad: bool,
}

impl NameTemplate {
    pub fn parse(raw: &str) -> NameTemplate {
        // Placeholder syntax follows printf: %d, %02d, %3d.
        let re = Regex::new(r"%(0?)(\d*)d").expect("valid placeholder regex");
        let placeholder = re.captures(raw).map(|caps| Placeholder {
            token: caps.get(0).expect("whole match").as_str().to_string(),
            width: caps.get(2).map_or(0, |w| w.as_str().parse().unwrap_or(0)),
            zero_pad: caps.get(1).is_some_and(|f| !f.as_str().is_empty()),
        });
        NameTemplate {
            raw: raw.to_string(),
            placeholder,
        }
    }

    pub fn is_templated(&self) -> bool {
        self.placeholder.is_some()
    }

    /// Name at a numeric index; a literal template ignores the index.
    /// Padding matches printf: `%02d` zero-pads, `%3d` space-pads.
    pub fn render(&self, index: u32) -> String {
        match &self.placeholder {
            Some(p) => {
                let rendered = if p.zero_pad {
                    format!("{:0width$}", index, width = p.width)
                } else {
                    format!("{:width$}", index, width = p.width)
                };
                self.raw.replacen(p.token.as_str(), &rendered, 1)
            }
            None => self.raw.clone(),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// One equipment instance, bound at construction to exactly one node-record
/// slot and one resolved node spec.
pub struct Equipment {
    pub kind: EquipmentKind,
    pub slot: NodeSlot,
    /// The resolved equipment block for this kind.
    pub spec: Value,
}

impl Equipment {
    pub fn new(kind: EquipmentKind, slot: NodeSlot, spec: Value) -> Self {
        Equipment { kind, slot, spec }
    }

    /// Build the provider adapter for this kind.
    pub fn connect_api(&self, debug: bool) -> Result<Box<dyn ComputeApi>> {
        match self.kind {
            EquipmentKind::OpenStack => Ok(Box::new(openstack::OpenStackCli::new(
                self.field("cloud"),
                debug,
            ))),
            EquipmentKind::Libvirt => Ok(Box::new(libvirt::VirshCli::new(self.field("uri")))),
        }
    }

    fn field(&self, key: &str) -> Option<String> {
        self.spec
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.field(key).ok_or_else(|| {
            Error::Config(format!(
                "{} field '{}' is not specified",
                self.kind.keyword(),
                key
            ))
        })
    }

    /// Create this node, populating its bound node record as provisioning
    /// progresses. The provider id lands in the record immediately after
    /// submission so a crash after that point is recoverable by the delete
    /// path.
    pub fn create(
        &self,
        api: &dyn ComputeApi,
        state: &mut RunState,
        timing: &CreateTiming,
    ) -> Result<()> {
        for field in self.kind.mandatory_fields() {
            self.required(field)?;
        }

        let username = self.field("username").unwrap_or_else(|| "root".to_string());
        let keyfile = self
            .field("keyfile")
            .unwrap_or_else(|| "~/.ssh/id_rsa".to_string());
        state.update(
            self.slot,
            &[("username", json!(username)), ("keyfile", json!(keyfile))],
        )?;

        let template = NameTemplate::parse(&self.required("name")?);
        let initial_name = if template.is_templated() {
            // Transient name until allocation picks a free indexed one.
            "rigger".to_string()
        } else {
            template.raw().to_string()
        };
        state.update(self.slot, &[("name", json!(initial_name))])?;

        let params = ServerParams {
            name: initial_name,
            image: self.required("image")?,
            flavor: self.field("flavor").unwrap_or_default(),
            key_name: self.field("keyname").unwrap_or_default(),
            network: self.field("network"),
            user_data: self.read_user_data()?,
        };

        let id = api.create_server(&params)?;
        log_status!("equip", "Created server: {}", id);
        state.update(self.slot, &[("id", json!(id))])?;

        if template.is_templated() {
            // Renaming a very fresh instance is flaky on some providers.
            log_status!("equip", "Graceful wait {:?} before rename...", timing.grace_wait);
            std::thread::sleep(timing.grace_wait);
            let name = self.allocate_name(api, &id, &template, timing)?;
            state.update(self.slot, &[("name", json!(name))])?;
        }

        self.wait_active(api, &id, timing)?;

        let ipv4 = first_ipv4(api, &id)?;
        log_status!("equip", "Server address: {}", ipv4);

        let mut public_ip = ipv4.clone();
        if let Some(floating_net) = self.field("floating") {
            let fip = api.create_floating_ip(&floating_net, &id, &ipv4)?;
            state.update(self.slot, &[("fip_id", json!(fip.id))])?;
            public_ip = fip.address;
        }

        let final_name = api.server_name(&id)?;
        state.update(
            self.slot,
            &[("ip", json!(public_ip)), ("name", json!(final_name))],
        )?;
        Ok(())
    }

    /// Scan candidate names at increasing indices against the provider's
    /// current inventory, pick the first unused one and rename the instance
    /// to it. Runs under an exclusive host-scoped lock keyed by the template
    /// so concurrent runners serialize instead of grabbing the same index.
    fn allocate_name(
        &self,
        api: &dyn ComputeApi,
        id: &str,
        template: &NameTemplate,
        timing: &CreateTiming,
    ) -> Result<String> {
        let _lock =
            NamedLock::acquire_with_timeout(template.raw(), timing.lock_timeout, timing.lock_wait)?;

        log_status!("equip", "Update name for server {}", id);
        let existing = api.list_server_names()?;

        for index in 0..99 {
            let target = template.render(index);
            if existing.iter().any(|n| n == &target) {
                continue;
            }

            log_status!("equip", "Setting server name to {}", target);
            // Provider naming is eventually consistent; verify after each
            // attempt instead of trusting the rename call.
            for tries_left in (0..timing.rename_tries).rev() {
                api.rename_server(id, &target)?;
                std::thread::sleep(timing.rename_wait);
                let current = api.server_name(id)?;
                if current == target {
                    return Ok(target);
                }
                log_status!(
                    "equip",
                    "Server name is '{}', should be '{}' ({} tries left)",
                    current,
                    target,
                    tries_left
                );
            }
            return Err(Error::NameAllocation(format!(
                "Cannot set name to '{}' for server '{}'",
                target, id
            )));
        }

        Err(Error::NameAllocation(format!(
            "No free name for template '{}'",
            template.raw()
        )))
    }

    /// Poll provider status until active, erroring on a terminal status or
    /// when the bounded total timeout elapses.
    fn wait_active(&self, api: &dyn ComputeApi, id: &str, timing: &CreateTiming) -> Result<()> {
        let start = Instant::now();
        loop {
            interrupt::check()?;
            match api.server_status(id)? {
                ServerStatus::Active => return Ok(()),
                ServerStatus::Error(Some(message)) => {
                    return Err(Error::Equipment(format!(
                        "Server creation unexpectedly failed with message: {}",
                        message
                    )))
                }
                ServerStatus::Error(None) => {
                    return Err(Error::Equipment(format!(
                        "Unknown failure while creating server {}",
                        id
                    )))
                }
                ServerStatus::Pending => {}
            }
            if start.elapsed() >= timing.poll_timeout {
                return Err(Error::Equipment(format!(
                    "Timeout waiting for server {} to become active",
                    id
                )));
            }
            log_status!(
                "equip",
                "Server {} is not active. Waiting {:?}...",
                id,
                timing.poll_interval
            );
            std::thread::sleep(timing.poll_interval);
        }
    }

    /// Best-effort teardown: failures are logged as warnings and never
    /// propagated. A recorded floating IP is released afterward regardless
    /// of whether the instance delete succeeded.
    pub fn delete(&self, api: &dyn ComputeApi, state: &RunState) {
        let Ok(record) = state.node(self.slot) else {
            log_warn!("equip", "No node record for slot {:?}", self.slot);
            return;
        };
        if record_field(record, "id").is_none() {
            log_warn!("equip", "No server id recorded for slot {:?}", self.slot);
        }
        delete_record(api, record);
    }

    fn read_user_data(&self) -> Result<Option<String>> {
        let Some(path) = self.field("userdata") else {
            return Ok(None);
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("Cannot read userdata file '{}': {}", path, e)))?;
        Ok(Some(content))
    }
}

/// Best-effort deletion of the server and floating IP named by one flat
/// node record. Shared by slot-bound deletion and the legacy single-server
/// record of state files written by older runs.
pub fn delete_record(api: &dyn ComputeApi, record: &NodeRecord) {
    if let Some(id) = record_field(record, "id") {
        log_status!("equip", "Delete server with id '{}'", id);
        if let Err(e) = api.delete_server(&id) {
            log_warn!("equip", "{}", e);
        }
    }

    if let Some(fip_id) = record_field(record, "fip_id") {
        if let Err(e) = api.delete_floating_ip(&fip_id) {
            log_warn!("equip", "{}", e);
        }
    }
}

/// String field of a flat record, when present and non-empty.
fn record_field(record: &NodeRecord, key: &str) -> Option<String> {
    record
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

/// First IPv4 entry found across the attached networks.
fn first_ipv4(api: &dyn ComputeApi, id: &str) -> Result<String> {
    let addresses = api.server_addresses(id)?;
    for records in addresses.values() {
        for record in records {
            if record.version == 4 {
                return Ok(record.addr.clone());
            }
        }
    }
    Err(Error::Equipment(format!(
        "Server {} has no IPv4 address",
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::{AddressRecord, FloatingIp};
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct FakeServer {
        name: String,
        status_script: Vec<ServerStatus>,
        addresses: BTreeMap<String, Vec<AddressRecord>>,
        deleted: bool,
    }

    #[derive(Default)]
    struct FakeApi {
        servers: RefCell<BTreeMap<String, FakeServer>>,
        taken_names: Vec<String>,
        next_id: RefCell<u32>,
        rename_failures: RefCell<u32>,
        deleted_fips: RefCell<Vec<String>>,
        fail_delete: bool,
    }

    impl FakeApi {
        fn with_taken_names(names: &[&str]) -> Self {
            FakeApi {
                taken_names: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }
    }

    impl ComputeApi for FakeApi {
        fn create_server(&self, params: &ServerParams) -> Result<String> {
            let mut next = self.next_id.borrow_mut();
            *next += 1;
            let id = format!("srv-{}", *next);
            let mut addresses = BTreeMap::new();
            addresses.insert(
                "net0".to_string(),
                vec![
                    AddressRecord { addr: "fe80::1".to_string(), version: 6 },
                    AddressRecord { addr: "10.0.0.5".to_string(), version: 4 },
                ],
            );
            self.servers.borrow_mut().insert(
                id.clone(),
                FakeServer {
                    name: params.name.clone(),
                    status_script: vec![ServerStatus::Active, ServerStatus::Pending],
                    addresses,
                    deleted: false,
                },
            );
            Ok(id)
        }

        fn server_status(&self, id: &str) -> Result<ServerStatus> {
            let mut servers = self.servers.borrow_mut();
            let server = servers.get_mut(id).expect("known server");
            Ok(server
                .status_script
                .pop()
                .unwrap_or(ServerStatus::Active))
        }

        fn server_name(&self, id: &str) -> Result<String> {
            Ok(self.servers.borrow()[id].name.clone())
        }

        fn server_addresses(&self, id: &str) -> Result<BTreeMap<String, Vec<AddressRecord>>> {
            Ok(self.servers.borrow()[id].addresses.clone())
        }

        fn rename_server(&self, id: &str, name: &str) -> Result<()> {
            let mut failures = self.rename_failures.borrow_mut();
            if *failures > 0 {
                *failures -= 1;
                return Ok(()); // rename silently did not stick
            }
            self.servers.borrow_mut().get_mut(id).unwrap().name = name.to_string();
            Ok(())
        }

        fn list_server_names(&self) -> Result<Vec<String>> {
            Ok(self.taken_names.clone())
        }

        fn delete_server(&self, id: &str) -> Result<()> {
            if self.fail_delete {
                return Err(Error::Equipment("already gone".to_string()));
            }
            self.servers.borrow_mut().get_mut(id).unwrap().deleted = true;
            Ok(())
        }

        fn create_floating_ip(
            &self,
            _network: &str,
            _server_id: &str,
            fixed: &str,
        ) -> Result<FloatingIp> {
            assert_eq!(fixed, "10.0.0.5");
            Ok(FloatingIp { id: "fip-1".to_string(), address: "203.0.113.9".to_string() })
        }

        fn delete_floating_ip(&self, id: &str) -> Result<()> {
            self.deleted_fips.borrow_mut().push(id.to_string());
            Ok(())
        }
    }

    fn test_state() -> (tempfile::TempDir, RunState) {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RunState::init(
            &dir.path().join("state.json"),
            json!({}),
            Default::default(),
        );
        state.ensure_slots(&[1]).unwrap();
        (dir, state)
    }

    fn equipment(spec: Value) -> Equipment {
        Equipment::new(
            EquipmentKind::OpenStack,
            NodeSlot { routine: 0, node: 0 },
            spec,
        )
    }

    #[test]
    fn name_template_parsing() {
        let t = NameTemplate::parse("target%02d");
        assert!(t.is_templated());
        assert_eq!(t.render(0), "target00");
        assert_eq!(t.render(7), "target07");
        assert_eq!(t.render(42), "target42");

        let literal = NameTemplate::parse("ci-node");
        assert!(!literal.is_templated());
        assert_eq!(literal.render(5), "ci-node");

        let unpadded = NameTemplate::parse("n%d-x");
        assert_eq!(unpadded.render(3), "n3-x");
    }

    #[test]
    fn name_template_pads_like_printf() {
        let spaced = NameTemplate::parse("n%3d");
        assert_eq!(spaced.render(7), "n  7");
        assert_eq!(spaced.render(123), "n123");

        let zeroed = NameTemplate::parse("n%03d");
        assert_eq!(zeroed.render(7), "n007");
    }

    #[test]
    fn resolve_prefers_libvirt_over_openstack() {
        let entry = json!({"libvirt": {"image": "a"}, "openstack": {"image": "b"}});
        assert_eq!(EquipmentKind::resolve(&entry), Some(EquipmentKind::Libvirt));

        let entry = json!({"openstack": {"image": "b"}});
        assert_eq!(EquipmentKind::resolve(&entry), Some(EquipmentKind::OpenStack));

        let entry = json!({"libvirt": {}, "openstack": {"image": "b"}});
        assert_eq!(EquipmentKind::resolve(&entry), Some(EquipmentKind::OpenStack));

        assert_eq!(EquipmentKind::resolve(&json!({})), None);
    }

    #[test]
    fn create_with_literal_name_skips_allocation() {
        crate::interrupt::reset_for_tests();
        let api = FakeApi::default();
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({
            "name": "ci-target",
            "image": "leap",
            "flavor": "m1.small",
            "keyname": "ci",
        }));

        equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap();

        let slot = NodeSlot { routine: 0, node: 0 };
        assert_eq!(state.node_field(slot, "name").unwrap(), "ci-target");
        assert_eq!(state.node_field(slot, "ip").unwrap(), "10.0.0.5");
        assert!(state.node_field(slot, "id").is_some());
        assert_eq!(state.node_field(slot, "username").unwrap(), "root");
    }

    #[test]
    fn create_allocates_first_unused_templated_name() {
        crate::interrupt::reset_for_tests();
        let api = FakeApi::with_taken_names(&["target00", "target01"]);
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({
            "name": "target%02d",
            "image": "leap",
            "flavor": "m1.small",
            "keyname": "ci",
        }));

        equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap();

        let slot = NodeSlot { routine: 0, node: 0 };
        assert_eq!(state.node_field(slot, "name").unwrap(), "target02");
    }

    #[test]
    fn rename_retries_until_provider_catches_up() {
        crate::interrupt::reset_for_tests();
        let api = FakeApi::default();
        *api.rename_failures.borrow_mut() = 2;
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({
            "name": "target%02d",
            "image": "leap",
            "flavor": "m1.small",
            "keyname": "ci",
        }));

        equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap();

        let slot = NodeSlot { routine: 0, node: 0 };
        assert_eq!(state.node_field(slot, "name").unwrap(), "target00");
    }

    #[test]
    fn create_records_floating_ip() {
        crate::interrupt::reset_for_tests();
        let api = FakeApi::default();
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({
            "name": "ci-target",
            "image": "leap",
            "flavor": "m1.small",
            "keyname": "ci",
            "floating": "ext-net",
        }));

        equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap();

        let slot = NodeSlot { routine: 0, node: 0 };
        assert_eq!(state.node_field(slot, "fip_id").unwrap(), "fip-1");
        assert_eq!(state.node_field(slot, "ip").unwrap(), "203.0.113.9");
    }

    #[test]
    fn create_fails_fast_on_missing_mandatory_field() {
        let api = FakeApi::default();
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({"name": "ci-target", "image": "leap"}));

        let err = equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn delete_is_best_effort_and_releases_floating_ip() {
        let api = FakeApi { fail_delete: true, ..Default::default() };
        let (_dir, mut state) = test_state();
        let slot = NodeSlot { routine: 0, node: 0 };
        state
            .update(slot, &[("id", json!("srv-9")), ("fip_id", json!("fip-9"))])
            .unwrap();

        let equip = equipment(json!({}));
        equip.delete(&api, &state);

        assert_eq!(*api.deleted_fips.borrow(), vec!["fip-9".to_string()]);
    }

    #[test]
    fn delete_record_covers_unslotted_server_records() {
        let api = FakeApi::default();
        let id = api
            .create_server(&ServerParams {
                name: "legacy01".to_string(),
                image: "leap".to_string(),
                flavor: "m1.small".to_string(),
                key_name: "ci".to_string(),
                network: None,
                user_data: None,
            })
            .unwrap();

        let mut record = NodeRecord::new();
        record.insert("id".to_string(), json!(id));
        record.insert("fip_id".to_string(), json!("fip-legacy"));

        delete_record(&api, &record);

        assert!(api.servers.borrow()[&id].deleted);
        assert_eq!(*api.deleted_fips.borrow(), vec!["fip-legacy".to_string()]);
    }

    #[test]
    fn terminal_provider_status_aborts_with_message() {
        crate::interrupt::reset_for_tests();
        let api = FakeApi::default();
        let (_dir, mut state) = test_state();
        let equip = equipment(json!({
            "name": "ci-target",
            "image": "leap",
            "flavor": "m1.small",
            "keyname": "ci",
        }));

        equip
            .create(&api, &mut state, &CreateTiming::immediate())
            .unwrap();
        let id = state
            .node_field(NodeSlot { routine: 0, node: 0 }, "id")
            .unwrap();
        api.servers
            .borrow_mut()
            .get_mut(&id)
            .unwrap()
            .status_script = vec![ServerStatus::Error(Some("quota exceeded".to_string()))];

        let err = equip
            .wait_active(&api, &id, &CreateTiming::immediate())
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }
}
