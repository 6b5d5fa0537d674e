use clap::Args;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use rigger::equip::{CreateTiming, Equipment, EquipmentKind};
use rigger::log_warn;
use rigger::spec::Spec;
use rigger::state::{NodeSlot, RunState};
use rigger::transport::ssh::RemoteShell;
use rigger::workflow::{Planner, RoutinePlan};

pub mod create;
pub mod delete;
pub mod provision;
pub mod run;

pub type CmdResult<T> = rigger::Result<(T, i32)>;

/// Flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the run-state file
    #[arg(short = 's', long, default_value = ".rigger_state")]
    pub state_path: String,

    /// Debug mode: show provider command output and keep failed nodes around
    #[arg(short = 'd', long)]
    pub debug: bool,
}

/// Spec-override flags. Each maps to one field of the equipment block the
/// merged spec declares and falls back to the matching environment variable.
#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// Cloud profile passed to the provider CLI
    #[arg(long, env = "OS_CLOUD")]
    pub cloud: Option<String>,

    /// Overrides the node name or name template
    #[arg(short = 't', long, env = "TARGET_NAME")]
    pub target_name: Option<String>,

    /// Overrides the node image
    #[arg(long, env = "TARGET_IMAGE")]
    pub target_image: Option<String>,

    /// Overrides the node flavor
    #[arg(long, env = "TARGET_FLAVOR")]
    pub target_flavor: Option<String>,

    /// Overrides the provider keypair name
    #[arg(long, env = "TARGET_KEYNAME")]
    pub target_keyname: Option<String>,

    /// Overrides the private key used for node access
    #[arg(long, env = "TARGET_KEYFILE")]
    pub target_keyfile: Option<String>,

    /// Overrides the network to attach
    #[arg(long, env = "TARGET_NETWORK")]
    pub target_network: Option<String>,

    /// Overrides the network a floating address is allocated from
    #[arg(long, env = "TARGET_FLOATING")]
    pub target_floating: Option<String>,
}

impl TargetArgs {
    /// Build a spec patch carrying the overrides, keyed under the equipment
    /// kind the merged spec declares (openstack when none is declared yet).
    pub fn patch(&self, spec: &Spec) -> Value {
        let kind = spec.top_equipment_kind().unwrap_or("openstack");
        let mut block = Map::new();
        put(&mut block, "cloud", &self.cloud);
        put(&mut block, "name", &self.target_name);
        put(&mut block, "image", &self.target_image);
        put(&mut block, "flavor", &self.target_flavor);
        put(&mut block, "keyname", &self.target_keyname);
        put(&mut block, "keyfile", &self.target_keyfile);
        put(&mut block, "network", &self.target_network);
        put(&mut block, "floating", &self.target_floating);
        json!({ kind: block })
    }
}

fn put(block: &mut Map<String, Value>, key: &str, value: &Option<String>) {
    if let Some(value) = value {
        if !value.is_empty() {
            block.insert(key.to_string(), json!(value));
        }
    }
}

/// One provisioned node as reported to the caller.
#[derive(Debug, Serialize)]
pub struct NodeSummary {
    pub routine: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Reconstructed access command for kept nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh: Option<String>,
}

pub(crate) fn load_spec(path: Option<&str>, target: &TargetArgs) -> rigger::Result<Spec> {
    let mut spec = Spec::load_layered(path.map(Path::new))?;
    let patch = target.patch(&spec);
    spec.apply_overrides(&patch);
    Ok(spec)
}

/// Parse repeated `-e key=value` flags, each possibly carrying a
/// comma-separated list of pairs.
pub(crate) fn parse_extra_vars(pairs: &[String]) -> rigger::Result<BTreeMap<String, String>> {
    let mut vars = BTreeMap::new();
    for raw in pairs {
        for item in raw.split(',').filter(|s| !s.trim().is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                rigger::Error::Config(format!(
                    "Invalid extra variable '{}', expected key=value",
                    item
                ))
            })?;
            vars.insert(key.trim().to_string(), value.to_string());
        }
    }
    Ok(vars)
}

/// Create every planned node in run order. On failure the already created
/// nodes are torn down again unless `keep_on_error`.
pub(crate) fn create_all(
    spec: &Spec,
    state: &mut RunState,
    debug: bool,
    keep_on_error: bool,
) -> rigger::Result<()> {
    let planner = Planner::new(spec);
    let equipment = planner.equipment(state)?;
    let timing = CreateTiming::default();

    for group in &equipment {
        for equip in group {
            let result = equip
                .connect_api(debug)
                .and_then(|api| equip.create(api.as_ref(), state, &timing));
            if let Err(e) = result {
                if !keep_on_error {
                    teardown(state, debug);
                }
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Best-effort deletion of every node the state file knows about. Returns
/// the names of the records that were submitted for deletion.
pub(crate) fn teardown(state: &mut RunState, debug: bool) -> Vec<String> {
    let spec = Spec::new(state.spec.clone());
    let planner = Planner::new(&spec);
    let mut deleted = Vec::new();

    match planner.equipment(state) {
        Ok(groups) => {
            for group in &groups {
                for equip in group {
                    let name = state.node_field(equip.slot, "name");
                    match equip.connect_api(debug) {
                        Ok(api) => {
                            equip.delete(api.as_ref(), state);
                            if let Some(name) = name {
                                deleted.push(name);
                            }
                        }
                        Err(e) => log_warn!("equip", "{}", e),
                    }
                }
            }
        }
        Err(e) => log_warn!("equip", "Cannot plan equipment for deletion: {}", e),
    }

    // State files written by older runs carry one flat `server` record with
    // no planner slot behind it.
    if state.server.get("id").and_then(|v| v.as_str()).is_some_and(|s| !s.is_empty()) {
        let kind = EquipmentKind::resolve(&state.spec).unwrap_or(EquipmentKind::OpenStack);
        let block = state.spec.get(kind.keyword()).cloned().unwrap_or_else(|| json!({}));
        let equip = Equipment::new(kind, NodeSlot { routine: 0, node: 0 }, block);
        match equip.connect_api(debug) {
            Ok(api) => {
                rigger::equip::delete_record(api.as_ref(), &state.server);
                let label = state
                    .server
                    .get("name")
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .unwrap_or("server");
                deleted.push(label.to_string());
            }
            Err(e) => log_warn!("equip", "{}", e),
        }
    }
    deleted
}

/// Build the SSH transport for one node record.
pub(crate) fn node_transport(
    state: &RunState,
    slot: NodeSlot,
) -> rigger::Result<(RemoteShell, String)> {
    let ip = state.node_field(slot, "ip").ok_or_else(|| {
        rigger::Error::State(format!(
            "Node {}/{} has no address in the state file",
            slot.routine, slot.node
        ))
    })?;
    let username = state
        .node_field(slot, "username")
        .unwrap_or_else(|| "root".to_string());
    let keyfile = state.node_field(slot, "keyfile");
    let shell = RemoteShell::new(&ip, &username, keyfile.as_deref());
    Ok((shell, username))
}

pub(crate) fn node_summaries(state: &RunState, plans: &[RoutinePlan]) -> Vec<NodeSummary> {
    let mut summaries = Vec::new();
    for (routine, records) in state.nodes.iter().enumerate() {
        let routine_name = plans
            .get(routine)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| routine.to_string());
        for node in 0..records.len() {
            let slot = NodeSlot { routine, node };
            let username = state
                .node_field(slot, "username")
                .unwrap_or_else(|| "root".to_string());
            let ip = state.node_field(slot, "ip");
            let ssh = ip.as_ref().map(|ip| match state.node_field(slot, "keyfile") {
                Some(keyfile) => format!("ssh -i {} {}@{}", keyfile, username, ip),
                None => format!("ssh {}@{}", username, ip),
            });
            summaries.push(NodeSummary {
                routine: routine_name.clone(),
                name: state.node_field(slot, "name"),
                id: state.node_field(slot, "id"),
                ip,
                ssh,
            });
        }
    }
    summaries
}

/// Reconstructed connection commands for kept nodes, one line per node
/// with a recorded address.
pub(crate) fn access_hints(nodes: &[NodeSummary]) -> Vec<String> {
    nodes
        .iter()
        .filter_map(|n| n.ssh.as_ref().map(|ssh| format!("{}: {}", n.routine, ssh)))
        .collect()
}

/// Dispatch a command to its handler and map the result to JSON.
macro_rules! dispatch {
    ($args:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args))
    };
}

pub(crate) fn run_json(command: crate::Commands) -> (rigger::Result<serde_json::Value>, i32) {
    match command {
        crate::Commands::Create(args) => dispatch!(args, create),
        crate::Commands::Delete(args) => dispatch!(args, delete),
        crate::Commands::Provision(args) => dispatch!(args, provision),
        crate::Commands::Run(args) => dispatch!(args, run),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extra_vars_accept_repeats_and_lists() {
        let vars = parse_extra_vars(&[
            "a=1".to_string(),
            "b=2,c=x=y".to_string(),
        ])
        .unwrap();
        assert_eq!(vars.get("a").unwrap(), "1");
        assert_eq!(vars.get("b").unwrap(), "2");
        assert_eq!(vars.get("c").unwrap(), "x=y");
    }

    #[test]
    fn extra_vars_without_equals_are_rejected() {
        assert!(parse_extra_vars(&["broken".to_string()]).is_err());
    }

    #[test]
    fn teardown_deletes_legacy_server_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            serde_json::to_string(&json!({
                "server": {"id": "srv-legacy", "name": "legacy01", "fip_id": "fip-legacy"},
                "nodes": [],
                "env": {},
                "spec": {"routines": {}},
            }))
            .unwrap(),
        )
        .unwrap();

        let mut state = RunState::load(&path).unwrap();
        let deleted = teardown(&mut state, false);
        assert_eq!(deleted, vec!["legacy01".to_string()]);
    }

    #[test]
    fn access_hints_reconstruct_ssh_commands() {
        let nodes = vec![
            NodeSummary {
                routine: "build".to_string(),
                name: Some("target00".to_string()),
                id: Some("srv-1".to_string()),
                ip: Some("10.0.0.7".to_string()),
                ssh: Some("ssh -i ~/.ssh/ci root@10.0.0.7".to_string()),
            },
            NodeSummary {
                routine: "test".to_string(),
                name: None,
                id: None,
                ip: None,
                ssh: None,
            },
        ];
        assert_eq!(
            access_hints(&nodes),
            vec!["build: ssh -i ~/.ssh/ci root@10.0.0.7".to_string()]
        );
    }

    #[test]
    fn target_patch_lands_in_declared_equipment_block() {
        let spec = Spec::new(json!({"libvirt": {"image": "base"}}));
        let target = TargetArgs {
            target_name: Some("ci%02d".to_string()),
            ..Default::default()
        };
        assert_eq!(target.patch(&spec), json!({"libvirt": {"name": "ci%02d"}}));
    }

    #[test]
    fn target_patch_defaults_to_openstack() {
        let spec = Spec::new(json!({}));
        let target = TargetArgs {
            target_image: Some("Leap-15.6".to_string()),
            cloud: Some("ovh".to_string()),
            ..Default::default()
        };
        assert_eq!(
            target.patch(&spec),
            json!({"openstack": {"cloud": "ovh", "image": "Leap-15.6"}})
        );
    }

    #[test]
    fn target_patch_skips_empty_values() {
        let spec = Spec::new(json!({}));
        let target = TargetArgs {
            target_name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(target.patch(&spec), json!({"openstack": {}}));
    }
}
