//! Durable run state.
//!
//! One invocation owns one `RunState`: the merged spec, the run environment,
//! and the node records filled in as equipment creation progresses. Every
//! mutation persists the whole state before returning, so the on-disk file
//! is always the latest known truth and a separate `delete` invocation can
//! clean up after a crashed or killed `create`/`run`.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Identity fields of one provisioned node (`id`, `name`, `ip`, `username`,
/// `keyfile`, `fip_id`, ...), filled in incrementally.
pub type NodeRecord = Map<String, Value>;

/// Address of one node record: the run routine it belongs to and the node
/// index within that routine. Fixed for the lifetime of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeSlot {
    pub routine: usize,
    pub node: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RunState {
    /// Legacy single-server record kept for state files written by older
    /// runs; new runs only populate `nodes`.
    #[serde(default)]
    pub server: NodeRecord,
    #[serde(default)]
    pub nodes: Vec<Vec<NodeRecord>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub spec: Value,
    #[serde(skip)]
    path: PathBuf,
}

impl RunState {
    /// Fresh state for a create/run flow, seeded by the merged spec.
    pub fn init(path: &Path, spec: Value, env: BTreeMap<String, String>) -> Self {
        RunState {
            server: NodeRecord::new(),
            nodes: Vec::new(),
            env,
            spec,
            path: path.to_path_buf(),
        }
    }

    /// Load a previously persisted state for delete/cleanup flows. A missing
    /// or corrupt file is fatal; there is no partial recovery.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::State(format!("Cannot read state file '{}': {}", path.display(), e))
        })?;
        let mut state: RunState = serde_json::from_str(&content).map_err(|e| {
            Error::State(format!("Corrupt state file '{}': {}", path.display(), e))
        })?;
        state.path = path.to_path_buf();
        Ok(state)
    }

    /// Serialize the whole state to the configured path.
    pub fn save(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.path, content).map_err(|e| {
            Error::State(format!(
                "Cannot write state file '{}': {}",
                self.path.display(),
                e
            ))
        })
    }

    /// Allocate the per-routine node-record arrays. Slot counts are fixed
    /// once resolved; calling again with the same shape is a no-op, a
    /// different shape is an error.
    pub fn ensure_slots(&mut self, counts: &[usize]) -> Result<()> {
        if self.nodes.is_empty() {
            self.nodes = counts.iter().map(|n| vec![NodeRecord::new(); *n]).collect();
            return self.save();
        }

        let current: Vec<usize> = self.nodes.iter().map(|r| r.len()).collect();
        if current != counts {
            return Err(Error::State(format!(
                "Node slots already allocated as {:?}, cannot resize to {:?}",
                current, counts
            )));
        }
        Ok(())
    }

    pub fn node(&self, slot: NodeSlot) -> Result<&NodeRecord> {
        self.nodes
            .get(slot.routine)
            .and_then(|r| r.get(slot.node))
            .ok_or_else(|| {
                Error::State(format!(
                    "No node record at routine {} node {}",
                    slot.routine, slot.node
                ))
            })
    }

    /// Mutate one node record and persist the whole state before returning.
    pub fn update(&mut self, slot: NodeSlot, fields: &[(&str, Value)]) -> Result<()> {
        let record = self
            .nodes
            .get_mut(slot.routine)
            .and_then(|r| r.get_mut(slot.node))
            .ok_or_else(|| {
                Error::State(format!(
                    "No node record at routine {} node {}",
                    slot.routine, slot.node
                ))
            })?;

        for (key, value) in fields {
            record.insert(key.to_string(), value.clone());
        }

        self.save()
    }

    /// String field of a node record, when present and non-empty.
    pub fn node_field(&self, slot: NodeSlot, key: &str) -> Option<String> {
        self.node(slot)
            .ok()?
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
    }
}
