//! Workflow planning: which routines run, in what order, and on what
//! equipment.
//!
//! The plan comes from the spec's `workflow` block and defaults to every
//! routine in declaration order, one at a time. `after` dependencies and the
//! `threads` hint are parsed and carried in the plan but the executor runs
//! routines strictly sequentially; neither is enforced.

use crate::equip::{Equipment, EquipmentKind};
use crate::error::{Error, Result};
use crate::spec::{is_present_block, override_value, Spec, EQUIPMENT_KEYWORDS};
use crate::state::{NodeSlot, RunState};
use serde_json::{json, Value};

/// One entry of the resolved workflow plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutinePlan {
    pub name: String,
    /// Declared ordering dependency; accepted but not enforced.
    pub after: Option<String>,
}

/// Per-node resolved equipment description: the merged spec restricted to
/// exactly one equipment kind.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub kind: EquipmentKind,
    pub value: Value,
}

pub struct Planner<'a> {
    spec: &'a Spec,
}

impl<'a> Planner<'a> {
    pub fn new(spec: &'a Spec) -> Self {
        Planner { spec }
    }

    /// Ordered routine plan. Referencing a routine absent from `routines`
    /// is fatal, as is a plan entry that is neither a string nor a
    /// name-bearing mapping.
    pub fn run_routines(&self) -> Result<Vec<RoutinePlan>> {
        let routines = self.spec.routines();

        let Some(plan_list) = self
            .spec
            .get("workflow")
            .and_then(|w| w.get("routines"))
            .and_then(|r| r.as_array())
        else {
            // No explicit plan: every routine in declaration order.
            return Ok(routines
                .keys()
                .map(|name| RoutinePlan { name: name.clone(), after: None })
                .collect());
        };

        let mut plans = Vec::with_capacity(plan_list.len());
        for entry in plan_list {
            let plan = match entry {
                Value::String(name) => RoutinePlan { name: name.clone(), after: None },
                Value::Object(map) => {
                    let name = map
                        .get("name")
                        .and_then(|n| n.as_str())
                        .ok_or_else(|| {
                            Error::PlanEntry(format!("mapping entry without a name: {}", entry))
                        })?
                        .to_string();
                    let after = map
                        .get("after")
                        .and_then(|a| a.as_str())
                        .map(|a| a.to_string());
                    RoutinePlan { name, after }
                }
                other => {
                    return Err(Error::PlanEntry(format!(
                        "expected a routine name or mapping, got: {}",
                        other
                    )))
                }
            };

            if !routines.contains_key(&plan.name) {
                return Err(Error::RoutineNotFound(plan.name));
            }
            plans.push(plan);
        }
        Ok(plans)
    }

    /// Maximum routines that may run concurrently. Accepted configuration;
    /// the current executor runs one at a time.
    pub fn threads(&self) -> u64 {
        self.spec
            .get("workflow")
            .and_then(|w| w.get("threads"))
            .and_then(|t| t.as_u64())
            .unwrap_or(1)
    }

    /// Resolved node specs for one routine. A routine without a `nodes`
    /// list gets one implicit node.
    pub fn node_specs(&self, routine: &str) -> Result<Vec<NodeSpec>> {
        let routine_value = self
            .spec
            .routine(routine)
            .ok_or_else(|| Error::RoutineNotFound(routine.to_string()))?;

        let implicit = vec![json!({})];
        let entries: Vec<Value> = match routine_value.get("nodes") {
            Some(Value::Array(list)) if !list.is_empty() => list.clone(),
            _ => implicit,
        };

        let mut specs = Vec::with_capacity(entries.len());
        for entry in &entries {
            specs.push(self.resolve_node_spec(routine_value, entry)?);
        }
        Ok(specs)
    }

    /// Per-routine node-spec lists for every run routine, in run order.
    pub fn all_node_specs(&self) -> Result<Vec<Vec<NodeSpec>>> {
        self.run_routines()?
            .iter()
            .map(|plan| self.node_specs(&plan.name))
            .collect()
    }

    /// Equipment bound to node-record slots, allocating the slots on first
    /// access when the run state has none yet.
    pub fn equipment(&self, state: &mut RunState) -> Result<Vec<Vec<Equipment>>> {
        let per_routine = self.all_node_specs()?;
        let counts: Vec<usize> = per_routine.iter().map(|specs| specs.len()).collect();
        state.ensure_slots(&counts)?;

        let equipment = per_routine
            .into_iter()
            .enumerate()
            .map(|(routine, specs)| {
                specs
                    .into_iter()
                    .enumerate()
                    .map(|(node, spec)| {
                        Equipment::new(spec.kind, NodeSlot { routine, node }, spec.value)
                    })
                    .collect()
            })
            .collect();
        Ok(equipment)
    }

    /// Resolve one node entry: the routine-shared equipment block of the
    /// entry's kind (falling back to the top-level block) overridden by the
    /// entry's own block. An entry without any equipment keyword falls back
    /// to whatever kind the top of the merged spec declares.
    fn resolve_node_spec(&self, routine_value: &Value, entry: &Value) -> Result<NodeSpec> {
        let empty = json!({});

        if let Some(kind) = EquipmentKind::resolve(entry) {
            let keyword = kind.keyword();
            let shared = routine_value
                .get(keyword)
                .filter(|v| is_present_block(Some(v)))
                .or_else(|| self.spec.get(keyword))
                .unwrap_or(&empty);
            let own = entry.get(keyword).unwrap_or(&empty);
            return Ok(NodeSpec { kind, value: override_value(shared, own) });
        }

        // No equipment keyword on the entry itself: routine block first,
        // then the top-level spec.
        for keyword in EQUIPMENT_KEYWORDS {
            let routine_block = routine_value.get(*keyword);
            let top_block = self.spec.get(*keyword);
            if is_present_block(routine_block) || is_present_block(top_block) {
                let kind = EquipmentKind::from_keyword(keyword).expect("known keyword");
                let base = top_block.unwrap_or(&empty);
                let shared = routine_block.unwrap_or(&empty);
                return Ok(NodeSpec { kind, value: override_value(base, shared) });
            }
        }

        Err(Error::Config(
            "No equipment kind declared for node (expected one of: libvirt, openstack)".to_string(),
        ))
    }
}
