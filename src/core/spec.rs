//! Spec documents and the recursive override merge.
//!
//! A spec is a JSON/YAML tree of mappings, lists, scalars and null. Layers
//! are combined with [`override_value`]: built-in defaults, then the home
//! config, then the project config, then an explicitly named spec file, then
//! run-time overrides.

use crate::error::{Error, Result};
use crate::paths;
use serde_json::{json, Map, Value};
use std::path::Path;

/// Merged configuration document describing desired equipment and routines.
#[derive(Debug, Clone)]
pub struct Spec(pub Value);

/// Equipment keywords recognized at the top level of a spec, in precedence
/// order. When a node spec erroneously carries more than one kind, the first
/// keyword present wins; this tie-break is deliberate.
pub const EQUIPMENT_KEYWORDS: &[&str] = &["libvirt", "openstack"];

/// Merge `patch` over `base` and return the combined tree.
///
/// `base` is never mutated. For every key in `patch`: when both sides hold a
/// mapping the merge recurses, otherwise the patch value replaces the base
/// value wholesale. Lists are never concatenated, null and empty containers
/// overwrite like any other value, and keys absent from `patch` are left
/// untouched.
pub fn override_value(base: &Value, patch: &Value) -> Value {
    let mut merged = base.clone();
    apply_patch(&mut merged, patch);
    merged
}

fn apply_patch(dest: &mut Value, patch: &Value) {
    let Value::Object(patch_obj) = patch else {
        *dest = patch.clone();
        return;
    };

    let Value::Object(dest_obj) = dest else {
        *dest = patch.clone();
        return;
    };

    for (key, patch_value) in patch_obj {
        match dest_obj.get_mut(key) {
            Some(dest_value) if dest_value.is_object() => {
                apply_patch(dest_value, patch_value);
            }
            _ => {
                dest_obj.insert(key.clone(), patch_value.clone());
            }
        }
    }
}

/// Built-in defaults seeding every spec layer stack.
pub fn defaults() -> Value {
    json!({
        "openstack": {
            "name": "target%02d",
            "keyname": "rigger",
            "username": "root",
            "networks": ["Ext-Net"],
        },
    })
}

impl Spec {
    pub fn new(value: Value) -> Self {
        Spec(value)
    }

    /// Read a single spec document from a path. YAML and JSON are both
    /// accepted; the extension decides the parser.
    pub fn read_file(path: &Path) -> Result<Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read spec file '{}': {}", path.display(), e))
        })?;
        parse_document(&content, path)
    }

    /// Build a merged spec from the layered config paths plus an explicitly
    /// named spec file. Missing optional layers are skipped; a named spec
    /// file that does not exist is a configuration error.
    pub fn load_layered(spec_path: Option<&Path>) -> Result<Spec> {
        let mut merged = defaults();

        for layer in paths::config_layers() {
            log_status!("spec", "Reading config from file: {}", layer.display());
            let value = Self::read_file(&layer)?;
            merged = override_value(&merged, &value);
        }

        if let Some(path) = spec_path {
            log_status!("spec", "Reading spec from file: {}", path.display());
            let value = Self::read_file(path)?;
            merged = override_value(&merged, &value);
        }

        Ok(Spec(merged))
    }

    /// Apply run-time overrides (CLI-level values) on top of this spec.
    pub fn apply_overrides(&mut self, patch: &Value) {
        self.0 = override_value(&self.0, patch);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// The `routines` mapping. An absent key is an empty mapping.
    pub fn routines(&self) -> Map<String, Value> {
        match self.0.get("routines") {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }

    pub fn routine(&self, name: &str) -> Option<&Value> {
        self.0.get("routines")?.get(name)
    }

    /// Run environment seeded from the spec's `env` mapping. Non-string
    /// scalars are rendered through their JSON representation.
    pub fn env(&self) -> std::collections::BTreeMap<String, String> {
        let mut env = std::collections::BTreeMap::new();
        if let Some(Value::Object(map)) = self.0.get("env") {
            for (key, value) in map {
                let text = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                env.insert(key.clone(), text);
            }
        }
        env
    }

    /// First equipment keyword present at the top level with a non-empty
    /// value, in precedence order.
    pub fn top_equipment_kind(&self) -> Option<&'static str> {
        EQUIPMENT_KEYWORDS
            .iter()
            .find(|k| is_present_block(self.0.get(**k)))
            .copied()
    }
}

/// True when a value counts as a declared equipment block: present and not
/// an empty container or null.
pub fn is_present_block(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Object(map)) => !map.is_empty(),
        Some(Value::Array(list)) => !list.is_empty(),
        Some(Value::String(s)) => !s.is_empty(),
        Some(_) => true,
    }
}

fn parse_document(content: &str, path: &Path) -> Result<Value> {
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yaml" || e == "yml");

    if is_yaml {
        let value: Value = serde_yml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid YAML in '{}': {}", path.display(), e)))?;
        Ok(value)
    } else {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid JSON in '{}': {}", path.display(), e)))?;
        Ok(value)
    }
}
