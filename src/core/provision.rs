//! Node provisioning: prepare a freshly created node for routine execution.
//!
//! Creates the remote work directory, installs the embedded repository-clone
//! helper, copies the spec's `copy` entries up, and installs declared
//! package dependencies.

use crate::error::{Error, Result};
use crate::routine::REMOTE_DIR;
use crate::transport::{RunRequest, Transport};
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

const CLONE_HELPER: &str = include_str!("../snippets/clone-git-repo.sh");

/// One file-copy declaration from the spec's `copy` list.
#[derive(Debug, Clone, Deserialize)]
pub struct CopyEntry {
    pub from: Vec<String>,
    pub into: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Parse the spec's optional top-level `copy` list.
pub fn copy_entries(spec: &Value) -> Result<Vec<CopyEntry>> {
    match spec.get("copy") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(entries) => serde_json::from_value(entries.clone())
            .map_err(|e| Error::Config(format!("Invalid copy entries: {}", e))),
    }
}

/// Package names from `vars.dependencies`, when declared.
fn dependencies(spec: &Value) -> Vec<String> {
    spec.get("vars")
        .and_then(|vars| vars.get("dependencies"))
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_mode(mode: &Option<String>) -> Result<Option<u32>> {
    match mode {
        None => Ok(None),
        Some(text) => u32::from_str_radix(text, 8)
            .map(Some)
            .map_err(|_| Error::Config(format!("Invalid file mode '{}'", text))),
    }
}

/// Prepare a node: work directory, helper script, spec copies, packages.
/// `username` is the login user the work directory gets chowned to.
pub fn provision(transport: &mut dyn Transport, spec: &Value, username: &str) -> Result<()> {
    log_status!("provision", "Provisioning {}...", transport.label());

    transport.run(&RunRequest::new(&format!(
        "sudo mkdir -p {} 2>&1",
        REMOTE_DIR
    )))?;
    transport.run(&RunRequest::new(&format!(
        "sudo chown {}: {} 2>&1",
        username, REMOTE_DIR
    )))?;
    transport.run(&RunRequest::new(&format!(
        "mkdir -p {}/bin 2>&1",
        REMOTE_DIR
    )))?;

    transport.upload_bytes(
        CLONE_HELPER.as_bytes(),
        &format!("{}/bin/clone-git-repo.sh", REMOTE_DIR),
        Some(0o755),
    )?;

    for entry in copy_entries(spec)? {
        let mode = parse_mode(&entry.mode)?;
        let into = entry.into.trim_end_matches('/');
        for from in &entry.from {
            let name = Path::new(from)
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Config(format!("Invalid copy source '{}'", from)))?;
            transport.upload_file(from, &format!("{}/{}", into, name), mode)?;
        }
    }

    let deps = dependencies(spec);
    if !deps.is_empty() {
        transport.run(&RunRequest::new("sudo zypper --no-gpg-checks ref 2>&1"))?;
        transport.run(&RunRequest::new(&format!(
            "sudo zypper install -y {} 2>&1",
            deps.join(" ")
        )))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingTransport {
        commands: Vec<String>,
        uploads: Vec<(String, Option<u32>)>,
        file_copies: Vec<(String, String, Option<u32>)>,
    }

    impl Transport for RecordingTransport {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn run(&mut self, request: &RunRequest) -> Result<()> {
            self.commands.push(request.command.to_string());
            Ok(())
        }

        fn upload_bytes(&mut self, _: &[u8], dest: &str, mode: Option<u32>) -> Result<()> {
            self.uploads.push((dest.to_string(), mode));
            Ok(())
        }

        fn upload_file(&mut self, local: &str, dest: &str, mode: Option<u32>) -> Result<()> {
            self.file_copies
                .push((local.to_string(), dest.to_string(), mode));
            Ok(())
        }

        fn label(&self) -> String {
            "test@node".to_string()
        }
    }

    #[test]
    fn creates_work_dir_and_uploads_helper() {
        let mut t = RecordingTransport::default();
        provision(&mut t, &json!({}), "opensuse").unwrap();

        assert_eq!(t.commands[0], "sudo mkdir -p /opt/rigger 2>&1");
        assert_eq!(t.commands[1], "sudo chown opensuse: /opt/rigger 2>&1");
        assert_eq!(t.commands[2], "mkdir -p /opt/rigger/bin 2>&1");
        assert_eq!(
            t.uploads,
            vec![("/opt/rigger/bin/clone-git-repo.sh".to_string(), Some(0o755))]
        );
    }

    #[test]
    fn copies_spec_entries_with_parsed_mode() {
        let mut t = RecordingTransport::default();
        let spec = json!({
            "copy": [
                {"from": ["scripts/setup.sh", "conf/app.conf"], "into": "/opt/rigger/bin/", "mode": "0755"},
            ],
        });
        provision(&mut t, &spec, "root").unwrap();

        assert_eq!(
            t.file_copies,
            vec![
                (
                    "scripts/setup.sh".to_string(),
                    "/opt/rigger/bin/setup.sh".to_string(),
                    Some(0o755)
                ),
                (
                    "conf/app.conf".to_string(),
                    "/opt/rigger/bin/app.conf".to_string(),
                    Some(0o755)
                ),
            ]
        );
    }

    #[test]
    fn installs_declared_dependencies() {
        let mut t = RecordingTransport::default();
        let spec = json!({"vars": {"dependencies": ["git", "jq"]}});
        provision(&mut t, &spec, "root").unwrap();

        assert!(t
            .commands
            .contains(&"sudo zypper --no-gpg-checks ref 2>&1".to_string()));
        assert!(t
            .commands
            .contains(&"sudo zypper install -y git jq 2>&1".to_string()));
    }

    #[test]
    fn no_dependency_commands_when_undeclared() {
        let mut t = RecordingTransport::default();
        provision(&mut t, &json!({}), "root").unwrap();
        assert!(!t.commands.iter().any(|c| c.contains("zypper")));
    }

    #[test]
    fn bad_mode_is_config_error() {
        let mut t = RecordingTransport::default();
        let spec = json!({
            "copy": [{"from": ["a.sh"], "into": "/opt/rigger", "mode": "rwx"}],
        });
        let err = provision(&mut t, &spec, "root").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
