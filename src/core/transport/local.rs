//! Local process transport: runs steps through `sh -c` on this host.

use super::{log_command, spawn_stream_logger, wait_with_timeout, RunRequest, Transport};
use super::{STDERR_PREFIX, STDOUT_PREFIX};
use crate::error::{Error, Result};
use std::process::{Command, Stdio};

pub struct LocalShell {
    pub username: String,
}

impl LocalShell {
    pub fn new(user: Option<&str>) -> Self {
        let username = user
            .map(|u| u.to_string())
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        LocalShell { username }
    }
}

impl Transport for LocalShell {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, request: &RunRequest) -> Result<()> {
        log_command(request.command, request.name);

        let mut child = Command::new("sh")
            .args(["-c", request.command])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn command: {}", e)))?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdout_thread = spawn_stream_logger(stdout, STDOUT_PREFIX);
        let stderr_thread = spawn_stream_logger(stderr, STDERR_PREFIX);

        let status = wait_with_timeout(&mut child, request.timeout)?;

        let _ = stdout_thread.join();
        let _ = stderr_thread.join();

        let Some(status) = status else {
            return Err(Error::Transport(format!(
                "Command timed out: {}",
                request.command
            )));
        };

        let exit_code = status.code().unwrap_or(-1);
        if exit_code != 0 {
            return Err(Error::StepFailed {
                command: request.command.to_string(),
                exit_code,
            });
        }
        println!("||| exit code: {}", exit_code);
        Ok(())
    }

    fn upload_bytes(&mut self, content: &[u8], dest: &str, mode: Option<u32>) -> Result<()> {
        std::fs::write(dest, content)?;
        if let Some(mode) = mode {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(dest, std::fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn upload_file(&mut self, local: &str, dest: &str, mode: Option<u32>) -> Result<()> {
        let content = std::fs::read(local)?;
        self.upload_bytes(&content, dest, mode)
    }

    fn label(&self) -> String {
        format!("{}@localhost", self.username)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_succeeds_on_zero_exit() {
        let mut shell = LocalShell::new(Some("tester"));
        shell.run(&RunRequest::new("true")).unwrap();
    }

    #[test]
    fn run_fails_on_nonzero_exit() {
        let mut shell = LocalShell::new(Some("tester"));
        let err = shell.run(&RunRequest::new("exit 3")).unwrap_err();
        match err {
            Error::StepFailed { exit_code, .. } => assert_eq!(exit_code, 3),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn run_times_out() {
        let mut shell = LocalShell::new(Some("tester"));
        let err = shell
            .run(
                &RunRequest::new("sleep 5")
                    .with_timeout(Some(std::time::Duration::from_millis(200))),
            )
            .unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
    }

    #[test]
    fn upload_bytes_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("script.sh");
        let mut shell = LocalShell::new(Some("tester"));
        shell
            .upload_bytes(b"#!/bin/sh\n", dest.to_str().unwrap(), Some(0o755))
            .unwrap();
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
