//! SSH transport: shells out to the `ssh` binary.
//!
//! BatchMode plus connect-timeout and keepalive options prevent hangs on
//! stalled connections or unexpected prompts. Uploads stream through
//! `cat > dest` with the content piped to stdin, so no scp/sftp binary is
//! required on either side.

use super::{log_command, spawn_stream_logger, wait_with_timeout, RunRequest, Transport};
use super::{STDERR_PREFIX, STDOUT_PREFIX};
use crate::error::{Error, Result};
use crate::utils::shell;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const CONNECT_WAIT: Duration = Duration::from_secs(10);

pub struct RemoteShell {
    pub host: String,
    pub user: String,
    pub identity_file: Option<String>,
    connect_timeout: Duration,
    connect_wait: Duration,
    connected: bool,
}

impl RemoteShell {
    pub fn new(host: &str, user: &str, identity_file: Option<&str>) -> Self {
        let identity_file = identity_file
            .filter(|p| !p.is_empty())
            .map(|p| shellexpand::tilde(p).to_string());

        RemoteShell {
            host: host.to_string(),
            user: user.to_string(),
            identity_file,
            connect_timeout: CONNECT_TIMEOUT,
            connect_wait: CONNECT_WAIT,
            connected: false,
        }
    }

    #[cfg(test)]
    pub fn with_connect_timing(mut self, timeout: Duration, wait: Duration) -> Self {
        self.connect_timeout = timeout;
        self.connect_wait = wait;
        self
    }

    fn build_ssh_args(&self, command: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        // Fresh nodes show up with new host keys every run.
        args.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.host));

        if let Some(cmd) = command {
            args.push(cmd.to_string());
        }

        args
    }

    /// One connection probe: run `true` on the remote side.
    fn probe(&self) -> Result<bool> {
        let output = Command::new("ssh")
            .args(self.build_ssh_args(Some("true")))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| Error::Transport(format!("Failed to spawn ssh: {}", e)))?;
        Ok(output.status.success())
    }

    fn spawn_remote(&self, command: &str, stdin: Stdio) -> Result<std::process::Child> {
        Command::new("ssh")
            .args(self.build_ssh_args(Some(command)))
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Transport(format!("Failed to spawn ssh: {}", e)))
    }
}

impl Transport for RemoteShell {
    /// Retry the connection probe until it succeeds or the bounded total
    /// timeout elapses. Freshly created nodes routinely refuse the first
    /// few attempts while sshd comes up.
    fn connect(&mut self) -> Result<()> {
        let start = Instant::now();
        log_status!("ssh", "Connecting to host [{}]", self.host);

        loop {
            if self.probe()? {
                log_status!("ssh", "Connected to the host {}", self.host);
                self.connected = true;
                return Ok(());
            }
            if start.elapsed() >= self.connect_timeout {
                return Err(Error::Transport(format!(
                    "Connection to {} timed out",
                    self.host
                )));
            }
            log_status!("ssh", "Waiting {:?} before reconnecting...", self.connect_wait);
            std::thread::sleep(self.connect_wait);
        }
    }

    fn run(&mut self, request: &RunRequest) -> Result<()> {
        if !self.connected {
            self.connect()?;
        }
        log_command(request.command, request.name);

        let mut child = self.spawn_remote(request.command, Stdio::null())?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdout_thread = spawn_stream_logger(stdout, STDOUT_PREFIX);
        let stderr_thread = spawn_stream_logger(stderr, STDERR_PREFIX);

        let status = wait_with_timeout(&mut child, request.timeout)?;

        // Both readers drain before the exit status is read.
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
        if !self.connected {
            self.connect()?;
        }
        log_status!("ssh", "Upload {} bytes to {}", content.len(), dest);

        let remote_command = match mode {
            Some(mode) => format!(
                "cat > {path} && chmod {mode:o} {path}",
                path = shell::quote_path(dest),
                mode = mode
            ),
            None => format!("cat > {}", shell::quote_path(dest)),
        };

        let mut child = self.spawn_remote(&remote_command, Stdio::piped())?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(content)
            .map_err(|e| Error::Transport(format!("Upload to {} failed: {}", dest, e)))?;

        let output = child
            .wait_with_output()
            .map_err(|e| Error::Transport(format!("Upload to {} failed: {}", dest, e)))?;
        if !output.status.success() {
            return Err(Error::Transport(format!(
                "Upload to {} failed: {}",
                dest,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn upload_file(&mut self, local: &str, dest: &str, mode: Option<u32>) -> Result<()> {
        let content = std::fs::read(local)
            .map_err(|e| Error::Transport(format!("Cannot read local file '{}': {}", local, e)))?;
        self.upload_bytes(&content, dest, mode)
    }

    fn label(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_file_is_tilde_expanded() {
        let shell = RemoteShell::new("10.0.0.1", "root", Some("~/.ssh/id_rsa"));
        let identity = shell.identity_file.as_deref().unwrap();
        assert!(!identity.starts_with('~'));
        assert!(identity.ends_with(".ssh/id_rsa"));
    }

    #[test]
    fn empty_identity_file_is_dropped() {
        let shell = RemoteShell::new("10.0.0.1", "root", Some(""));
        assert!(shell.identity_file.is_none());
    }

    #[test]
    fn ssh_args_carry_batch_mode_and_target() {
        let shell = RemoteShell::new("10.0.0.1", "opensuse", None);
        let args = shell.build_ssh_args(Some("uname -a"));
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"opensuse@10.0.0.1".to_string()));
        assert_eq!(args.last().unwrap(), "uname -a");
    }

    #[test]
    fn connect_times_out_against_unreachable_host() {
        // Reserved TEST-NET address; the probe cannot succeed.
        let mut shell = RemoteShell::new("192.0.2.1", "root", None)
            .with_connect_timing(Duration::from_millis(10), Duration::from_millis(10));
        let err = shell.connect().unwrap_err();
        assert_eq!(err.code(), "TRANSPORT_ERROR");
    }

    #[test]
    fn label_is_user_at_host() {
        let shell = RemoteShell::new("198.51.100.7", "ci", None);
        assert_eq!(shell.label(), "ci@198.51.100.7");
    }
}
