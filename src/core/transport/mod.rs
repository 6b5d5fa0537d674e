//! Command transport boundary.
//!
//! The executor talks to an assigned node through a [`Transport`]: connect
//! (retryable until a bounded timeout), run a shell command with streamed
//! output, and copy files up. Two implementations ship: [`ssh::RemoteShell`]
//! shelling out to the `ssh` binary, and [`local::LocalShell`] running
//! `sh -c` on the local host.

pub mod local;
pub mod ssh;

use crate::error::Result;
use std::io::{BufRead, BufReader, Read};
use std::thread::JoinHandle;
use std::time::Duration;

pub const CMDLOG_PREFIX: &str = "+++";
pub const STDOUT_PREFIX: &str = ">>>";
pub const STDERR_PREFIX: &str = "EEE";

/// One command to run on the node.
pub struct RunRequest<'a> {
    pub command: &'a str,
    /// Optional label printed as a `=== name` header before the command.
    pub name: Option<&'a str>,
    /// Optional wall-clock bound; the command is killed when it elapses.
    pub timeout: Option<Duration>,
}

impl<'a> RunRequest<'a> {
    pub fn new(command: &'a str) -> Self {
        RunRequest { command, name: None, timeout: None }
    }

    pub fn named(command: &'a str, name: Option<&'a str>) -> Self {
        RunRequest { command, name, timeout: None }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

pub trait Transport {
    /// Establish (or re-establish) the session, retrying until the
    /// transport's bounded connection timeout elapses.
    fn connect(&mut self) -> Result<()>;

    /// Run a command, streaming its stdout and stderr line by line, and
    /// fail on a non-zero exit status.
    fn run(&mut self, request: &RunRequest) -> Result<()>;

    /// Write bytes to a remote path, optionally chmod-ing the result.
    fn upload_bytes(&mut self, content: &[u8], dest: &str, mode: Option<u32>) -> Result<()>;

    /// Copy a local file to a remote path.
    fn upload_file(&mut self, local: &str, dest: &str, mode: Option<u32>) -> Result<()>;

    /// Human-readable `user@host` label for logs and access hints.
    fn label(&self) -> String;
}

/// Print the `=== name` header and the `+++ `-prefixed command text.
pub fn log_command(command: &str, name: Option<&str>) {
    if let Some(name) = name {
        println!("=== {}", name);
    }
    for line in command.split('\n') {
        println!("{} {}", CMDLOG_PREFIX, line);
    }
}

/// Drain a stream line by line to stdout under a fixed prefix. One reader
/// task per stream keeps either pipe from blocking the other.
pub fn spawn_stream_logger<R: Read + Send + 'static>(
    stream: R,
    prefix: &'static str,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            match line {
                Ok(line) => println!("{} {}", prefix, line.trim_end()),
                Err(_) => break,
            }
        }
    })
}

/// Wait on a child process, polling `try_wait` so an optional timeout can be
/// enforced. On timeout the child is killed and `None` is returned.
pub fn wait_with_timeout(
    child: &mut std::process::Child,
    timeout: Option<Duration>,
) -> Result<Option<std::process::ExitStatus>> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };

    let start = std::time::Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(100));
    }
}
