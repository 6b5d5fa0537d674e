//! Routine execution: one named, ordered list of shell steps against one
//! assigned node.
//!
//! A failing step is recorded and every later step in the routine is
//! skipped unless marked `always`; after the last step the first recorded
//! error is re-raised. A step whose name matches a configured breakpoint
//! halts the routine before that step without error.

use crate::error::{Error, Result};
use crate::interrupt;
use crate::template;
use crate::transport::{RunRequest, Transport};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Remote working directory for helper scripts and checkouts.
pub const REMOTE_DIR: &str = "/opt/rigger";

/// Checkouts clone whole repositories; give them room.
const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Reserved bare-string control keywords.
const KEYWORD_REBOOT: &str = "reboot";
const KEYWORD_WAIT_HOST: &str = "wait_host";
const KEYWORD_RECONNECT: &str = "reconnect";
const KEYWORD_CHECKOUT: &str = "checkout";

/// One step of a routine: a bare string (control keyword, breakpoint label
/// or literal shell command) or a structured record.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Command(String),
    Detailed(DetailedStep),
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetailedStep {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub checkout: Option<CheckoutSpec>,
    #[serde(default)]
    pub always: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSpec {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

/// Parse the `steps` list of a routine value.
pub fn parse_steps(routine_value: &serde_json::Value) -> Result<Vec<Step>> {
    match routine_value.get("steps") {
        None => Ok(Vec::new()),
        Some(steps) => serde_json::from_value(steps.clone())
            .map_err(|e| Error::Config(format!("Invalid routine steps: {}", e))),
    }
}

pub struct RoutineRun<'a> {
    transport: &'a mut dyn Transport,
    env: BTreeMap<String, String>,
    breakpoints: &'a [String],
}

impl<'a> RoutineRun<'a> {
    pub fn new(
        transport: &'a mut dyn Transport,
        env: BTreeMap<String, String>,
        breakpoints: &'a [String],
    ) -> Self {
        RoutineRun { transport, env, breakpoints }
    }

    /// Run a routine's steps in order.
    pub fn run_steps(&mut self, routine: &str, steps: &[Step]) -> Result<()> {
        log_status!("routine", "Using routine '{}'...", routine);
        let mut errors: Vec<Error> = Vec::new();

        for step in steps {
            interrupt::check()?;

            if let Some(label) = self.breakpoint_label(step) {
                log_status!("routine", "Stopping at breakpoint '{}'", label);
                // Deliberate halt, not an error; the remainder of the
                // routine is simply not run this pass.
                break;
            }

            let always = matches!(step, Step::Detailed(d) if d.always);
            if !errors.is_empty() && !always {
                log_status!("routine", "Skipping step after failure: {}", describe(step));
                continue;
            }

            if let Err(e) = self.run_step(step) {
                if matches!(e, Error::Interrupted) {
                    return Err(e);
                }
                log_warn!("routine", "{}", e);
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            // Later errors stay in the log; only the first propagates.
            Err(errors.remove(0))
        }
    }

    fn run_step(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Command(text) => match text.as_str() {
                KEYWORD_REBOOT => self.transport.run(&RunRequest::named(
                    "sudo reboot &",
                    Some("rebooting node"),
                )),
                KEYWORD_WAIT_HOST | KEYWORD_RECONNECT => self.transport.connect(),
                KEYWORD_CHECKOUT => self.run_checkout(None, None),
                _ => {
                    let command = template::render_map(text, &self.env);
                    self.transport.run(&RunRequest::new(&command))
                }
            },
            Step::Detailed(detail) => {
                if let Some(checkout) = &detail.checkout {
                    return self.run_checkout(Some(checkout), detail.name.as_deref());
                }
                let Some(command) = &detail.command else {
                    return Err(Error::Config(format!(
                        "Step '{}' has neither command nor checkout",
                        detail.name.as_deref().unwrap_or("?")
                    )));
                };

                let mut env = self.env.clone();
                env.extend(detail.env.clone());
                let command = template::render_map(command, &env);
                self.transport
                    .run(&RunRequest::named(&command, detail.name.as_deref()))
            }
        }
    }

    /// Render the fixed repository-clone helper invocation against the
    /// checkout variables, sourcing url/dir/branch from the step when given
    /// and the run environment otherwise.
    fn run_checkout(&mut self, checkout: Option<&CheckoutSpec>, name: Option<&str>) -> Result<()> {
        let mut env = self.env.clone();
        env.entry("github_dir".to_string())
            .or_insert_with(|| ".".to_string());
        env.entry("github_branch".to_string())
            .or_insert_with(|| "main".to_string());

        if let Some(checkout) = checkout {
            if let Some(url) = &checkout.url {
                env.insert("github_url".to_string(), url.clone());
            }
            if let Some(dir) = &checkout.dir {
                env.insert("github_dir".to_string(), dir.clone());
            }
            if let Some(branch) = &checkout.branch {
                env.insert("github_branch".to_string(), branch.clone());
            }
        }

        let command = template::render_map(
            &format!(
                "{}/bin/clone-git-repo.sh {{{{github_dir}}}} {{{{github_url}}}} {{{{github_branch}}}} 2>&1",
                REMOTE_DIR
            ),
            &env,
        );
        self.transport.run(
            &RunRequest::named(&command, Some(name.unwrap_or("clone github repo")))
                .with_timeout(Some(CHECKOUT_TIMEOUT)),
        )
    }

    /// The breakpoint label this step halts on, when one is configured.
    fn breakpoint_label(&self, step: &Step) -> Option<&str> {
        let label = match step {
            Step::Command(text) => text.as_str(),
            Step::Detailed(detail) => detail.name.as_deref()?,
        };
        self.breakpoints
            .iter()
            .find(|b| b.as_str() == label)
            .map(|b| b.as_str())
    }
}

fn describe(step: &Step) -> String {
    match step {
        Step::Command(text) => text.clone(),
        Step::Detailed(detail) => detail
            .name
            .clone()
            .or_else(|| detail.command.clone())
            .unwrap_or_else(|| "step".to_string()),
    }
}
