use clap::Args;
use serde::Serialize;
use std::path::Path;

use rigger::log_warn;
use rigger::provision;
use rigger::routine::{self, RoutineRun};
use rigger::state::{NodeSlot, RunState};
use rigger::template::TemplateVars;
use rigger::transport::Transport;
use rigger::workflow::Planner;

use super::{CmdResult, CommonArgs, NodeSummary, TargetArgs};

#[derive(Args)]
pub struct RunArgs {
    /// Spec file describing equipment and routines
    pub path: String,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    /// Keep nodes after the run instead of deleting them
    #[arg(short = 'k', long)]
    pub keep_nodes: bool,

    /// Halt before the step with this name (repeatable)
    #[arg(short = 'b', long = "breakpoint")]
    pub breakpoints: Vec<String>,

    /// Extra run variables as key=value (repeatable, comma-separable)
    #[arg(short = 'e', long = "extra-vars")]
    pub extra_vars: Vec<String>,

    /// Repository URL exported to routines as github_url
    #[arg(long)]
    pub repo_url: Option<String>,

    /// Repository branch exported to routines as github_branch
    #[arg(long)]
    pub repo_branch: Option<String>,
}

#[derive(Serialize)]
pub struct RunOutput {
    pub state_path: String,
    pub routines: Vec<String>,
    pub nodes: Vec<NodeSummary>,
    pub kept: bool,
}

pub fn run(args: RunArgs) -> CmdResult<RunOutput> {
    let spec = super::load_spec(Some(&args.path), &args.target)?;

    let mut env = spec.env();
    if let Some(url) = &args.repo_url {
        env.insert(TemplateVars::GITHUB_URL.to_string(), url.clone());
    }
    if let Some(branch) = &args.repo_branch {
        env.insert(TemplateVars::GITHUB_BRANCH.to_string(), branch.clone());
    }
    env.extend(super::parse_extra_vars(&args.extra_vars)?);

    let mut state = RunState::init(
        Path::new(&args.common.state_path),
        spec.0.clone(),
        env.clone(),
    );

    let keep_on_error = args.common.debug || args.keep_nodes;
    super::create_all(&spec, &mut state, args.common.debug, keep_on_error)?;

    let planner = Planner::new(&spec);
    let plans = planner.run_routines()?;

    let mut outcome = Ok(());
    for (index, plan) in plans.iter().enumerate() {
        let routine_value = match spec.routine(&plan.name) {
            Some(value) => value.clone(),
            None => {
                outcome = Err(rigger::Error::RoutineNotFound(plan.name.clone()));
                break;
            }
        };
        let steps = match routine::parse_steps(&routine_value) {
            Ok(steps) => steps,
            Err(e) => {
                outcome = Err(e);
                break;
            }
        };

        // Fan-out labels are accepted configuration; steps run on the
        // routine's first node.
        let slot = NodeSlot {
            routine: index,
            node: 0,
        };
        let result = run_on_node(&state, slot, &env, &args.breakpoints, &plan.name, &steps);
        if let Err(e) = result {
            outcome = Err(e);
            break;
        }
    }

    let kept = args.keep_nodes || (outcome.is_err() && args.common.debug);
    let nodes = super::node_summaries(&state, &plans);
    if kept {
        if outcome.is_err() {
            // A failed run with kept nodes emits how to reach them instead
            // of tearing them down.
            for hint in super::access_hints(&nodes) {
                log_warn!("run", "Node kept, connect with: {}", hint);
            }
        }
    } else {
        super::teardown(&mut state, args.common.debug);
    }

    outcome?;
    Ok((
        RunOutput {
            state_path: args.common.state_path,
            routines: plans.into_iter().map(|p| p.name).collect(),
            nodes,
            kept,
        },
        0,
    ))
}

fn run_on_node(
    state: &RunState,
    slot: NodeSlot,
    env: &std::collections::BTreeMap<String, String>,
    breakpoints: &[String],
    routine: &str,
    steps: &[routine::Step],
) -> rigger::Result<()> {
    let (mut shell, username) = super::node_transport(state, slot)?;
    shell.connect()?;
    provision::provision(&mut shell, &state.spec, &username)?;
    RoutineRun::new(&mut shell, env.clone(), breakpoints).run_steps(routine, steps)
}
