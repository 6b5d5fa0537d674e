use clap::Args;
use serde::Serialize;
use std::path::Path;

use rigger::state::RunState;
use rigger::workflow::Planner;

use super::{CmdResult, CommonArgs, NodeSummary, TargetArgs};

#[derive(Args)]
pub struct CreateArgs {
    /// Spec file layered over the built-in defaults and config files
    pub path: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,

    #[command(flatten)]
    pub target: TargetArgs,
}

#[derive(Serialize)]
pub struct CreateOutput {
    pub state_path: String,
    pub nodes: Vec<NodeSummary>,
}

pub fn run(args: CreateArgs) -> CmdResult<CreateOutput> {
    let spec = super::load_spec(args.path.as_deref(), &args.target)?;
    let env = spec.env();
    let mut state = RunState::init(Path::new(&args.common.state_path), spec.0.clone(), env);

    // In debug mode a failed node stays up for inspection.
    super::create_all(&spec, &mut state, args.common.debug, args.common.debug)?;

    let plans = Planner::new(&spec).run_routines()?;
    Ok((
        CreateOutput {
            state_path: args.common.state_path,
            nodes: super::node_summaries(&state, &plans),
        },
        0,
    ))
}
