use clap::Args;
use serde::Serialize;
use std::path::Path;

use rigger::provision;
use rigger::state::{NodeSlot, RunState};
use rigger::transport::Transport;

use super::{CmdResult, CommonArgs};

#[derive(Args)]
pub struct ProvisionArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Serialize)]
pub struct ProvisionOutput {
    pub state_path: String,
    pub provisioned: Vec<String>,
}

pub fn run(args: ProvisionArgs) -> CmdResult<ProvisionOutput> {
    let state = RunState::load(Path::new(&args.common.state_path))?;
    let mut provisioned = Vec::new();

    for routine in 0..state.nodes.len() {
        for node in 0..state.nodes[routine].len() {
            let slot = NodeSlot { routine, node };
            let (mut shell, username) = super::node_transport(&state, slot)?;
            shell.connect()?;
            provision::provision(&mut shell, &state.spec, &username)?;
            provisioned.push(shell.label());
        }
    }

    Ok((
        ProvisionOutput {
            state_path: args.common.state_path,
            provisioned,
        },
        0,
    ))
}
