use clap::Args;
use serde::Serialize;
use std::path::Path;

use rigger::state::RunState;

use super::{CmdResult, CommonArgs};

#[derive(Args)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Serialize)]
pub struct DeleteOutput {
    pub state_path: String,
    pub deleted: Vec<String>,
}

pub fn run(args: DeleteArgs) -> CmdResult<DeleteOutput> {
    let mut state = RunState::load(Path::new(&args.common.state_path))?;
    let deleted = super::teardown(&mut state, args.common.debug);
    Ok((
        DeleteOutput {
            state_path: args.common.state_path,
            deleted,
        },
        0,
    ))
}
