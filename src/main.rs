use clap::{Parser, Subcommand};

mod commands;
mod output;

use commands::{create, delete, provision, run};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "rigger")]
#[command(version = VERSION)]
#[command(about = "Provision ephemeral test nodes and run shell routines on them")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the environment's nodes
    Create(create::CreateArgs),
    /// Delete previously created nodes
    Delete(delete::DeleteArgs),
    /// Provision created nodes without running routines
    Provision(provision::ProvisionArgs),
    /// Create nodes, provision them, run every routine, then tear down
    Run(run::RunArgs),
}

fn main() -> std::process::ExitCode {
    rigger::interrupt::install_handlers();

    let cli = Cli::parse();
    let (result, exit_code) = commands::run_json(cli.command);
    output::print_json_result(result);
    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
