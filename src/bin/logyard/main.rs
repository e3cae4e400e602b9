// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;

use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use logyard::init::agent::Agent;
use logyard::init::args::AgentRun;

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the agent
    Start(Box<AgentRun>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logyard")]
#[command(bin_name = "logyard")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    /// Log level filter (overridden by LOGYARD_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Arguments::parse();

    let filter = EnvFilter::try_from_env("LOGYARD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // An offset-table invariant violation panics the offending thread; the
    // whole process must go down with it so supervision restarts from the
    // last durable snapshot.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(70);
    }));

    match args.command {
        Commands::Start(run) => match Agent::new(*run).run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "agent failed");
                ExitCode::FAILURE
            }
        },
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
    }
}
