//! OLC CLI - Command-line interface for the offload container engine.

mod commands;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "olc")]
#[command(author, version, about = "Offload container CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario against the loopback satellite
    Run(commands::run::RunArgs),

    /// List the opcodes the container dispatches
    Opcodes(commands::opcodes::OpcodesArgs),

    /// Validate a container config or scenario file
    Validate(commands::validate::ValidateArgs),
}

fn main() -> anyhow::Result<()> {
    // stdout carries the --json output
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
    tracing_log::LogTracer::init().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => commands::run::run(args),
        Commands::Opcodes(args) => commands::opcodes::run(args),
        Commands::Validate(args) => commands::validate::run(args),
    }
}
