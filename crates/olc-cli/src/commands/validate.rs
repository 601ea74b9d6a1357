//! Config and scenario validation.

use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use olc_config::{ContainerConfig, Scenario};
use olc_core::{MIN_HOST_STACK_SIZE, required_stack_size};

#[derive(Args)]
pub struct ValidateArgs {
    /// Container config or scenario file (TOML)
    pub file: PathBuf,

    /// Treat the file as a scenario
    #[arg(long)]
    pub scenario: bool,
}

/// Run the validate command.
pub fn run(args: ValidateArgs) -> anyhow::Result<()> {
    let config = if args.scenario {
        let scenario = Scenario::load(&args.file)
            .with_context(|| format!("failed to load scenario {}", args.file.display()))?;
        scenario
            .validate()
            .with_context(|| format!("{} is not a valid scenario", args.file.display()))?;
        println!("Scenario:    {}", scenario.name);
        println!("Steps:       {}", scenario.steps.len());
        println!(
            "Expectations: {}",
            scenario.steps.iter().filter(|s| s.expect.is_some()).count()
        );
        scenario.container
    } else {
        let config = ContainerConfig::load(&args.file)
            .with_context(|| format!("failed to load config {}", args.file.display()))?;
        config
            .validate()
            .with_context(|| format!("{} is not a valid container config", args.file.display()))?;
        config
    };

    print_config(&config);
    println!();
    println!("{} is valid", args.file.display());
    Ok(())
}

fn print_config(config: &ContainerConfig) {
    let stack = required_stack_size(config.configured_stack_size);
    println!("Log id:      0x{:X}", config.log_id);
    println!("Container:   0x{:X}", config.container_id);
    println!(
        "Stack:       {stack} bytes (thread spawned with {})",
        stack.max(MIN_HOST_STACK_SIZE)
    );
    match config.configured_thread_priority {
        Some(p) => println!("Priority:    {p} (configured)"),
        None => println!("Priority:    from table, floor {}", config.floor_thread_priority),
    }
    for row in &config.priority_table {
        println!("  <= {:>6} us -> {}", row.max_frame_us, row.priority);
    }
    println!(
        "Queues:      data {}, command {}, system {}",
        config.data_queue_capacity, config.command_queue_capacity, config.system_queue_capacity
    );
}
