//! Dispatch table listing.

use clap::Args;
use olc_core::handled_opcodes;

#[derive(Args)]
pub struct OpcodesArgs {
    /// Print as a JSON array
    #[arg(long)]
    json: bool,
}

/// Opcode names in dispatch-table order.
pub fn opcode_names() -> Vec<&'static str> {
    handled_opcodes().map(|op| op.name()).collect()
}

/// Run the opcodes command.
pub fn run(args: OpcodesArgs) -> anyhow::Result<()> {
    let names = opcode_names();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&names)?);
        return Ok(());
    }

    println!("Handled opcodes ({}):", names.len());
    println!();
    for (i, name) in names.iter().enumerate() {
        println!("  {:>2}  {name}", i + 1);
    }
    println!();
    println!("Anything else is acknowledged UNSUPPORTED.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_has_no_duplicates() {
        let mut names = opcode_names();
        let total = names.len();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn table_starts_with_gpr_and_includes_lifecycle() {
        let names = opcode_names();
        assert_eq!(names.first(), Some(&"GPR"));
        for op in ["GRAPH_OPEN", "GRAPH_START", "GRAPH_CLOSE", "DESTROY_CONTAINER"] {
            assert!(names.contains(&op), "missing {op}");
        }
    }
}
