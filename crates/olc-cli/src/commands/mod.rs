//! CLI command implementations.

pub mod opcodes;
pub mod run;
pub mod validate;
