//! Container configuration validation.
//!
//! Checks run before a [`ContainerConfig`](crate::ContainerConfig) is turned
//! into [`OlcParams`](olc_core::OlcParams). Every rule is evaluated and all
//! failures are reported together.
//!
//! # Example
//!
//! ```rust
//! use olc_config::{ContainerConfig, ValidationError};
//!
//! let config = ContainerConfig::new().with_data_queue_capacity(0);
//! assert_eq!(
//!     config.validate(),
//!     Err(ValidationError::ZeroCapacity { queue: "data" })
//! );
//! ```

use olc_core::BASE_STACK_SIZE;
use thiserror::Error;

use crate::container::{ContainerConfig, PriorityConfig};

/// Validation error types.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// A queue was configured with no room.
    #[error("{queue} queue capacity must be non-zero")]
    ZeroCapacity {
        /// Which queue.
        queue: &'static str,
    },

    /// A priority table row does not cover longer frames than the one
    /// before it.
    #[error(
        "priority table not sorted: row {index} covers {max_frame_us} us, previous row covers {previous_us} us"
    )]
    UnsortedPriorityTable {
        /// Offending row.
        index: usize,
        /// Its frame bound.
        max_frame_us: u32,
        /// Frame bound of the preceding row.
        previous_us: u32,
    },

    /// A non-zero stack size below the base stack.
    #[error("stack size {configured} is below the base stack of {base} bytes")]
    StackTooSmall {
        /// Requested size.
        configured: usize,
        /// Base stack size.
        base: usize,
    },

    /// Multiple validation errors.
    #[error("multiple validation errors: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Checks that the table is strictly increasing in `max_frame_us`.
pub fn validate_priority_table(table: &[PriorityConfig]) -> ValidationResult<()> {
    for (index, pair) in table.windows(2).enumerate() {
        if pair[1].max_frame_us <= pair[0].max_frame_us {
            return Err(ValidationError::UnsortedPriorityTable {
                index: index + 1,
                max_frame_us: pair[1].max_frame_us,
                previous_us: pair[0].max_frame_us,
            });
        }
    }
    Ok(())
}

/// Runs every rule against `config`.
///
/// A stack size of 0 means "use the base stack" and is accepted.
pub fn validate_config(config: &ContainerConfig) -> ValidationResult<()> {
    let mut errors = Vec::new();

    for (queue, capacity) in [
        ("data", config.data_queue_capacity),
        ("command", config.command_queue_capacity),
        ("system", config.system_queue_capacity),
    ] {
        if capacity == 0 {
            errors.push(ValidationError::ZeroCapacity { queue });
        }
    }

    if let Err(e) = validate_priority_table(&config.priority_table) {
        errors.push(e);
    }

    if config.configured_stack_size != 0 && config.configured_stack_size < BASE_STACK_SIZE {
        errors.push(ValidationError::StackTooSmall {
            configured: config.configured_stack_size,
            base: BASE_STACK_SIZE,
        });
    }

    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(ValidationError::Multiple(errors)),
    }
}
