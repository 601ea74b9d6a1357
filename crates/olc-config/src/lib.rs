//! Configuration and scripted scenarios for the offload container.
//!
//! # Features
//!
//! - **Container configuration**: [`ContainerConfig`] is the TOML form of
//!   [`olc_core::OlcParams`], with engine defaults for every missing field
//! - **Validation**: queue capacities, priority table order and stack size
//! - **Scenarios**: [`Scenario`] scripts drive a container against the
//!   loopback satellite, step by step, with expected ack statuses
//!
//! # Example
//!
//! ```rust,no_run
//! use olc_config::{ContainerConfig, Scenario};
//!
//! let config = ContainerConfig::load("olc.toml").unwrap();
//! config.validate().unwrap();
//! let params = config.to_params();
//!
//! let scenario = Scenario::load("start_stop.toml").unwrap();
//! let satellite = scenario.satellite.build();
//! ```

mod container;
mod error;

/// Container configuration validation.
pub mod validation;

/// Scripted scenarios.
pub mod scenario;

pub use container::{ContainerConfig, PriorityConfig};
pub use error::ConfigError;
pub use scenario::{Action, SatelliteConfig, Scenario, StatusSpec, Step};
pub use validation::{ValidationError, ValidationResult, validate_config, validate_priority_table};
