//! Container configuration file.
//!
//! A [`ContainerConfig`] is the TOML form of [`OlcParams`]. Every field is
//! optional in the file and falls back to the engine defaults.
//!
//! ```toml
//! log_id = 2
//! container_id = 0x4001
//! floor_thread_priority = 90
//! reclaim_timeout_ms = 50
//!
//! [[priority_table]]
//! max_frame_us = 1000
//! priority = 220
//! ```

use std::path::Path;
use std::time::Duration;

use olc_core::{OlcParams, PriorityEntry};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::validation::{ValidationResult, validate_config};

/// One row of the frame duration to thread priority table.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PriorityConfig {
    /// Largest frame duration covered by this row.
    pub max_frame_us: u32,
    /// Priority for those frames.
    pub priority: i32,
}

impl From<PriorityEntry> for PriorityConfig {
    fn from(entry: PriorityEntry) -> Self {
        Self {
            max_frame_us: entry.max_frame_us,
            priority: entry.priority,
        }
    }
}

impl From<PriorityConfig> for PriorityEntry {
    fn from(row: PriorityConfig) -> Self {
        Self {
            max_frame_us: row.max_frame_us,
            priority: row.priority,
        }
    }
}

/// Creation parameters of one offload container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContainerConfig {
    /// Log id, used in queue and thread names.
    #[serde(default = "default_log_id")]
    pub log_id: u32,

    /// Container instance id.
    #[serde(default = "default_container_id")]
    pub container_id: u32,

    /// Host processor domain.
    #[serde(default = "default_host_domain_id")]
    pub host_domain_id: u32,

    /// Requested stack size in bytes; 0 selects the base stack.
    #[serde(default)]
    pub configured_stack_size: usize,

    /// Forces the thread priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configured_thread_priority: Option<i32>,

    /// Priority used when nothing runs.
    #[serde(default = "default_floor_thread_priority")]
    pub floor_thread_priority: i32,

    /// Bound on waiting for lent output buffers at port teardown.
    #[serde(default = "default_reclaim_timeout_ms")]
    pub reclaim_timeout_ms: u64,

    /// Capacity of every port data queue.
    #[serde(default = "default_data_queue_capacity")]
    pub data_queue_capacity: usize,

    /// Capacity of the command queue.
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    /// Capacity of the system queue.
    #[serde(default = "default_system_queue_capacity")]
    pub system_queue_capacity: usize,

    /// Frame duration to priority table, ascending in `max_frame_us`.
    #[serde(default = "default_priority_table")]
    pub priority_table: Vec<PriorityConfig>,
}

fn default_log_id() -> u32 {
    OlcParams::default().log_id
}

fn default_container_id() -> u32 {
    OlcParams::default().container_id
}

fn default_host_domain_id() -> u32 {
    OlcParams::default().host_domain_id
}

fn default_floor_thread_priority() -> i32 {
    OlcParams::default().floor_thread_priority
}

fn default_reclaim_timeout_ms() -> u64 {
    OlcParams::default().reclaim_timeout.as_millis() as u64
}

fn default_data_queue_capacity() -> usize {
    OlcParams::default().data_queue_capacity
}

fn default_command_queue_capacity() -> usize {
    OlcParams::default().command_queue_capacity
}

fn default_system_queue_capacity() -> usize {
    OlcParams::default().system_queue_capacity
}

fn default_priority_table() -> Vec<PriorityConfig> {
    olc_core::pm::default_priority_table()
        .into_iter()
        .map(PriorityConfig::from)
        .collect()
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::from(&OlcParams::default())
    }
}

impl From<&OlcParams> for ContainerConfig {
    fn from(params: &OlcParams) -> Self {
        Self {
            log_id: params.log_id,
            container_id: params.container_id,
            host_domain_id: params.host_domain_id,
            configured_stack_size: params.configured_stack_size,
            configured_thread_priority: params.configured_thread_priority,
            floor_thread_priority: params.floor_thread_priority,
            reclaim_timeout_ms: params.reclaim_timeout.as_millis() as u64,
            data_queue_capacity: params.data_queue_capacity,
            command_queue_capacity: params.command_queue_capacity,
            system_queue_capacity: params.system_queue_capacity,
            priority_table: params
                .priority_table
                .iter()
                .copied()
                .map(PriorityConfig::from)
                .collect(),
        }
    }
}

impl ContainerConfig {
    /// Configuration with the engine defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the log id.
    pub fn with_log_id(mut self, log_id: u32) -> Self {
        self.log_id = log_id;
        self
    }

    /// Set the container instance id.
    pub fn with_container_id(mut self, id: u32) -> Self {
        self.container_id = id;
        self
    }

    /// Set the host domain id.
    pub fn with_host_domain_id(mut self, id: u32) -> Self {
        self.host_domain_id = id;
        self
    }

    /// Set the requested stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.configured_stack_size = bytes;
        self
    }

    /// Force a thread priority.
    pub fn with_thread_priority(mut self, priority: i32) -> Self {
        self.configured_thread_priority = Some(priority);
        self
    }

    /// Set the floor priority.
    pub fn with_floor_priority(mut self, priority: i32) -> Self {
        self.floor_thread_priority = priority;
        self
    }

    /// Replace the priority table.
    pub fn with_priority_table(mut self, table: Vec<PriorityConfig>) -> Self {
        self.priority_table = table;
        self
    }

    /// Set the buffer reclaim timeout.
    pub fn with_reclaim_timeout_ms(mut self, ms: u64) -> Self {
        self.reclaim_timeout_ms = ms;
        self
    }

    /// Set the data queue capacity.
    pub fn with_data_queue_capacity(mut self, capacity: usize) -> Self {
        self.data_queue_capacity = capacity;
        self
    }

    /// Set the command and system queue capacities.
    pub fn with_control_queue_capacity(mut self, command: usize, system: usize) -> Self {
        self.command_queue_capacity = command;
        self.system_queue_capacity = system;
        self
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        let config: ContainerConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Save the configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))?;
        Ok(())
    }

    /// Convert the configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check every rule; see [`crate::validation`].
    pub fn validate(&self) -> ValidationResult<()> {
        validate_config(self)
    }

    /// Engine parameters for this configuration.
    pub fn to_params(&self) -> OlcParams {
        let mut params = OlcParams::default()
            .with_log_id(self.log_id)
            .with_container_id(self.container_id)
            .with_host_domain_id(self.host_domain_id)
            .with_stack_size(self.configured_stack_size)
            .with_floor_priority(self.floor_thread_priority)
            .with_priority_table(self.priority_table.iter().copied().map(PriorityEntry::from).collect())
            .with_reclaim_timeout(Duration::from_millis(self.reclaim_timeout_ms))
            .with_data_queue_capacity(self.data_queue_capacity)
            .with_control_queue_capacity(self.command_queue_capacity, self.system_queue_capacity);
        params.configured_thread_priority = self.configured_thread_priority;
        params
    }

    /// Validate, then convert.
    pub fn into_params(self) -> Result<OlcParams, ConfigError> {
        self.validate()?;
        Ok(self.to_params())
    }
}
