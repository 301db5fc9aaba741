//! KDL configuration for quantum-merge.
//!
//! This crate handles:
//! - Parsing `quantum.kdl` into [`Settings`]
//! - Locating the config file and applying `QUANTUM_MERGE_*` overrides
//! - Variable interpolation for executor commands

pub mod error;
pub mod settings;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use settings::{
    ENV_PREFIX, ExecutorSettings, MAX_QUEUE_CAPACITY, LoadedSettings, SchedulerSettings, ServerSettings, Settings,
    load, parse_duration, parse_settings,
};
pub use variables::{VariableContext, VariableContextBuilder};
