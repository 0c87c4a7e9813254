pub mod config;
pub mod types;

pub use config::{ClusterSeed, ConfigError, ControllerConfig, DaemonConfig, Rounding};
pub use types::*;
