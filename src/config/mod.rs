//! # Configuration
//!
//! - `controller`: process-level settings from environment variables
//! - `watches`: the per-kind watch configuration file
//! - `duration`: duration strings shared by both

pub mod controller;
pub mod duration;
pub mod watches;

pub use controller::ControllerConfig;
pub use duration::parse_kubernetes_duration;
pub use watches::{
    AutomationTarget, FinalizerConfig, WatchConfig, WatchConfigError, WatchDefaults,
};
