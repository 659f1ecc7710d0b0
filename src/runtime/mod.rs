//! # Runtime
//!
//! Process wiring around the reconcile core.
//!
//! - `initialization`: start-up of the proxy, servers and reconcilers
//! - `registrar`: dependent watches requested by the proxy
//! - `watch_loop`: one controller per watched kind and scope
//! - `error_policy`: requeue with per-object backoff

pub mod error_policy;
pub mod initialization;
pub mod registrar;
pub mod watch_loop;

pub use initialization::{InitializationResult, PrimaryController, initialize};
pub use watch_loop::run_watch_loop;
