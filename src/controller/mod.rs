//! # Controller
//!
//! Core modules of the operator runtime.
//!
//! - `backoff`: exponential error backoff per reconciled object
//! - `controller_map`: registry of per-kind controller state
//! - `identity`: owner identity carried in proxy credentials
//! - `kind`: group/version/kind keys and REST mappings
//! - `kubeconfig`: per-reconcile kubeconfig pointing at the proxy
//! - `proxy`: owner-injecting, caching API proxy
//! - `reconciler`: the reconcile cycle
//! - `runner`: automation process and its event stream
//! - `server`: HTTP server for metrics and health checks

pub mod backoff;
pub mod controller_map;
pub mod identity;
pub mod kind;
pub mod kubeconfig;
pub mod proxy;
pub mod reconciler;
pub mod runner;
pub mod server;
