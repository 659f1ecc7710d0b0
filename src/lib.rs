//! Ansible Operator Library
//!
//! Runtime for operators whose reconcile logic is Ansible automation. Each
//! reconcile runs the configured role or playbook with a kubeconfig that
//! points at an intercepting API proxy; the proxy stamps created objects with
//! ownership of the reconciled resource and starts watches on the kinds it
//! sees, so changes to owned objects trigger the owner again.
//!
//! ## Quick Start
//!
//! ```rust
//! use ansible_operator::prelude::*;
//! ```

pub mod config;
pub mod constants;
pub mod controller;
pub mod observability;
pub mod prelude;
pub mod runtime;
