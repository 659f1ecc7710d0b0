//! # Observability
//!
//! Prometheus metrics collection. Tracing setup lives in runtime initialization.

pub mod metrics;

pub use metrics::*;
