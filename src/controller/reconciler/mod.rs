//! # Reconciler
//!
//! Drives one automation run per reconcile of a watched object.
//!
//! - `client`: reads and writes on the primary resource
//! - `events`: cluster events for surfaced tasks and failures
//! - `reconcile`: the reconcile cycle itself
//! - `status`: `status.conditions` bookkeeping
//! - `types`: outcome classification and the reconcile context

pub mod client;
pub mod events;
pub mod reconcile;
pub mod status;
pub mod types;

pub use client::{KubeResourceClient, ResourceClient};
pub use events::{ClusterEvent, EventPublisher, KubeEventPublisher, Severity};
pub use reconcile::{backoff_key, reconcile};
pub use types::{ReconcileOutcome, Reconciler, ReconcilerError};
