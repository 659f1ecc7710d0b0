//! # Prelude
//!
//! Re-exports commonly used types and traits.
//!
//! ```rust
//! use ansible_operator::prelude::*;
//! ```

pub use crate::config::{AutomationTarget, ControllerConfig, WatchConfig, WatchConfigError};

pub use crate::controller::controller_map::{
    ControllerMap, ControllerMapEntry, ControllerMapError, EnqueueHandler, WatchChannel,
    WatchRegistrar,
};
pub use crate::controller::identity::{IdentityError, OwnerIdentity};
pub use crate::controller::kind::{ApiMapping, ResourceKind};
pub use crate::controller::kubeconfig::{KubeconfigError, ProxyKubeconfig};

pub use crate::controller::proxy::{ProxyError, ProxyState, ReadCache, RestMapper, Upstream};

pub use crate::controller::reconciler::{
    ClusterEvent, EventPublisher, ReconcileOutcome, Reconciler, ReconcilerError, ResourceClient,
    reconcile,
};
pub use crate::controller::runner::{
    AnsibleResult, EventLevel, RunHandle, RunRequest, RunSummary, Runner, RunnerError,
};
