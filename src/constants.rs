//! # Constants
//!
//! Default values and well-known names shared across the operator.

/// Default port for the intercepting API proxy (bound on localhost only)
pub const DEFAULT_PROXY_PORT: u16 = 8888;

/// Default port for the metrics and health server
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default location of the watch configuration file
pub const DEFAULT_WATCHES_FILE: &str = "./watches.yaml";

/// Default periodic re-reconcile interval
pub const DEFAULT_RECONCILE_PERIOD: &str = "10h";

/// Default hard timeout for a single automation run
pub const DEFAULT_RUNNER_TIMEOUT: &str = "1h";

/// Default `-v` count passed to ansible-runner
pub const DEFAULT_ANSIBLE_VERBOSITY: u8 = 2;

/// Default max age of cache entries for kinds without an active watch
pub const DEFAULT_PROXY_CACHE_TTL_SECS: u64 = 30;

/// Name of the runner executable looked up on `PATH`
pub const DEFAULT_RUNNER_BIN: &str = "ansible-runner";

/// Field manager / reporter name used for writes made by the operator itself
pub const OPERATOR_NAME: &str = "ansible-operator";

/// Annotation pointing a child at its primary resource (`{namespace}/{name}`)
/// when an owner reference cannot be used
pub const PRIMARY_RESOURCE_ANNOTATION: &str = "operator-sdk/primary-resource";

/// Annotation carrying the primary resource type (`{Kind}.{group}`)
pub const PRIMARY_RESOURCE_TYPE_ANNOTATION: &str = "operator-sdk/primary-resource-type";

/// Path the runner HTTP event plugin posts to
pub const RUNNER_EVENTS_PATH: &str = "/events/";

/// Password placed in generated kubeconfigs; the proxy ignores it
pub const PROXY_PASSWORD_PLACEHOLDER: &str = "unused";

/// Error backoff bounds for failed reconciles
pub const ERROR_BACKOFF_START_SECS: u64 = 5;
pub const ERROR_BACKOFF_MAX_SECS: u64 = 300;
