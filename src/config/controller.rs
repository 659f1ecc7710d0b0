//! # Controller Configuration
//!
//! Process-level settings loaded from environment variables.

use crate::config::duration::parse_kubernetes_duration;
use crate::controller::runner::EventLevel;
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Process-level configuration
///
/// All settings have defaults and can be overridden via environment variables.
/// Per-kind values in the watch configuration take precedence over the
/// defaults carried here.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Watch configuration file
    pub watches_file: PathBuf,
    /// Intercepting proxy port, bound on 127.0.0.1
    pub proxy_port: u16,
    /// Metrics and health server port
    pub metrics_port: u16,
    /// Default per-kind concurrency
    pub max_concurrent_reconciles: usize,
    /// Default periodic re-reconcile interval
    pub reconcile_period: Duration,
    /// Default `-v` count passed to the runner
    pub ansible_verbosity: u8,
    /// Which task events are surfaced as cluster events
    pub event_level: EventLevel,
    /// Log the raw stdout of every job event
    pub ansible_debug_logs: bool,
    /// Extra arguments appended to the runner command line
    pub ansible_args: Vec<String>,
    /// Runner executable, resolved on `PATH` when relative
    pub runner_bin: String,
    /// Hard timeout for one automation run
    pub runner_timeout: Duration,
    /// Inject owner references and annotations into proxied writes
    pub inject_owner_ref: bool,
    /// Max age of cache entries for kinds without an active watch
    pub proxy_cache_ttl: Duration,
    /// Namespaces to watch; empty means all namespaces
    pub watch_namespaces: Vec<String>,
    /// Log format (json, text)
    pub log_format: String,
    /// Enable color in text format logs
    pub log_enable_color: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            watches_file: PathBuf::from(DEFAULT_WATCHES_FILE),
            proxy_port: DEFAULT_PROXY_PORT,
            metrics_port: DEFAULT_METRICS_PORT,
            max_concurrent_reconciles: 1,
            reconcile_period: Duration::from_secs(10 * 3600),
            ansible_verbosity: DEFAULT_ANSIBLE_VERBOSITY,
            event_level: EventLevel::Tasks,
            ansible_debug_logs: false,
            ansible_args: Vec::new(),
            runner_bin: DEFAULT_RUNNER_BIN.to_string(),
            runner_timeout: Duration::from_secs(3600),
            inject_owner_ref: true,
            proxy_cache_ttl: Duration::from_secs(DEFAULT_PROXY_CACHE_TTL_SECS),
            watch_namespaces: Vec::new(),
            log_format: "text".to_string(),
            log_enable_color: false,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            watches_file: PathBuf::from(env_var_or_default_str(
                "WATCHES_FILE",
                DEFAULT_WATCHES_FILE,
            )),
            proxy_port: env_var_or_default("PROXY_PORT", DEFAULT_PROXY_PORT),
            metrics_port: env_var_or_default("METRICS_PORT", DEFAULT_METRICS_PORT),
            max_concurrent_reconciles: env_var_or_default("MAX_CONCURRENT_RECONCILES", 1),
            reconcile_period: env_var_or_default_duration(
                "RECONCILE_PERIOD",
                DEFAULT_RECONCILE_PERIOD,
            ),
            ansible_verbosity: env_var_or_default("ANSIBLE_VERBOSITY", DEFAULT_ANSIBLE_VERBOSITY),
            event_level: EventLevel::parse(&env_var_or_default_str("ANSIBLE_LOG_EVENTS", "tasks")),
            ansible_debug_logs: env_var_or_default_bool("ANSIBLE_DEBUG_LOGS", false),
            ansible_args: split_args(&env_var_or_default_str("ANSIBLE_ARGS", "")),
            runner_bin: env_var_or_default_str("ANSIBLE_RUNNER_BIN", DEFAULT_RUNNER_BIN),
            runner_timeout: env_var_or_default_duration(
                "ANSIBLE_RUNNER_TIMEOUT",
                DEFAULT_RUNNER_TIMEOUT,
            ),
            inject_owner_ref: env_var_or_default_bool("INJECT_OWNER_REF", true),
            proxy_cache_ttl: Duration::from_secs(env_var_or_default(
                "PROXY_CACHE_TTL_SECS",
                DEFAULT_PROXY_CACHE_TTL_SECS,
            )),
            watch_namespaces: split_namespaces(&env_var_or_default_str("WATCH_NAMESPACE", "")),
            log_format: env_var_or_default_str("LOG_FORMAT", "text"),
            log_enable_color: env_var_or_default_bool("LOG_ENABLE_COLOR", false),
        }
    }

    /// Defaults applied to watch entries that leave a value unset
    #[must_use]
    pub fn watch_defaults(&self) -> crate::config::WatchDefaults {
        crate::config::WatchDefaults {
            max_concurrent_reconciles: self.max_concurrent_reconciles,
            reconcile_period: self.reconcile_period,
            ansible_verbosity: self.ansible_verbosity,
        }
    }
}

fn split_args(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn split_namespaces(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|ns| !ns.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read environment variable or return default value
pub(crate) fn env_var_or_default<T: std::str::FromStr>(key: &str, default: T) -> T
where
    <T as std::str::FromStr>::Err: std::fmt::Debug,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Read environment variable as boolean or return default
fn env_var_or_default_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let v_lower = v.to_lowercase();
            v_lower == "true" || v_lower == "1" || v_lower == "yes" || v_lower == "on"
        })
        .unwrap_or(default)
}

/// Read environment variable as string or return default
fn env_var_or_default_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Read environment variable as a duration, falling back to `default` when
/// unset or unparseable
fn env_var_or_default_duration(key: &str, default: &str) -> Duration {
    let raw = env_var_or_default_str(key, default);
    parse_kubernetes_duration(&raw)
        .or_else(|e| {
            warn!("Invalid {} '{}': {}, using {}", key, raw, e, default);
            parse_kubernetes_duration(default)
        })
        .unwrap_or(Duration::from_secs(3600))
}
