//! # Watch Configuration
//!
//! Loads and validates `watches.yaml`: one entry per reconciled kind naming
//! the automation target and the watch behaviour for that kind.
//!
//! ```yaml
//! - version: v1alpha1
//!   group: cache.example.com
//!   kind: Memcached
//!   role: memcached
//!   reconcilePeriod: 30m
//!   blacklist:
//!     - group: ""
//!       version: v1
//!       kind: Secret
//!   finalizer:
//!     name: cache.example.com/finalizer
//!     vars:
//!       state: absent
//! ```

use crate::config::duration::parse_kubernetes_duration;
use crate::controller::kind::ResourceKind;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum WatchConfigError {
    #[error("failed to read watches file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse watches file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("watch entry {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("{kind}: exactly one of role or playbook must be set")]
    AmbiguousTarget { kind: ResourceKind },
    #[error("{kind}: {target} not found (looked in {searched})")]
    TargetNotFound {
        kind: ResourceKind,
        target: String,
        searched: String,
    },
    #[error("{kind}: invalid {field}: {message}")]
    InvalidValue {
        kind: ResourceKind,
        field: &'static str,
        message: String,
    },
    #[error("duplicate watch for {0}")]
    Duplicate(ResourceKind),
}

/// What the runner executes for a kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutomationTarget {
    /// A role directory; the runner gets its name and the directory holding it
    Role { name: String, path: PathBuf },
    Playbook(PathBuf),
}

impl AutomationTarget {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            AutomationTarget::Role { name, .. } => format!("role {name}"),
            AutomationTarget::Playbook(path) => format!("playbook {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizerConfig {
    pub name: String,
    /// The watch's own target when the finalizer names none
    pub target: AutomationTarget,
    pub vars: Map<String, Value>,
}

/// A validated watch entry
#[derive(Debug, Clone, PartialEq)]
pub struct WatchConfig {
    pub kind: ResourceKind,
    pub target: AutomationTarget,
    pub vars: Map<String, Value>,
    pub max_concurrent_reconciles: usize,
    pub reconcile_period: Duration,
    pub manage_status: bool,
    /// Label selector rendered in `key=value,key in (a,b)` form
    pub selector: Option<String>,
    pub watch_dependent_resources: bool,
    pub watch_cluster_scoped_resources: bool,
    pub ignore_list: Vec<ResourceKind>,
    pub watch_annotations_changes: bool,
    pub snake_case_parameters: bool,
    pub ansible_verbosity: u8,
    pub finalizer: Option<FinalizerConfig>,
}

/// Process-wide values used where a watch entry leaves one unset
#[derive(Debug, Clone, Copy)]
pub struct WatchDefaults {
    pub max_concurrent_reconciles: usize,
    pub reconcile_period: Duration,
    pub ansible_verbosity: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawWatch {
    #[serde(default)]
    group: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    kind: String,
    role: Option<String>,
    playbook: Option<String>,
    #[serde(default)]
    vars: Map<String, Value>,
    max_concurrent_reconciles: Option<usize>,
    reconcile_period: Option<String>,
    #[serde(default = "default_true")]
    manage_status: bool,
    selector: Option<LabelSelector>,
    #[serde(default = "default_true")]
    watch_dependent_resources: bool,
    #[serde(default)]
    watch_cluster_scoped_resources: bool,
    #[serde(default, alias = "ignoreList")]
    blacklist: Vec<RawKind>,
    #[serde(default, alias = "annotationWatchesEnabled")]
    watch_annotations_changes: bool,
    #[serde(default = "default_true")]
    snake_case_parameters: bool,
    ansible_verbosity: Option<u8>,
    finalizer: Option<RawFinalizer>,
}

#[derive(Debug, Deserialize)]
struct RawKind {
    #[serde(default)]
    group: String,
    #[serde(default)]
    version: String,
    kind: String,
}

#[derive(Debug, Deserialize)]
struct RawFinalizer {
    #[serde(default)]
    name: String,
    role: Option<String>,
    playbook: Option<String>,
    #[serde(default)]
    vars: Map<String, Value>,
}

fn default_true() -> bool {
    true
}

/// Load and validate the watches file at `path`.
///
/// Relative playbook paths and the fallback `roles/` directory are resolved
/// against the directory holding the file.
pub fn load(path: &Path, defaults: WatchDefaults) -> Result<Vec<WatchConfig>, WatchConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| WatchConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let watches = load_from_str(&contents, base_dir, defaults)?;
    info!(
        "Loaded {} watch(es) from {}",
        watches.len(),
        path.display()
    );
    Ok(watches)
}

pub fn load_from_str(
    contents: &str,
    base_dir: &Path,
    defaults: WatchDefaults,
) -> Result<Vec<WatchConfig>, WatchConfigError> {
    let raw: Vec<RawWatch> = serde_yaml::from_str(contents)?;
    let mut seen = HashSet::new();
    let mut watches = Vec::with_capacity(raw.len());

    for (index, entry) in raw.into_iter().enumerate() {
        let watch = validate(index, entry, base_dir, defaults)?;
        if !seen.insert(watch.kind.clone()) {
            return Err(WatchConfigError::Duplicate(watch.kind));
        }
        debug!(gvk = %watch.kind, automation = %watch.target.describe(), "Watch entry validated");
        watches.push(watch);
    }
    Ok(watches)
}

fn validate(
    index: usize,
    raw: RawWatch,
    base_dir: &Path,
    defaults: WatchDefaults,
) -> Result<WatchConfig, WatchConfigError> {
    if raw.version.is_empty() {
        return Err(WatchConfigError::MissingField { index, field: "version" });
    }
    if raw.kind.is_empty() {
        return Err(WatchConfigError::MissingField { index, field: "kind" });
    }
    let kind = ResourceKind::new(&raw.group, &raw.version, &raw.kind);

    let target = resolve_target(&kind, raw.role.as_deref(), raw.playbook.as_deref(), base_dir)?
        .ok_or_else(|| WatchConfigError::AmbiguousTarget { kind: kind.clone() })?;

    let reconcile_period = match raw.reconcile_period.as_deref() {
        Some(period) => parse_kubernetes_duration(period).map_err(|e| {
            WatchConfigError::InvalidValue {
                kind: kind.clone(),
                field: "reconcilePeriod",
                message: e.to_string(),
            }
        })?,
        None => defaults.reconcile_period,
    };

    let max_concurrent_reconciles = raw
        .max_concurrent_reconciles
        .or_else(|| env_override(&kind, "MAX_CONCURRENT_RECONCILES"))
        .unwrap_or(defaults.max_concurrent_reconciles);
    if max_concurrent_reconciles == 0 {
        return Err(WatchConfigError::InvalidValue {
            kind,
            field: "maxConcurrentReconciles",
            message: "must be at least 1".to_string(),
        });
    }
    let ansible_verbosity = raw
        .ansible_verbosity
        .or_else(|| env_override(&kind, "ANSIBLE_VERBOSITY"))
        .unwrap_or(defaults.ansible_verbosity);

    let selector = raw
        .selector
        .as_ref()
        .map(render_selector)
        .transpose()
        .map_err(|message| WatchConfigError::InvalidValue {
            kind: kind.clone(),
            field: "selector",
            message,
        })?
        .filter(|s| !s.is_empty());

    let finalizer = raw
        .finalizer
        .map(|f| validate_finalizer(&kind, f, &target, base_dir))
        .transpose()?;

    Ok(WatchConfig {
        ignore_list: raw
            .blacklist
            .into_iter()
            .map(|k| ResourceKind::new(&k.group, &k.version, &k.kind))
            .collect(),
        kind,
        target,
        vars: raw.vars,
        max_concurrent_reconciles,
        reconcile_period,
        manage_status: raw.manage_status,
        selector,
        watch_dependent_resources: raw.watch_dependent_resources,
        watch_cluster_scoped_resources: raw.watch_cluster_scoped_resources,
        watch_annotations_changes: raw.watch_annotations_changes,
        snake_case_parameters: raw.snake_case_parameters,
        ansible_verbosity,
        finalizer,
    })
}

fn validate_finalizer(
    kind: &ResourceKind,
    raw: RawFinalizer,
    main_target: &AutomationTarget,
    base_dir: &Path,
) -> Result<FinalizerConfig, WatchConfigError> {
    if raw.name.is_empty() {
        return Err(WatchConfigError::InvalidValue {
            kind: kind.clone(),
            field: "finalizer",
            message: "name is required".to_string(),
        });
    }
    let target = resolve_target(kind, raw.role.as_deref(), raw.playbook.as_deref(), base_dir)?;
    if target.is_none() && raw.vars.is_empty() {
        return Err(WatchConfigError::InvalidValue {
            kind: kind.clone(),
            field: "finalizer",
            message: "one of role, playbook or vars is required".to_string(),
        });
    }
    Ok(FinalizerConfig {
        name: raw.name,
        target: target.unwrap_or_else(|| main_target.clone()),
        vars: raw.vars,
    })
}

/// `Ok(None)` when neither role nor playbook is set
fn resolve_target(
    kind: &ResourceKind,
    role: Option<&str>,
    playbook: Option<&str>,
    base_dir: &Path,
) -> Result<Option<AutomationTarget>, WatchConfigError> {
    match (role, playbook) {
        (Some(_), Some(_)) => Err(WatchConfigError::AmbiguousTarget { kind: kind.clone() }),
        (None, None) => Ok(None),
        (None, Some(playbook)) => {
            let path = absolute(base_dir, playbook);
            if path.is_file() {
                Ok(Some(AutomationTarget::Playbook(path)))
            } else {
                Err(WatchConfigError::TargetNotFound {
                    kind: kind.clone(),
                    target: format!("playbook {playbook}"),
                    searched: path.display().to_string(),
                })
            }
        }
        (Some(role), None) => {
            let candidates = role_candidates(role, base_dir);
            candidates
                .iter()
                .find(|path| path.is_dir())
                .map(|path| {
                    Some(AutomationTarget::Role {
                        name: path
                            .file_name()
                            .map_or_else(|| role.to_string(), |n| n.to_string_lossy().into_owned()),
                        path: path.clone(),
                    })
                })
                .ok_or_else(|| WatchConfigError::TargetNotFound {
                    kind: kind.clone(),
                    target: format!("role {role}"),
                    searched: candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", "),
                })
        }
    }
}

/// Absolute role paths are used as-is; names are looked up in
/// `ANSIBLE_ROLES_PATH` and then in `roles/` next to the watches file
fn role_candidates(role: &str, base_dir: &Path) -> Vec<PathBuf> {
    let as_path = Path::new(role);
    if as_path.is_absolute() {
        return vec![as_path.to_path_buf()];
    }
    let mut candidates: Vec<PathBuf> = std::env::var("ANSIBLE_ROLES_PATH")
        .unwrap_or_default()
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(role))
        .collect();
    candidates.push(base_dir.join("roles").join(role));
    candidates
}

fn absolute(base_dir: &Path, path: &str) -> PathBuf {
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Per-kind override such as `MAX_CONCURRENT_RECONCILES_MEMCACHED_CACHE_EXAMPLE_COM`
fn env_override<T: std::str::FromStr>(kind: &ResourceKind, prefix: &str) -> Option<T> {
    std::env::var(env_override_name(kind, prefix))
        .ok()
        .and_then(|v| v.trim().parse().ok())
}

fn env_override_name(kind: &ResourceKind, prefix: &str) -> String {
    let group = kind.group.replace(['.', '-'], "_");
    format!("{}_{}_{}", prefix, kind.kind, group).to_uppercase()
}

/// Render a label selector in the query-string form the API server accepts
fn render_selector(selector: &LabelSelector) -> Result<String, String> {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    for requirement in selector.match_expressions.iter().flatten() {
        let values = requirement.values.clone().unwrap_or_default();
        let key = &requirement.key;
        let part = match requirement.operator.as_str() {
            "In" | "NotIn" if values.is_empty() => {
                return Err(format!("{} on {key} needs at least one value", requirement.operator));
            }
            "In" => format!("{key} in ({})", values.join(",")),
            "NotIn" => format!("{key} notin ({})", values.join(",")),
            "Exists" => key.clone(),
            "DoesNotExist" => format!("!{key}"),
            other => return Err(format!("unsupported operator {other}")),
        };
        parts.push(part);
    }
    Ok(parts.join(","))
}
