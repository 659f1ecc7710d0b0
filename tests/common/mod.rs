//! Shared fakes for the scenario tests
//!
//! Stand-ins for the API server, discovery, the runner and the cluster
//! event sink, so the proxy and the reconcile cycle can run in-process.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use ansible_operator::config::{AutomationTarget, WatchConfig};
use ansible_operator::controller::controller_map::{
    ControllerMap, ControllerMapEntry, EnqueueHandler, WatchRegistrar,
};
use ansible_operator::controller::identity::OwnerIdentity;
use ansible_operator::controller::kind::{ApiMapping, ResourceKind};
use ansible_operator::controller::proxy::{ProxyState, ReadCache, RestMapper, Upstream};
use ansible_operator::controller::reconciler::{
    ClusterEvent, EventPublisher, Reconciler, ResourceClient,
};
use ansible_operator::controller::runner::{
    EventLevel, JobEvent, RunExit, RunHandle, RunRequest, Runner, RunnerError,
};
use anyhow::anyhow;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::Request;
use axum::http::{Response, StatusCode, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use kube::api::DynamicObject;
use serde_json::{Map, Value, json};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub fn memcached_kind() -> ResourceKind {
    ResourceKind::new("cache.example.com", "v1alpha1", "Memcached")
}

/// A `Memcached` as the API server would return it
pub fn memcached(generation: i64) -> DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "cache.example.com/v1alpha1",
        "kind": "Memcached",
        "metadata": {
            "name": "example",
            "namespace": "default",
            "uid": "6f1c3b2e-0000-4000-8000-000000000001",
            "generation": generation,
            "resourceVersion": "100"
        },
        "spec": {"size": 3}
    }))
    .unwrap()
}

pub fn memcached_identity() -> OwnerIdentity {
    OwnerIdentity::for_resource(&memcached(1)).unwrap()
}

/// `Authorization` header value the automation sends for `identity`
pub fn basic_auth(identity: &OwnerIdentity) -> String {
    let credentials = format!("{}:unused", identity.encode().unwrap());
    format!("Basic {}", STANDARD.encode(credentials))
}

/// Discovery with a fixed set of kinds
#[derive(Debug)]
pub struct FakeMapper {
    mappings: Vec<ApiMapping>,
}

impl FakeMapper {
    pub fn new() -> Self {
        let mapping =
            |group: &str, version: &str, kind: &str, plural: &str, namespaced: bool| ApiMapping {
                kind: ResourceKind::new(group, version, kind),
                plural: plural.to_string(),
                namespaced,
            };
        Self {
            mappings: vec![
                mapping("cache.example.com", "v1alpha1", "Memcached", "memcacheds", true),
                mapping("", "v1", "ConfigMap", "configmaps", true),
                mapping("", "v1", "Secret", "secrets", true),
                mapping("", "v1", "Namespace", "namespaces", false),
            ],
        }
    }

    /// Discovery that has lost track of `kind`
    pub fn without(kind: &str) -> Self {
        let mut mapper = Self::new();
        mapper.mappings.retain(|m| m.kind.kind != kind);
        mapper
    }
}

#[async_trait]
impl RestMapper for FakeMapper {
    async fn mapping_for_resource(
        &self,
        group: &str,
        version: &str,
        resource: &str,
    ) -> anyhow::Result<ApiMapping> {
        self.mappings
            .iter()
            .find(|m| m.kind.group == group && m.kind.version == version && m.plural == resource)
            .cloned()
            .ok_or_else(|| anyhow!("unknown resource {group}/{version}/{resource}"))
    }

    async fn mapping_for_kind(&self, kind: &ResourceKind) -> anyhow::Result<ApiMapping> {
        self.mappings
            .iter()
            .find(|m| m.kind.same_group_kind(kind))
            .cloned()
            .ok_or_else(|| anyhow!("unknown kind {kind}"))
    }
}

/// What the API server received
#[derive(Debug, Clone)]
pub struct ForwardedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
    pub body: Option<Value>,
}

/// API server that echoes written objects back, or answers with a canned
/// response when one is set
#[derive(Debug, Default)]
pub struct FakeUpstream {
    pub requests: Mutex<Vec<ForwardedRequest>>,
    pub canned: Mutex<Option<(StatusCode, Value)>>,
}

impl FakeUpstream {
    pub fn respond_with(&self, status: StatusCode, body: Value) {
        *self.canned.lock().unwrap() = Some((status, body));
    }

    pub fn forwarded(&self) -> Vec<ForwardedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn send(&self, request: Request) -> anyhow::Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await?;
        let body: Option<Value> = serde_json::from_slice(&bytes).ok();
        self.requests.lock().unwrap().push(ForwardedRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            authorization: parts
                .headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            body: body.clone(),
        });

        let (status, reply) = match self.canned.lock().unwrap().clone() {
            Some(canned) => canned,
            None if parts.method == "POST" => (StatusCode::CREATED, body.unwrap_or(Value::Null)),
            None => (StatusCode::OK, body.unwrap_or_else(|| json!({}))),
        };
        Ok(Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(reply.to_string()))?)
    }
}

/// Registrar that records each requested watch
#[derive(Debug, Default)]
pub struct RecordingRegistrar {
    pub registered: Mutex<Vec<(ResourceKind, EnqueueHandler)>>,
}

impl RecordingRegistrar {
    pub fn kinds(&self) -> Vec<String> {
        self.registered
            .lock()
            .unwrap()
            .iter()
            .map(|(kind, _)| kind.kind.clone())
            .collect()
    }
}

impl WatchRegistrar for RecordingRegistrar {
    fn register_dynamic_watch(
        &self,
        dependent: &ApiMapping,
        handler: EnqueueHandler,
    ) -> anyhow::Result<()> {
        self.registered
            .lock()
            .unwrap()
            .push((dependent.kind.clone(), handler));
        Ok(())
    }
}

/// Controller map with `Memcached` registered and `ignore_list` applied
pub fn memcached_controllers(
    ignore_list: Vec<ResourceKind>,
) -> (ControllerMap, Arc<RecordingRegistrar>) {
    memcached_controllers_with(ignore_list, false)
}

/// As [`memcached_controllers`], optionally watching cluster-scoped and
/// cross-namespace children
pub fn memcached_controllers_with(
    ignore_list: Vec<ResourceKind>,
    watch_cluster_scoped: bool,
) -> (ControllerMap, Arc<RecordingRegistrar>) {
    let registrar = Arc::new(RecordingRegistrar::default());
    let controllers = ControllerMap::new();
    controllers
        .store(
            memcached_kind(),
            ControllerMapEntry::new(
                Arc::clone(&registrar) as Arc<dyn WatchRegistrar>,
                true,
                watch_cluster_scoped,
            ),
            ignore_list,
        )
        .unwrap();
    (controllers, registrar)
}

pub fn proxy_state(controllers: ControllerMap, upstream: Arc<FakeUpstream>) -> Arc<ProxyState> {
    Arc::new(ProxyState {
        controllers,
        mapper: Arc::new(FakeMapper::new()),
        upstream,
        cache: Arc::new(ReadCache::new(Duration::from_secs(30))),
        inject_owner_ref: true,
    })
}

/// How a scripted run ends
#[derive(Debug, Clone, Copy)]
pub enum ScriptedExit {
    Code(i32),
    Killed,
    /// Never exits on its own
    Hang,
}

/// Runner that replays canned job events, one script per run
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<VecDeque<(Vec<JobEvent>, ScriptedExit)>>,
    pub requests: Mutex<Vec<RunRequest>>,
}

impl ScriptedRunner {
    pub fn push(&self, events: Vec<Value>, exit: ScriptedExit) {
        let events = events
            .into_iter()
            .map(|e| serde_json::from_value(e).unwrap())
            .collect();
        self.scripts.lock().unwrap().push_back((events, exit));
    }

    pub fn runs(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl Runner for ScriptedRunner {
    async fn run(&self, request: RunRequest) -> Result<RunHandle, RunnerError> {
        self.requests.lock().unwrap().push(request);
        let (events, exit) = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or((Vec::new(), ScriptedExit::Code(0)));

        let (tx, rx) = mpsc::unbounded_channel();
        for event in events {
            tx.send(event).unwrap();
        }
        drop(tx);
        let task = tokio::spawn(async move {
            match exit {
                ScriptedExit::Code(code) => Ok(RunExit { code }),
                ScriptedExit::Killed => Err(RunnerError::Killed),
                ScriptedExit::Hang => std::future::pending().await,
            }
        });
        Ok(RunHandle::new("scripted".to_string(), rx, task))
    }
}

/// The reconciled object, held in memory
#[derive(Debug)]
pub struct InMemoryResources {
    pub object: Mutex<Option<DynamicObject>>,
    pub status_patches: Mutex<Vec<Value>>,
    /// Deleted as soon as a status write happens after this many reads
    pub vanish_after_reads: Mutex<Option<usize>>,
    reads: Mutex<usize>,
}

impl InMemoryResources {
    pub fn new(object: DynamicObject) -> Self {
        Self {
            object: Mutex::new(Some(object)),
            status_patches: Mutex::new(Vec::new()),
            vanish_after_reads: Mutex::new(None),
            reads: Mutex::new(0),
        }
    }

    pub fn patches(&self) -> Vec<Value> {
        self.status_patches.lock().unwrap().clone()
    }

    pub fn conditions(&self) -> Value {
        self.object
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|o| o.data.pointer("/status/conditions").cloned())
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl ResourceClient for InMemoryResources {
    async fn get(
        &self,
        _namespace: Option<&str>,
        _name: &str,
    ) -> Result<Option<DynamicObject>, kube::Error> {
        let mut reads = self.reads.lock().unwrap();
        *reads += 1;
        if let Some(limit) = *self.vanish_after_reads.lock().unwrap() {
            if *reads > limit {
                return Ok(None);
            }
        }
        Ok(self.object.lock().unwrap().clone())
    }

    async fn patch_conditions(
        &self,
        _namespace: Option<&str>,
        _name: &str,
        conditions: Value,
    ) -> Result<(), kube::Error> {
        self.status_patches.lock().unwrap().push(conditions.clone());
        if let Some(object) = self.object.lock().unwrap().as_mut() {
            if !object.data.get("status").is_some_and(Value::is_object) {
                object.data["status"] = json!({});
            }
            object.data["status"]["conditions"] = conditions;
        }
        Ok(())
    }

    async fn set_finalizers(
        &self,
        obj: &DynamicObject,
        finalizers: Vec<String>,
    ) -> Result<DynamicObject, kube::Error> {
        let mut stored = self.object.lock().unwrap();
        let object = stored.get_or_insert_with(|| obj.clone());
        object.metadata.finalizers = Some(finalizers);
        Ok(object.clone())
    }
}

/// Event sink that records what would have been published
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    pub events: Mutex<Vec<ClusterEvent>>,
}

impl RecordingPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, _obj: &DynamicObject, event: ClusterEvent) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub fn memcached_watch() -> WatchConfig {
    WatchConfig {
        kind: memcached_kind(),
        target: AutomationTarget::Role {
            name: "memcached".to_string(),
            path: PathBuf::from("/opt/ansible/roles"),
        },
        vars: Map::new(),
        max_concurrent_reconciles: 1,
        reconcile_period: Duration::from_secs(600),
        manage_status: true,
        selector: None,
        watch_dependent_resources: true,
        watch_cluster_scoped_resources: false,
        ignore_list: Vec::new(),
        watch_annotations_changes: false,
        snake_case_parameters: true,
        ansible_verbosity: 2,
        finalizer: None,
    }
}

/// Reconcile context wired to the fakes
pub struct Harness {
    pub reconciler: Arc<Reconciler>,
    pub resources: Arc<InMemoryResources>,
    pub runner: Arc<ScriptedRunner>,
    pub events: Arc<RecordingPublisher>,
}

pub fn harness(watch: WatchConfig, object: DynamicObject) -> Harness {
    harness_with_timeout(watch, object, Duration::from_secs(30))
}

pub fn harness_with_timeout(
    watch: WatchConfig,
    object: DynamicObject,
    runner_timeout: Duration,
) -> Harness {
    let (controllers, _) = memcached_controllers(Vec::new());
    let resources = Arc::new(InMemoryResources::new(object));
    let runner = Arc::new(ScriptedRunner::default());
    let events = Arc::new(RecordingPublisher::default());
    let reconciler = Arc::new(Reconciler::new(
        watch,
        controllers,
        Arc::clone(&resources) as Arc<dyn ResourceClient>,
        Arc::clone(&runner) as Arc<dyn Runner>,
        Arc::clone(&events) as Arc<dyn EventPublisher>,
        "127.0.0.1:8888".parse().unwrap(),
        EventLevel::Tasks,
        false,
        runner_timeout,
    ));
    Harness {
        reconciler,
        resources,
        runner,
        events,
    }
}

pub fn task_ok(counter: i64, task: &str, changed: bool) -> Value {
    json!({
        "event": "runner_on_ok",
        "counter": counter,
        "event_data": {"task": task, "host": "localhost", "res": {"changed": changed}}
    })
}

pub fn task_failed(counter: i64, task: &str, msg: &str) -> Value {
    json!({
        "event": "runner_on_failed",
        "counter": counter,
        "event_data": {"task": task, "host": "localhost", "res": {"msg": msg}}
    })
}

pub fn stats(counter: i64, ok: u32, changed: u32, failures: u32) -> Value {
    json!({
        "event": "playbook_on_stats",
        "counter": counter,
        "event_data": {
            "ok": {"localhost": ok},
            "changed": {"localhost": changed},
            "failures": {"localhost": failures},
            "skipped": {"localhost": 0},
            "dark": {}
        }
    })
}
