//! # Proxy Server
//!
//! axum service the automation talks to instead of the API server. Every
//! request must carry an owner identity; requests are then classified and
//! either answered from the read cache, forwarded with owner attribution, or
//! forwarded untouched.
//!
//! Responses from the API server, errors included, are returned to the
//! automation as they came. Failures of the proxy itself are answered with a
//! Kubernetes `Status` whose message names the proxy.

use crate::controller::controller_map::ControllerMap;
use crate::controller::identity::{IdentityError, OwnerIdentity};
use crate::controller::kind::ResourceKind;
use crate::controller::proxy::cache::{CacheKey, ReadCache};
use crate::controller::proxy::inject::{self, PatchKind, WriteBody};
use crate::controller::proxy::mapper::RestMapper;
use crate::controller::proxy::path::{self, ParsedRequest, RequestInfo, Verb};
use crate::controller::proxy::watches::observe_dependent;
use crate::observability::metrics;
use anyhow::Context;
use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{Instrument, debug, info};

/// Largest request body the proxy will buffer for attribution
const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: [header::HeaderName; 4] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
];

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid owner identity: {0}")]
    IdentityDecode(#[from] IdentityError),
    #[error("cannot resolve scope of {kind}: {cause:#}")]
    ScopeResolution {
        kind: ResourceKind,
        cause: anyhow::Error,
    },
    #[error("cannot forward request: {0:#}")]
    Upstream(anyhow::Error),
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    #[error("{0}")]
    Internal(String),
}

impl ProxyError {
    fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::IdentityDecode(_) => StatusCode::UNAUTHORIZED,
            ProxyError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::ScopeResolution { .. } | ProxyError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn reason(&self) -> &'static str {
        match self {
            ProxyError::IdentityDecode(_) => "Unauthorized",
            ProxyError::InvalidBody(_) => "BadRequest",
            ProxyError::ScopeResolution { .. } | ProxyError::Internal(_) => "InternalError",
            ProxyError::Upstream(_) => "ServiceUnavailable",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> axum::response::Response {
        let code = self.status_code();
        let status = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": format!("ansible-operator proxy: {self}"),
            "reason": self.reason(),
            "code": code.as_u16(),
        });
        (
            code,
            [(header::CONTENT_TYPE, "application/json")],
            status.to_string(),
        )
            .into_response()
    }
}

/// The API server the proxy forwards to
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn send(&self, request: Request) -> anyhow::Result<Response<Body>>;
}

/// Forwards through a `kube::Client`, which supplies the operator's own
/// credentials and the cluster address
#[derive(Clone)]
pub struct KubeUpstream {
    client: kube::Client,
}

impl std::fmt::Debug for KubeUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeUpstream").finish_non_exhaustive()
    }
}

impl KubeUpstream {
    #[must_use]
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Upstream for KubeUpstream {
    async fn send(&self, request: Request) -> anyhow::Result<Response<Body>> {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES).await?;
        let request =
            axum::http::Request::from_parts(parts, kube::client::Body::from(bytes.to_vec()));
        let response = self.client.send(request).await?;
        Ok(response.map(Body::new))
    }
}

pub struct ProxyState {
    pub controllers: ControllerMap,
    pub mapper: Arc<dyn RestMapper>,
    pub upstream: Arc<dyn Upstream>,
    pub cache: Arc<ReadCache>,
    pub inject_owner_ref: bool,
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("controllers", &self.controllers.len())
            .field("cached", &self.cache.len())
            .field("inject_owner_ref", &self.inject_owner_ref)
            .finish_non_exhaustive()
    }
}

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind the proxy listener. Failing here aborts start-up.
pub async fn bind_proxy(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind API proxy on {addr}"))?;
    info!("API proxy listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Serve the proxy on a bound listener until the process exits
pub async fn start_proxy(listener: TcpListener, state: Arc<ProxyState>) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn handle(State(state): State<Arc<ProxyState>>, request: Request) -> Response<Body> {
    match proxy_request(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            debug!(error = %e, "Proxy request failed");
            e.into_response()
        }
    }
}

async fn proxy_request(state: &ProxyState, request: Request) -> Result<Response<Body>, ProxyError> {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let identity = OwnerIdentity::from_basic_auth(authorization)?;

    let query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    let info = match path::parse(request.method(), request.uri().path(), query) {
        ParsedRequest::Resource(info) => info,
        ParsedRequest::NonResource => return forward(state, request).await,
    };

    let span = tracing::span!(
        tracing::Level::DEBUG,
        "proxy.request",
        verb = info.verb.as_str(),
        resource = info.resource.as_str(),
        owner = identity.name()
    );
    metrics::increment_proxy_requests(info.verb.as_str());
    dispatch(state, &identity, &info, request)
        .instrument(span)
        .await
}

async fn dispatch(
    state: &ProxyState,
    identity: &OwnerIdentity,
    info: &RequestInfo,
    request: Request,
) -> Result<Response<Body>, ProxyError> {
    match info.verb {
        Verb::Get | Verb::List => read(state, identity, info, request).await,
        Verb::Watch => forward(state, request).await,
        Verb::Create | Verb::Update | Verb::Patch => write(state, identity, info, request).await,
        Verb::Delete | Verb::DeleteCollection => {
            let response = forward(state, request).await?;
            if response.status().is_success() {
                invalidate(state, info).await;
            }
            Ok(response)
        }
    }
}

async fn read(
    state: &ProxyState,
    identity: &OwnerIdentity,
    info: &RequestInfo,
    request: Request,
) -> Result<Response<Body>, ProxyError> {
    let mapping = state
        .mapper
        .mapping_for_resource(&info.group, &info.version, &info.resource)
        .await
        .ok();
    let key = mapping
        .as_ref()
        .filter(|_| info.is_cacheable())
        .map(|mapping| cache_key(&mapping.kind, info));

    if let Some(key) = &key {
        if let Some(cached) = state.cache.get(key) {
            metrics::increment_proxy_cache_hits();
            let mut response = Response::new(Body::from(cached.body));
            if let Some(content_type) = cached
                .content_type
                .and_then(|ct| HeaderValue::from_str(&ct).ok())
            {
                response.headers_mut().insert(header::CONTENT_TYPE, content_type);
            }
            return Ok(response);
        }
        metrics::increment_proxy_cache_misses();
    }
    let token = key.as_ref().map(|key| state.cache.token(key.kind()));

    let (parts, body) = forward(state, request).await?.into_parts();
    if !parts.status.is_success() {
        return Ok(Response::from_parts(parts, body));
    }
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Upstream(e.into()))?;

    if let (Some(key), Some(token)) = (key, token) {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if !state.cache.insert(key, bytes.clone(), content_type, token) {
            debug!("Read raced a change to its kind, response not cached");
        }
    }
    if info.verb == Verb::Get && info.subresource.is_none() {
        discover(state, identity, &bytes).await;
    }

    Ok(Response::from_parts(parts, Body::from(bytes)))
}

async fn write(
    state: &ProxyState,
    identity: &OwnerIdentity,
    info: &RequestInfo,
    request: Request,
) -> Result<Response<Body>, ProxyError> {
    let (mut parts, body) = request.into_parts();
    let mut bytes = axum::body::to_bytes(body, MAX_REQUEST_BODY_BYTES)
        .await
        .map_err(|e| ProxyError::InvalidBody(e.to_string()))?;

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let shape = match info.verb {
        Verb::Patch => PatchKind::from_content_type(&content_type).map(WriteBody::Patch),
        _ if content_type.starts_with("application/json") => Some(WriteBody::Object),
        _ => None,
    };

    if let Some(shape) = shape.filter(|_| state.inject_owner_ref && info.subresource.is_none()) {
        let owner_kind = identity.kind();
        let owner = state
            .mapper
            .mapping_for_kind(&owner_kind)
            .await
            .map_err(|cause| ProxyError::ScopeResolution {
                kind: owner_kind,
                cause,
            })?;

        let mut object = parse_body(&bytes, shape)?;
        let child_namespace = info.namespace.clone().or_else(|| {
            object
                .pointer("/metadata/namespace")
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let ownership = inject::ownership_for(
            owner.namespaced,
            &identity.namespace,
            child_namespace.as_deref(),
        );
        if inject::attribute(&mut object, identity, ownership, shape) {
            bytes = Bytes::from(
                serde_json::to_vec(&object).map_err(|e| ProxyError::Internal(e.to_string()))?,
            );
            parts.headers.remove(header::CONTENT_LENGTH);
            debug!(ownership = ?ownership, "Attributed object to owner");
        }
    }

    let response = forward(state, Request::from_parts(parts, Body::from(bytes))).await?;
    if !response.status().is_success() {
        return Ok(response);
    }
    invalidate(state, info).await;

    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| ProxyError::Upstream(e.into()))?;
    if info.subresource.is_none() {
        discover(state, identity, &bytes).await;
    }
    Ok(Response::from_parts(parts, Body::from(bytes)))
}

fn parse_body(bytes: &Bytes, shape: WriteBody) -> Result<Value, ProxyError> {
    let parsed = if shape == WriteBody::Patch(PatchKind::Apply) {
        // apply patches may be YAML; JSON is valid YAML
        serde_yaml::from_slice::<Value>(bytes).map_err(|e| e.to_string())
    } else {
        serde_json::from_slice::<Value>(bytes).map_err(|e| e.to_string())
    };
    parsed.map_err(ProxyError::InvalidBody)
}

/// Register a watch for the kind of `body` if it points at the owner
async fn discover(state: &ProxyState, identity: &OwnerIdentity, body: &Bytes) {
    let Ok(object) = serde_json::from_slice::<Value>(body) else {
        return;
    };
    let Some(ownership) = inject::existing_ownership(&object, identity) else {
        return;
    };
    let (Some(api_version), Some(kind)) = (
        object.get("apiVersion").and_then(Value::as_str),
        object.get("kind").and_then(Value::as_str),
    ) else {
        return;
    };

    let child_kind = ResourceKind::from_api_version(api_version, kind);
    let child = state.mapper.mapping_for_kind(&child_kind).await.ok();
    let owner_namespaced = match state.mapper.mapping_for_kind(&identity.kind()).await {
        Ok(owner) => owner.namespaced,
        Err(e) => {
            debug!(
                owner = %identity.kind(),
                error = %e,
                "Owner kind not mapped, skipping discovery"
            );
            return;
        }
    };
    let outcome =
        observe_dependent(&state.controllers, identity, owner_namespaced, child, ownership);
    debug!(dependent = %child_kind, outcome = ?outcome, "Observed dependent");
}

async fn invalidate(state: &ProxyState, info: &RequestInfo) {
    if let Ok(mapping) = state
        .mapper
        .mapping_for_resource(&info.group, &info.version, &info.resource)
        .await
    {
        state
            .cache
            .invalidate(&mapping.kind, info.namespace.as_deref(), info.name.as_deref());
    }
}

fn cache_key(kind: &ResourceKind, info: &RequestInfo) -> CacheKey {
    match &info.name {
        Some(name) => CacheKey::Object {
            kind: kind.clone(),
            namespace: info.namespace.clone(),
            name: name.clone(),
        },
        None => CacheKey::List {
            kind: kind.clone(),
            namespace: info.namespace.clone(),
            selector: info.selector(),
        },
    }
}

/// Send `request` upstream without the automation's credentials
async fn forward(state: &ProxyState, mut request: Request) -> Result<Response<Body>, ProxyError> {
    strip_request_headers(request.headers_mut());
    let mut response = state
        .upstream
        .send(request)
        .await
        .map_err(ProxyError::Upstream)?;
    for name in &HOP_BY_HOP_HEADERS {
        response.headers_mut().remove(name);
    }
    Ok(response)
}

fn strip_request_headers(headers: &mut HeaderMap) {
    headers.remove(header::AUTHORIZATION);
    headers.remove(header::HOST);
    headers.remove(header::ACCEPT_ENCODING);
    for name in &HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_body() {
        let response = ProxyError::InvalidBody("not json".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_strip_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:8888"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        strip_request_headers(&mut headers);
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert!(headers.get(header::ACCEPT).is_some());
    }

    #[test]
    fn test_yaml_apply_body_parses() {
        let body = Bytes::from_static(b"metadata:\n  name: cfg\ndata:\n  a: b\n");
        let value = parse_body(&body, WriteBody::Patch(PatchKind::Apply)).unwrap();
        assert_eq!(value["metadata"]["name"], "cfg");
    }

    #[tokio::test]
    async fn test_bind_fails_when_port_is_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();

        let error = bind_proxy(addr).await.unwrap_err();
        assert!(error.to_string().contains("Failed to bind API proxy"), "got {error:#}");
    }
}
