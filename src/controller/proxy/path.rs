//! Classification of Kubernetes API request paths.

use axum::http::Method;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Watch,
    Create,
    Update,
    Patch,
    Delete,
    DeleteCollection,
}

impl Verb {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Get => "get",
            Verb::List => "list",
            Verb::Watch => "watch",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Patch => "patch",
            Verb::Delete => "delete",
            Verb::DeleteCollection => "deletecollection",
        }
    }

    /// Verbs whose request body is an object the proxy may attribute to an owner
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Patch)
    }
}

/// A request against a resource endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub verb: Verb,
    pub group: String,
    pub version: String,
    pub namespace: Option<String>,
    pub resource: String,
    pub name: Option<String>,
    pub subresource: Option<String>,
    pub query: HashMap<String, String>,
}

impl RequestInfo {
    /// Reads the cache may answer: whole objects and unpaginated lists at the
    /// latest resource version
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        if self.subresource.is_some() {
            return false;
        }
        let pinned = ["resourceVersion", "limit", "continue", "watch"]
            .iter()
            .any(|param| self.query.contains_key(*param));
        matches!(self.verb, Verb::Get | Verb::List) && !pinned
    }

    /// Selector string identifying a LIST in the cache
    #[must_use]
    pub fn selector(&self) -> String {
        let label = self.query.get("labelSelector").map_or("", String::as_str);
        let field = self.query.get("fieldSelector").map_or("", String::as_str);
        format!("{label}|{field}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRequest {
    Resource(RequestInfo),
    /// Discovery, version, openapi and anything else without a resource
    NonResource,
}

pub fn parse(method: &Method, path: &str, query: HashMap<String, String>) -> ParsedRequest {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    let (group, version, mut rest) = match segments.as_slice() {
        ["api", version, rest @ ..] => ("", *version, rest),
        ["apis", group, version, rest @ ..] => (*group, *version, rest),
        _ => return ParsedRequest::NonResource,
    };

    let mut watch = matches!(query.get("watch").map(String::as_str), Some("true" | "1"));
    if let ["watch", tail @ ..] = rest {
        watch = true;
        rest = tail;
    }

    let mut namespace = None;
    if let ["namespaces", ns, tail @ ..] = rest {
        // `/api/v1/namespaces/{name}` addresses the namespace object itself
        if !tail.is_empty() {
            namespace = Some((*ns).to_string());
            rest = tail;
        }
    }

    let (resource, name, subresource) = match rest {
        [resource] => (*resource, None, None),
        [resource, name] => (*resource, Some(*name), None),
        [resource, name, subresource, ..] => (*resource, Some(*name), Some(*subresource)),
        [] => return ParsedRequest::NonResource,
    };

    let verb = match (method, name.is_some()) {
        (&Method::GET, _) if watch => Verb::Watch,
        (&Method::GET, true) => Verb::Get,
        (&Method::GET, false) => Verb::List,
        (&Method::POST, _) => Verb::Create,
        (&Method::PUT, _) => Verb::Update,
        (&Method::PATCH, _) => Verb::Patch,
        (&Method::DELETE, true) => Verb::Delete,
        (&Method::DELETE, false) => Verb::DeleteCollection,
        _ => return ParsedRequest::NonResource,
    };

    ParsedRequest::Resource(RequestInfo {
        verb,
        group: group.to_string(),
        version: version.to_string(),
        namespace,
        resource: resource.to_string(),
        name: name.map(str::to_string),
        subresource: subresource.map(str::to_string),
        query,
    })
}
