//! # Owner Attribution
//!
//! Marks objects written through the proxy as children of the owner that
//! authenticated the request. A child gets a controller owner reference when
//! it can legally carry one: the owner is cluster-scoped, or both live in the
//! same namespace. Any other child is attributed with the primary-resource
//! annotations instead.

use crate::constants::{PRIMARY_RESOURCE_ANNOTATION, PRIMARY_RESOURCE_TYPE_ANNOTATION};
use crate::controller::identity::OwnerIdentity;
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Reference,
    Annotation,
}

/// How a child in `child_namespace` (`None` for cluster-scoped kinds) may be
/// attributed to its owner
#[must_use]
pub fn ownership_for(
    owner_namespaced: bool,
    owner_namespace: &str,
    child_namespace: Option<&str>,
) -> Ownership {
    if !owner_namespaced || child_namespace == Some(owner_namespace) {
        Ownership::Reference
    } else {
        Ownership::Annotation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    Json,
    Merge,
    StrategicMerge,
    Apply,
}

impl PatchKind {
    #[must_use]
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media_type = content_type.split(';').next().unwrap_or_default().trim();
        match media_type {
            "application/json-patch+json" => Some(PatchKind::Json),
            "application/merge-patch+json" => Some(PatchKind::Merge),
            "application/strategic-merge-patch+json" => Some(PatchKind::StrategicMerge),
            "application/apply-patch+yaml" | "application/apply-patch+json" => {
                Some(PatchKind::Apply)
            }
            _ => None,
        }
    }
}

/// Shape of a write request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBody {
    /// Full object of a create or update
    Object,
    Patch(PatchKind),
}

/// Attribute `body` to `identity`. Returns whether the body changed.
pub fn attribute(
    body: &mut Value,
    identity: &OwnerIdentity,
    ownership: Ownership,
    shape: WriteBody,
) -> bool {
    if shape == WriteBody::Patch(PatchKind::Json) {
        return false;
    }
    let Some(object) = body.as_object_mut() else {
        return false;
    };

    let mentions_refs = object
        .get("metadata")
        .and_then(|m| m.get("ownerReferences"))
        .is_some();
    // a merge patch replaces lists wholesale
    if ownership == Ownership::Reference
        && shape == WriteBody::Patch(PatchKind::Merge)
        && !mentions_refs
    {
        return false;
    }
    let Some(metadata) = metadata(object) else {
        return false;
    };

    match ownership {
        Ownership::Reference => add_owner_reference(metadata, identity),
        Ownership::Annotation => add_annotations(metadata, identity),
    }
}

/// How an object read back from the API server already points at `identity`
#[must_use]
pub fn existing_ownership(object: &Value, identity: &OwnerIdentity) -> Option<Ownership> {
    let metadata = object.get("metadata")?;
    let referenced = metadata
        .get("ownerReferences")
        .and_then(Value::as_array)
        .is_some_and(|refs| {
            refs.iter().any(|r| {
                r.get("uid").and_then(Value::as_str) == Some(identity.owner_reference.uid.as_str())
            })
        });
    if referenced {
        return Some(Ownership::Reference);
    }

    let annotations = metadata.get("annotations")?;
    let primary = annotations.get(PRIMARY_RESOURCE_ANNOTATION).and_then(Value::as_str);
    let primary_type = annotations
        .get(PRIMARY_RESOURCE_TYPE_ANNOTATION)
        .and_then(Value::as_str);
    (primary == Some(primary_resource(identity).as_str())
        && primary_type == Some(identity.kind().group_kind().as_str()))
    .then_some(Ownership::Annotation)
}

fn metadata(object: &mut Map<String, Value>) -> Option<&mut Map<String, Value>> {
    let metadata = object
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()));
    if !metadata.is_object() {
        *metadata = Value::Object(Map::new());
    }
    metadata.as_object_mut()
}

fn add_owner_reference(metadata: &mut Map<String, Value>, identity: &OwnerIdentity) -> bool {
    let refs = metadata
        .entry("ownerReferences")
        .or_insert_with(|| Value::Array(Vec::new()));
    if !refs.is_array() {
        *refs = Value::Array(Vec::new());
    }
    let Some(refs) = refs.as_array_mut() else {
        return false;
    };

    let owner = &identity.owner_reference;
    if refs
        .iter()
        .any(|r| r.get("uid").and_then(Value::as_str) == Some(owner.uid.as_str()))
    {
        return false;
    }
    // an object can only have one controller
    let has_controller = refs
        .iter()
        .any(|r| r.get("controller").and_then(Value::as_bool) == Some(true));

    refs.push(json!({
        "apiVersion": owner.api_version,
        "kind": owner.kind,
        "name": owner.name,
        "uid": owner.uid,
        "controller": !has_controller,
        "blockOwnerDeletion": true,
    }));
    true
}

fn add_annotations(metadata: &mut Map<String, Value>, identity: &OwnerIdentity) -> bool {
    let annotations = metadata
        .entry("annotations")
        .or_insert_with(|| Value::Object(Map::new()));
    if !annotations.is_object() {
        *annotations = Value::Object(Map::new());
    }
    let Some(annotations) = annotations.as_object_mut() else {
        return false;
    };

    let wanted = [
        (PRIMARY_RESOURCE_ANNOTATION, primary_resource(identity)),
        (PRIMARY_RESOURCE_TYPE_ANNOTATION, identity.kind().group_kind()),
    ];
    let mut changed = false;
    for (key, value) in wanted {
        if annotations.get(key).and_then(Value::as_str) != Some(value.as_str()) {
            annotations.insert(key.to_string(), Value::String(value));
            changed = true;
        }
    }
    changed
}

fn primary_resource(identity: &OwnerIdentity) -> String {
    format!("{}/{}", identity.namespace, identity.name())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn identity() -> OwnerIdentity {
        OwnerIdentity {
            owner_reference: OwnerReference {
                api_version: "cache.example.com/v1alpha1".to_string(),
                kind: "Memcached".to_string(),
                name: "example".to_string(),
                uid: "uid-1".to_string(),
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            namespace: "default".to_string(),
        }
    }

    fn controllers(body: &Value) -> Vec<&Value> {
        body["metadata"]["ownerReferences"]
            .as_array()
            .unwrap()
            .iter()
            .filter(|r| r["controller"] == true)
            .collect()
    }

    #[test]
    fn test_ownership_rules() {
        assert_eq!(ownership_for(false, "", Some("other")), Ownership::Reference);
        assert_eq!(ownership_for(false, "", None), Ownership::Reference);
        assert_eq!(ownership_for(true, "default", Some("default")), Ownership::Reference);
        assert_eq!(ownership_for(true, "default", Some("other")), Ownership::Annotation);
        assert_eq!(ownership_for(true, "default", None), Ownership::Annotation);
    }

    #[test]
    fn test_create_gets_single_controller_reference() {
        let mut body = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "cfg"}});
        assert!(attribute(&mut body, &identity(), Ownership::Reference, WriteBody::Object));

        let refs = controllers(&body);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "uid-1");
        assert_eq!(refs[0]["kind"], "Memcached");
        assert_eq!(refs[0]["blockOwnerDeletion"], true);

        // a second pass leaves the body alone
        assert!(!attribute(&mut body, &identity(), Ownership::Reference, WriteBody::Object));
        assert_eq!(body["metadata"]["ownerReferences"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_existing_controller_is_kept() {
        let mut body = json!({"metadata": {"ownerReferences": [
            {"apiVersion": "apps/v1", "kind": "Deployment", "name": "d", "uid": "uid-0", "controller": true}
        ]}});
        assert!(attribute(&mut body, &identity(), Ownership::Reference, WriteBody::Object));
        assert_eq!(controllers(&body).len(), 1);
        assert_eq!(body["metadata"]["ownerReferences"][1]["controller"], false);
    }

    #[test]
    fn test_patch_kinds() {
        let mut json_patch = json!([{"op": "add", "path": "/data/x", "value": "y"}]);
        assert!(!attribute(
            &mut json_patch,
            &identity(),
            Ownership::Reference,
            WriteBody::Patch(PatchKind::Json)
        ));

        let mut merge = json!({"data": {"x": "y"}});
        assert!(!attribute(
            &mut merge,
            &identity(),
            Ownership::Reference,
            WriteBody::Patch(PatchKind::Merge)
        ));

        let mut strategic = json!({"data": {"x": "y"}});
        assert!(attribute(
            &mut strategic,
            &identity(),
            Ownership::Reference,
            WriteBody::Patch(PatchKind::StrategicMerge)
        ));
        assert_eq!(controllers(&strategic).len(), 1);
    }

    #[test]
    fn test_annotation_attribution() {
        let mut body = json!({"metadata": {"name": "cfg", "namespace": "other"}});
        assert!(attribute(&mut body, &identity(), Ownership::Annotation, WriteBody::Object));
        let annotations = &body["metadata"]["annotations"];
        assert_eq!(annotations[PRIMARY_RESOURCE_ANNOTATION], "default/example");
        assert_eq!(
            annotations[PRIMARY_RESOURCE_TYPE_ANNOTATION],
            "Memcached.cache.example.com"
        );
        assert!(body["metadata"].get("ownerReferences").is_none());
        assert_eq!(existing_ownership(&body, &identity()), Some(Ownership::Annotation));
    }

    #[test]
    fn test_existing_ownership() {
        let mut body = json!({"metadata": {"name": "cfg"}});
        assert_eq!(existing_ownership(&body, &identity()), None);
        attribute(&mut body, &identity(), Ownership::Reference, WriteBody::Object);
        assert_eq!(existing_ownership(&body, &identity()), Some(Ownership::Reference));
    }

    #[test]
    fn test_patch_content_types() {
        assert_eq!(
            PatchKind::from_content_type("application/strategic-merge-patch+json; charset=utf-8"),
            Some(PatchKind::StrategicMerge)
        );
        assert_eq!(
            PatchKind::from_content_type("application/apply-patch+yaml"),
            Some(PatchKind::Apply)
        );
        assert_eq!(PatchKind::from_content_type("application/json"), None);
    }
}
