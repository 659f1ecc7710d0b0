//! # Owner Identity
//!
//! The owner identity is the only channel through which the automation tells
//! the proxy who owns the objects it is about to create. It travels as the
//! HTTP Basic-Auth username:
//!
//! ```text
//! base64url(JSON({"ownerReference": {apiVersion, kind, name, uid, controller, blockOwnerDeletion},
//!                 "namespace": "..."}))
//! ```
//!
//! The password is ignored. A token that does not decode to exactly this shape
//! is rejected.

use crate::controller::kind::ResourceKind;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("missing Authorization header")]
    MissingCredentials,
    #[error("Authorization header is not Basic auth")]
    NotBasicAuth,
    #[error("invalid base64 in credentials: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("credentials are not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("owner token is not a valid owner identity: {0}")]
    Json(#[from] serde_json::Error),
    #[error("owner identity is incomplete: {0}")]
    Incomplete(&'static str),
}

/// Owner reference plus the namespace of the owning resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OwnerIdentity {
    pub owner_reference: OwnerReference,
    /// Empty for cluster-scoped owners
    #[serde(default)]
    pub namespace: String,
}

impl OwnerIdentity {
    /// Identity of a resource that owns whatever its reconcile creates
    pub fn for_resource(obj: &DynamicObject) -> Result<Self, IdentityError> {
        let types = obj
            .types
            .as_ref()
            .ok_or(IdentityError::Incomplete("apiVersion/kind"))?;
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or(IdentityError::Incomplete("metadata.name"))?;
        let uid = obj
            .metadata
            .uid
            .clone()
            .ok_or(IdentityError::Incomplete("metadata.uid"))?;

        Ok(Self {
            owner_reference: OwnerReference {
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
                name,
                uid,
                controller: Some(true),
                block_owner_deletion: Some(true),
            },
            namespace: obj.metadata.namespace.clone().unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        ResourceKind::from_api_version(
            &self.owner_reference.api_version,
            &self.owner_reference.kind,
        )
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.owner_reference.name
    }

    /// Encode as a URL-safe token
    pub fn encode(&self) -> Result<String, IdentityError> {
        let json = serde_json::to_vec(self)?;
        Ok(URL_SAFE.encode(json))
    }

    pub fn decode(token: &str) -> Result<Self, IdentityError> {
        let json = URL_SAFE.decode(token.trim())?;
        let identity: OwnerIdentity = serde_json::from_slice(&json)?;
        identity.validate()?;
        Ok(identity)
    }

    /// Decode the identity carried in an `Authorization: Basic ...` header value
    pub fn from_basic_auth(header: Option<&str>) -> Result<Self, IdentityError> {
        let header = header.ok_or(IdentityError::MissingCredentials)?;
        let (scheme, credentials) = header
            .trim()
            .split_once(' ')
            .ok_or(IdentityError::NotBasicAuth)?;
        if !scheme.eq_ignore_ascii_case("basic") {
            return Err(IdentityError::NotBasicAuth);
        }
        let decoded = String::from_utf8(STANDARD.decode(credentials.trim())?)?;
        // base64url never contains ':', so the first one ends the username
        let username = decoded
            .split_once(':')
            .map_or(decoded.as_str(), |(user, _)| user);
        Self::decode(username)
    }

    fn validate(&self) -> Result<(), IdentityError> {
        let owner = &self.owner_reference;
        if owner.api_version.is_empty() {
            return Err(IdentityError::Incomplete("ownerReference.apiVersion"));
        }
        if owner.kind.is_empty() {
            return Err(IdentityError::Incomplete("ownerReference.kind"));
        }
        if owner.name.is_empty() {
            return Err(IdentityError::Incomplete("ownerReference.name"));
        }
        if owner.uid.is_empty() {
            return Err(IdentityError::Incomplete("ownerReference.uid"));
        }
        Ok(())
    }
}
