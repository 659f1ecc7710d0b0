//! # Proxy Kubeconfig
//!
//! Builds the credential bundle handed to one automation run. The bundle points
//! at the local proxy (TLS verification off, the proxy is localhost only) and
//! carries the encoded owner identity as the Basic-Auth username, both in the
//! server URL and in the user entry: kubectl only sends Basic auth when the
//! username is in the URL, the Python client only when it is under `users`.
//!
//! A bundle is written to a fresh temporary file per reconcile and removed when
//! it is dropped; it is never reused across reconciles.

use crate::constants::PROXY_PASSWORD_PLACEHOLDER;
use crate::controller::identity::{IdentityError, OwnerIdentity};
use serde::Serialize;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

const CLUSTER_NAME: &str = "proxy-server";
const USER_NAME: &str = "admin/proxy-server";

#[derive(Debug, Error)]
pub enum KubeconfigError {
    #[error("failed to encode owner identity: {0}")]
    Identity(#[from] IdentityError),
    #[error("failed to render kubeconfig: {0}")]
    Render(#[from] serde_yaml::Error),
    #[error("failed to write kubeconfig: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigDocument {
    api_version: &'static str,
    kind: &'static str,
    clusters: Vec<NamedCluster>,
    contexts: Vec<NamedContext>,
    current_context: String,
    preferences: serde_json::Map<String, serde_json::Value>,
    users: Vec<NamedUser>,
}

#[derive(Debug, Serialize)]
struct NamedCluster {
    cluster: ClusterEntry,
    name: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    insecure_skip_tls_verify: bool,
    server: String,
}

#[derive(Debug, Serialize)]
struct NamedContext {
    context: ContextEntry,
    name: String,
}

#[derive(Debug, Serialize)]
struct ContextEntry {
    cluster: &'static str,
    user: &'static str,
}

#[derive(Debug, Serialize)]
struct NamedUser {
    name: &'static str,
    user: UserEntry,
}

#[derive(Debug, Serialize)]
struct UserEntry {
    username: String,
    password: &'static str,
}

/// Render the kubeconfig YAML for `identity` talking to the proxy at `proxy_addr`
pub fn render(identity: &OwnerIdentity, proxy_addr: SocketAddr) -> Result<String, KubeconfigError> {
    let username = identity.encode()?;
    let namespace = &identity.namespace;
    let context_name = format!("{namespace}/{CLUSTER_NAME}");

    let document = KubeconfigDocument {
        api_version: "v1",
        kind: "Config",
        clusters: vec![NamedCluster {
            cluster: ClusterEntry {
                insecure_skip_tls_verify: true,
                server: format!("http://{username}@{proxy_addr}"),
            },
            name: CLUSTER_NAME,
        }],
        contexts: vec![NamedContext {
            context: ContextEntry {
                cluster: CLUSTER_NAME,
                user: USER_NAME,
            },
            name: context_name.clone(),
        }],
        current_context: context_name,
        preferences: serde_json::Map::new(),
        users: vec![NamedUser {
            name: USER_NAME,
            user: UserEntry {
                username,
                password: PROXY_PASSWORD_PLACEHOLDER,
            },
        }],
    };

    Ok(serde_yaml::to_string(&document)?)
}

/// A kubeconfig file bound to one reconcile; deleted on drop
#[derive(Debug)]
pub struct ProxyKubeconfig {
    file: NamedTempFile,
}

impl ProxyKubeconfig {
    pub fn create(
        identity: &OwnerIdentity,
        proxy_addr: SocketAddr,
    ) -> Result<Self, KubeconfigError> {
        let rendered = render(identity, proxy_addr)?;
        let mut file = tempfile::Builder::new().prefix("kubeconfig-").tempfile()?;
        file.write_all(rendered.as_bytes())?;
        file.flush()?;
        Ok(Self { file })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }
}
