//! # API Proxy
//!
//! Intercepting proxy between the automation process and the API server.
//!
//! - `path`: classification of API request paths
//! - `mapper`: kind/resource to REST mapping lookups
//! - `cache`: shared read cache for GET and LIST responses
//! - `inject`: owner references and primary-resource annotations
//! - `watches`: dependent-kind discovery into the controller map
//! - `server`: the axum service and upstream forwarding

pub mod cache;
pub mod inject;
pub mod mapper;
pub mod path;
pub mod server;
pub mod watches;

pub use cache::ReadCache;
pub use mapper::{DiscoveryMapper, RestMapper};
pub use server::{
    KubeUpstream, ProxyError, ProxyState, Upstream, bind_proxy, router, start_proxy,
};
