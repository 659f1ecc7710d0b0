//! # Initialization
//!
//! Operator start-up: rustls, tracing, metrics, the health server, the
//! controller map, the intercepting proxy and one reconciler per watched kind.

use crate::config::{self, ControllerConfig, WatchConfig};
use crate::controller::controller_map::{ControllerMap, ControllerMapEntry};
use crate::controller::kind::ApiMapping;
use crate::controller::proxy::{
    DiscoveryMapper, KubeUpstream, ProxyState, ReadCache, RestMapper, bind_proxy, start_proxy,
};
use crate::controller::reconciler::{KubeEventPublisher, KubeResourceClient, Reconciler};
use crate::controller::runner::AnsibleRunner;
use crate::controller::server::{ServerState, start_server};
use crate::observability;
use crate::runtime::registrar::DependentWatchRegistrar;
use anyhow::{Context, Result};
use futures::channel::mpsc::{self, UnboundedReceiver};
use kube::Client;
use kube::api::DynamicObject;
use kube_runtime::reflector::ObjectRef;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::{error, info};

/// Reconciler for one watched kind plus the trigger stream of each scope it
/// is watched in
#[derive(Debug)]
pub struct PrimaryController {
    pub reconciler: Arc<Reconciler>,
    pub mapping: ApiMapping,
    /// `None` watches every namespace
    pub scopes: Vec<(Option<String>, UnboundedReceiver<ObjectRef<DynamicObject>>)>,
}

pub struct InitializationResult {
    pub client: Client,
    pub controllers: Vec<PrimaryController>,
    pub server_state: Arc<ServerState>,
    pub proxy_addr: SocketAddr,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("controllers", &self.controllers.len())
            .field("proxy_addr", &self.proxy_addr)
            .field("server_ready", &self.server_state.ready())
            .finish_non_exhaustive()
    }
}

/// Initialize the operator runtime
pub async fn initialize() -> Result<InitializationResult> {
    // must happen before any TLS connection is made
    rustls::crypto::ring::default_provider()
        .install_default()
        .unwrap_or_else(|_| panic!("Failed to install rustls crypto provider"));

    let config = ControllerConfig::from_env();
    init_tracing(&config);
    info!("Starting ansible-operator v{}", env!("CARGO_PKG_VERSION"));

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState::new());
    let server_state_clone = Arc::clone(&server_state);
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_server(metrics_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let watches = config::watches::load(&config.watches_file, config.watch_defaults())
        .with_context(|| format!("Failed to load {}", config.watches_file.display()))?;
    info!(
        "Loaded {} watch entries from {}",
        watches.len(),
        config.watches_file.display()
    );

    let mapper: Arc<dyn RestMapper> = Arc::new(DiscoveryMapper::new(client.clone()));
    let cache = Arc::new(ReadCache::new(config.proxy_cache_ttl));
    let controllers = ControllerMap::new();

    let mut pending = Vec::with_capacity(watches.len());
    for watch in watches {
        let mapping = mapper
            .mapping_for_kind(&watch.kind)
            .await
            .with_context(|| format!("Failed to resolve {}; is its CRD installed?", watch.kind))?;
        let scopes = scopes_for(&mapping, &config.watch_namespaces);

        let mut senders = Vec::with_capacity(scopes.len());
        let mut receivers = Vec::with_capacity(scopes.len());
        for scope in scopes {
            let (tx, rx) = mpsc::unbounded();
            senders.push(tx);
            receivers.push((scope, rx));
        }

        let registrar = DependentWatchRegistrar::new(
            client.clone(),
            &mapping,
            config.watch_namespaces.clone(),
            Arc::clone(&cache),
            senders,
        );
        controllers
            .store(
                watch.kind.clone(),
                ControllerMapEntry::new(
                    Arc::new(registrar),
                    watch.watch_dependent_resources,
                    watch.watch_cluster_scoped_resources,
                ),
                watch.ignore_list.clone(),
            )
            .with_context(|| format!("Invalid watch configuration for {}", watch.kind))?;
        pending.push((watch, mapping, receivers));
    }

    let proxy_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, config.proxy_port));
    let proxy_state = Arc::new(ProxyState {
        controllers: controllers.clone(),
        mapper,
        upstream: Arc::new(KubeUpstream::new(client.clone())),
        cache,
        inject_owner_ref: config.inject_owner_ref,
    });
    let listener = bind_proxy(proxy_addr).await?;
    tokio::spawn(async move {
        if let Err(e) = start_proxy(listener, proxy_state).await {
            error!("API proxy error: {}", e);
        }
    });

    let runner = Arc::new(
        AnsibleRunner::new(&config.runner_bin, config.ansible_args.clone())
            .context("Failed to locate the automation runner")?,
    );

    let primaries = pending
        .into_iter()
        .map(|(watch, mapping, scopes)| PrimaryController {
            reconciler: Arc::new(reconciler_for(
                &client,
                &config,
                watch,
                &mapping,
                controllers.clone(),
                Arc::clone(&runner),
                proxy_addr,
            )),
            mapping,
            scopes,
        })
        .collect();

    info!("Operator initialized, starting controllers...");
    Ok(InitializationResult {
        client,
        controllers: primaries,
        server_state,
        proxy_addr,
    })
}

fn init_tracing(config: &ControllerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ansible_operator=info".into());
    if config.log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(config.log_enable_color)
            .init();
    }
}

/// Namespaces a primary kind is watched in; cluster-scoped kinds ignore the list
fn scopes_for(mapping: &ApiMapping, namespaces: &[String]) -> Vec<Option<String>> {
    if mapping.namespaced && !namespaces.is_empty() {
        namespaces.iter().cloned().map(Some).collect()
    } else {
        vec![None]
    }
}

fn reconciler_for(
    client: &Client,
    config: &ControllerConfig,
    watch: WatchConfig,
    mapping: &ApiMapping,
    controllers: ControllerMap,
    runner: Arc<AnsibleRunner>,
    proxy_addr: SocketAddr,
) -> Reconciler {
    let resource = mapping.api_resource();
    Reconciler::new(
        watch,
        controllers,
        Arc::new(KubeResourceClient::new(
            client.clone(),
            resource.clone(),
            mapping.namespaced,
        )),
        runner,
        Arc::new(KubeEventPublisher::new(client.clone(), resource)),
        proxy_addr,
        config.event_level,
        config.ansible_debug_logs,
        config.runner_timeout,
    )
}
