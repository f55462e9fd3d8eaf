pub mod config;
pub mod errors;
pub mod fallback;
pub mod http;
pub mod metrics_defs;
pub mod peers;
pub mod proxy_service;

use errors::ServiceError;
use fallback::FallbackProxy;
use peers::{PeerSource, StaticPeers};
use proxy_service::ProxyService;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Serves the configured static peer list.
pub async fn run(config: config::Config, shutdown: CancellationToken) -> Result<(), ServiceError> {
    let peers = Arc::new(StaticPeers::new(config.peers.clone()));
    if peers.is_empty() {
        tracing::warn!("no peers configured, every request will fail");
    }
    run_with_peers(config, peers, shutdown).await
}

/// Serves the proxy and admin listeners until `shutdown` is cancelled or one
/// of them fails. The peer list of every request comes from `peers`.
pub async fn run_with_peers<P>(
    config: config::Config,
    peers: Arc<P>,
    shutdown: CancellationToken,
) -> Result<(), ServiceError>
where
    P: PeerSource + 'static,
{
    config.validate()?;
    shared::metrics_defs::describe_all(metrics_defs::ALL_METRICS);

    let engine = FallbackProxy::new(config.timeouts);
    let proxy_task = run_http_service(
        &config.listener.host,
        config.listener.port,
        ProxyService::new(engine, peers.clone()),
        shutdown.clone(),
    );

    let admin_task = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        AdminService::<_, ServiceError>::new(move || peers.is_ready()),
        shutdown,
    );

    tokio::try_join!(proxy_task, admin_task)?;
    Ok(())
}
