//! Serving the proxy as one member of a cluster.
//!
//! A member registers its advertised address as an ephemeral child of the
//! members path and proxies to whoever else is registered there.

use crate::config::MembershipConfig;
use crate::ensemble::EnsembleConnector;
use crate::errors::{ClusterError, MemberError};
use crate::peers::PeerDirectory;
use crate::watcher::ClusterWatcher;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Connects to the ensemble, registers this node and starts following the
/// other members.
pub async fn join<C>(
    config: &MembershipConfig,
    connector: C,
) -> Result<(ClusterWatcher, PeerDirectory), ClusterError>
where
    C: EnsembleConnector + 'static,
{
    config.validate()?;
    let node = config
        .member_node()
        .ok_or_else(|| ClusterError::InvalidPath(config.advertise.clone()))?;

    let watcher = ClusterWatcher::connect(config.ensemble.clone(), connector).await?;
    let directory = match register(&watcher, config, &node).await {
        Ok(directory) => directory,
        Err(e) => {
            watcher.close().await;
            return Err(e);
        }
    };

    tracing::info!(
        member = %config.advertise,
        members_path = %config.members_path,
        session_id = %watcher.session_id(),
        "joined the cluster"
    );
    Ok((watcher, directory))
}

async fn register(
    watcher: &ClusterWatcher,
    config: &MembershipConfig,
    node: &str,
) -> Result<PeerDirectory, ClusterError> {
    watcher.create_ephemeral(node).await?;
    let (updates, mut signals) = watcher.watch_children(&config.members_path).await?;

    let members_path = config.members_path.clone();
    tokio::spawn(async move {
        while let Some(event) = signals.recv().await {
            tracing::info!(members_path = %members_path, ?event, "membership connectivity changed");
        }
    });

    Ok(PeerDirectory::follow(updates).excluding(&config.advertise))
}

/// Serves the proxy with the live membership as its peers until `shutdown`
/// is cancelled, then leaves the cluster.
pub async fn run<C>(
    config: MembershipConfig,
    proxy_config: proxy::config::Config,
    connector: C,
    shutdown: CancellationToken,
) -> Result<(), MemberError>
where
    C: EnsembleConnector + 'static,
{
    if !proxy_config.peers.is_empty() {
        tracing::warn!("static peers are ignored while cluster membership is configured");
    }

    let (watcher, directory) = join(&config, connector).await?;
    let result = proxy::run_with_peers(proxy_config, Arc::new(directory), shutdown).await;

    watcher.close().await;
    tracing::info!(member = %config.advertise, "left the cluster");
    Ok(result?)
}
