//! Cluster membership on top of a hierarchical coordination ensemble.
//!
//! [`ClusterWatcher`] keeps one session to the ensemble alive, multiplexes any
//! number of children subscriptions onto one ensemble watch per path and
//! recreates this node's ephemeral registrations when its session is replaced.
//! [`PeerDirectory`] turns a membership subscription into a peer list for the
//! proxy, and [`member::run`] serves the proxy as a registered cluster member.

pub mod config;
pub mod ensemble;
pub mod errors;
pub mod member;
pub mod memory;
pub mod metrics_defs;
mod path_watch;
pub mod paths;
pub mod peers;
mod registry;
pub mod subscription;
pub mod watcher;

pub use config::{ClusterConfig, MembershipConfig};
pub use errors::{ClusterError, EnsembleError, MemberError};
pub use peers::PeerDirectory;
pub use subscription::{ConnectionEvent, ConnectionSignals, WatchUpdates};
pub use watcher::ClusterWatcher;
