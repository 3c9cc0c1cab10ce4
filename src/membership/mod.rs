//! Cluster membership types.
//!
//! The cluster configuration is replicated state: it is seeded once by
//! [`bootstrap`](crate::RaftBackend::bootstrap) and afterwards mutated only by
//! committed membership-change commands flowing through the FSM.


use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

use crate::BackendError;
use crate::Result;

/// An addressable cluster member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: String,
    pub address: String,
    /// Whether the peer participates in quorum
    #[serde(default = "default_voter")]
    pub voter: bool,
}

fn default_voter() -> bool {
    true
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            voter: true,
        }
    }
}

/// Ordered set of peers forming the active cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub peers: Vec<Peer>,
}

impl ClusterConfiguration {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(
        &self,
        peer_id: &str,
    ) -> bool {
        self.peers.iter().any(|p| p.id == peer_id)
    }

    /// Configuration with `peer` admitted. Re-adding an existing id replaces
    /// its address, which covers a peer coming back under a new address.
    pub fn with_peer_added(
        &self,
        peer: Peer,
    ) -> Self {
        let mut peers: Vec<Peer> = self.peers.iter().filter(|p| p.id != peer.id).cloned().collect();
        peers.push(peer);
        Self { peers }
    }

    /// Configuration with the peer identified by `peer_id` removed.
    pub fn with_peer_removed(
        &self,
        peer_id: &str,
    ) -> Self {
        Self {
            peers: self.peers.iter().filter(|p| p.id != peer_id).cloned().collect(),
        }
    }
}

/// Resolves a peer id to a transport address.
///
/// Injected into [`setup_cluster`](crate::RaftBackend::setup_cluster) so the
/// orchestrator never hardwires a peer-to-address mapping.
pub trait AddressResolver: Send + Sync + 'static {
    fn resolve(
        &self,
        peer_id: &str,
    ) -> Result<String>;
}

/// Fixed-map resolver, useful for tests and static deployments.
#[derive(Debug, Default)]
pub struct StaticAddressResolver {
    addresses: HashMap<String, String>,
}

impl StaticAddressResolver {
    pub fn new(addresses: HashMap<String, String>) -> Self {
        Self { addresses }
    }

    /// Resolver mapping every peer of `configuration` to its recorded address.
    pub fn from_configuration(configuration: &ClusterConfiguration) -> Self {
        Self {
            addresses: configuration
                .peers
                .iter()
                .map(|p| (p.id.clone(), p.address.clone()))
                .collect(),
        }
    }
}

impl AddressResolver for StaticAddressResolver {
    fn resolve(
        &self,
        peer_id: &str,
    ) -> Result<String> {
        self.addresses
            .get(peer_id)
            .cloned()
            .ok_or_else(|| BackendError::UnknownPeer(peer_id.to_string()).into())
    }
}
