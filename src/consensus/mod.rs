//! The injected consensus capability.
//!
//! The backend never implements leader election, log replication, or quorum
//! arithmetic itself; it binds one FSM to an engine satisfying
//! [`ConsensusEngine`]. The engine owns the total order of committed commands
//! and delivers them to the registered FSM strictly in order, exactly once
//! per replica. When a follower falls far enough behind, the engine drives a
//! full transfer through the FSM's snapshot export/restore operations.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;

use crate::AddressResolver;
use crate::ClusterConfiguration;
use crate::Fsm;
use crate::Result;

/// Position of a committed command in the replicated log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogPosition {
    pub index: u64,
    pub term: u64,
}

/// Leadership as seen by the local replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderState {
    Leader,
    Follower {
        /// Last known leader id, if any; lets callers re-route writes
        leader_hint: Option<String>,
    },
}

impl LeaderState {
    pub fn is_leader(&self) -> bool {
        matches!(self, LeaderState::Leader)
    }

    pub fn follower() -> Self {
        LeaderState::Follower { leader_hint: None }
    }
}

#[cfg_attr(test, automock)]
#[async_trait::async_trait]
pub trait ConsensusEngine: Send + Sync + 'static {
    /// Bind the FSM this engine delivers committed commands to. Called once,
    /// before `start`.
    fn register_fsm(
        &self,
        fsm: Arc<Fsm>,
    );

    /// Start transport and replication against `configuration`, resolving
    /// peer addresses through `resolver`.
    async fn start(
        &self,
        configuration: ClusterConfiguration,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<()>;

    /// Submit an encoded command for replication. Resolves once the command
    /// is committed, returning its position in the log; fails with
    /// `NotLeader` when this replica cannot order commands.
    async fn submit(
        &self,
        command: Vec<u8>,
    ) -> Result<LogPosition>;

    /// Leadership-change notification stream.
    fn leadership_watch(&self) -> watch::Receiver<LeaderState>;

    /// Stop background replication work. In-flight submissions fail.
    async fn shutdown(&self) -> Result<()>;
}
