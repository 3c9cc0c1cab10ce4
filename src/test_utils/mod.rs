//! Shared helpers for unit tests: one-time logger setup and a single-replica
//! loopback consensus engine that commits submissions straight into the
//! registered FSM.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::AddressResolver;
use crate::BackendError;
use crate::ClusterConfiguration;
use crate::ConsensusEngine;
use crate::Fsm;
use crate::LeaderState;
use crate::LogPosition;
use crate::Result;

static LOGGER: OnceCell<()> = OnceCell::new();

pub fn enable_logger() {
    LOGGER.get_or_init(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Single-replica consensus stand-in: every submission is committed at the
/// next index and applied synchronously to the registered FSM. Leadership is
/// toggled by the test.
pub struct LoopbackConsensus {
    fsm: Mutex<Option<Arc<Fsm>>>,
    next_index: AtomicU64,
    term: u64,
    leadership_tx: watch::Sender<LeaderState>,
    leadership_rx: watch::Receiver<LeaderState>,
}

impl Default for LoopbackConsensus {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackConsensus {
    pub fn new() -> Self {
        let (leadership_tx, leadership_rx) = watch::channel(LeaderState::Leader);
        Self {
            fsm: Mutex::new(None),
            next_index: AtomicU64::new(1),
            term: 1,
            leadership_tx,
            leadership_rx,
        }
    }

    pub fn set_leader(
        &self,
        is_leader: bool,
    ) {
        let state = if is_leader {
            LeaderState::Leader
        } else {
            LeaderState::follower()
        };
        let _ = self.leadership_tx.send(state);
    }

    pub fn fsm(&self) -> Arc<Fsm> {
        self.fsm.lock().clone().expect("fsm registered")
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for LoopbackConsensus {
    fn register_fsm(
        &self,
        fsm: Arc<Fsm>,
    ) {
        *self.fsm.lock() = Some(fsm);
    }

    async fn start(
        &self,
        _configuration: ClusterConfiguration,
        _resolver: Arc<dyn AddressResolver>,
    ) -> Result<()> {
        Ok(())
    }

    async fn submit(
        &self,
        command: Vec<u8>,
    ) -> Result<LogPosition> {
        if !self.leadership_rx.borrow().is_leader() {
            return Err(BackendError::NotLeader { leader_hint: None }.into());
        }
        // Hold the registration lock across allocate+apply so concurrent
        // submissions keep the strict index order the FSM expects.
        let guard = self.fsm.lock();
        let fsm = guard.clone().expect("fsm registered");
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        fsm.apply(&command, index, self.term)?;
        Ok(LogPosition { index, term: self.term })
    }

    fn leadership_watch(&self) -> watch::Receiver<LeaderState> {
        self.leadership_rx.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
