//! In-process fake consensus cluster for integration tests.
//!
//! A shared log with per-member apply cursors: every submission through the
//! leader is appended once and delivered to each member's FSM strictly in
//! order. Leadership is assigned by the test. Snapshot transfer between
//! members goes through the real export/restore path.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use r_store::AddressResolver;
use r_store::BackendError;
use r_store::ClusterConfiguration;
use r_store::ConsensusEngine;
use r_store::Fsm;
use r_store::LeaderState;
use r_store::LogPosition;
use r_store::Result;
use r_store::VecSink;
use r_store::VecSource;
use tokio::sync::watch;

struct RaftInner {
    log: Vec<Vec<u8>>,
    term: u64,
    members: Vec<Arc<FakeEngine>>,
}

/// Cluster-wide shared state; engines hand out of it are wired to one log.
pub struct FakeRaft {
    inner: Arc<Mutex<RaftInner>>,
}

impl Default for FakeRaft {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRaft {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(RaftInner {
                log: Vec::new(),
                term: 1,
                members: Vec::new(),
            })),
        }
    }

    /// A detached engine: it shares the cluster state but receives no
    /// committed entries until [`attach`](Self::attach)ed.
    pub fn engine(&self) -> Arc<FakeEngine> {
        let (leadership_tx, leadership_rx) = watch::channel(LeaderState::follower());
        Arc::new(FakeEngine {
            inner: self.inner.clone(),
            fsm: Mutex::new(None),
            next_index: AtomicU64::new(1),
            leadership_tx,
            leadership_rx,
        })
    }

    /// Start delivering committed entries to `engine`, catching it up on the
    /// existing log first.
    pub fn attach(
        &self,
        engine: &Arc<FakeEngine>,
    ) {
        let mut inner = self.inner.lock();
        engine.apply_available(&inner.log, inner.term).expect("catch-up apply");
        inner.members.push(engine.clone());
    }

    /// Make `engine` the sole leader; everyone else observes followership.
    pub fn set_leader(
        &self,
        engine: &Arc<FakeEngine>,
    ) {
        let inner = self.inner.lock();
        let leader_id = format!("{:p}", Arc::as_ptr(engine));
        let _ = engine.leadership_tx.send(LeaderState::Leader);
        for member in &inner.members {
            if !Arc::ptr_eq(member, engine) {
                let _ = member.leadership_tx.send(LeaderState::Follower {
                    leader_hint: Some(leader_id.clone()),
                });
            }
        }
    }

    /// Full state transfer from one member's FSM into another's, the path a
    /// far-behind joiner takes before switching to log catch-up.
    pub fn transfer_snapshot(
        &self,
        from: &Arc<FakeEngine>,
        to: &Arc<FakeEngine>,
    ) -> Result<()> {
        let mut metadata_sink = VecSink::new();
        let mut data_sink = VecSink::new();
        from.fsm().export_snapshot(&mut metadata_sink, &mut data_sink)?;

        to.fsm().restore_snapshot(
            &mut VecSource::new(metadata_sink.into_inner()),
            &mut VecSource::new(data_sink.into_inner()),
        )?;
        to.next_index.store(to.fsm().latest_state().index + 1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeEngine {
    inner: Arc<Mutex<RaftInner>>,
    fsm: Mutex<Option<Arc<Fsm>>>,
    /// Next log index (1-based) this member's FSM expects
    next_index: AtomicU64,
    leadership_tx: watch::Sender<LeaderState>,
    leadership_rx: watch::Receiver<LeaderState>,
}

impl FakeEngine {
    pub fn fsm(&self) -> Arc<Fsm> {
        self.fsm.lock().clone().expect("fsm registered")
    }

    fn apply_available(
        &self,
        log: &[Vec<u8>],
        term: u64,
    ) -> Result<()> {
        let guard = self.fsm.lock();
        let Some(fsm) = guard.as_ref() else {
            return Ok(());
        };
        loop {
            let next = self.next_index.load(Ordering::SeqCst);
            if next as usize > log.len() {
                return Ok(());
            }
            fsm.apply(&log[(next - 1) as usize], next, term)?;
            self.next_index.store(next + 1, Ordering::SeqCst);
        }
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for FakeEngine {
    fn register_fsm(
        &self,
        fsm: Arc<Fsm>,
    ) {
        self.next_index.store(fsm.latest_state().index + 1, Ordering::SeqCst);
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
            let hint = match &*self.leadership_rx.borrow() {
                LeaderState::Follower { leader_hint } => leader_hint.clone(),
                LeaderState::Leader => None,
            };
            return Err(BackendError::NotLeader { leader_hint: hint }.into());
        }

        let mut inner = self.inner.lock();
        inner.log.push(command);
        let index = inner.log.len() as u64;
        let term = inner.term;

        let members = inner.members.clone();
        for member in &members {
            member.apply_available(&inner.log, term)?;
        }
        Ok(LogPosition { index, term })
    }

    fn leadership_watch(&self) -> watch::Receiver<LeaderState> {
        self.leadership_rx.clone()
    }

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
