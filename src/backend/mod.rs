//! Backend orchestrator.
//!
//! Binds one FSM instance to one consensus engine and exposes the storage
//! backend contract (get/put/delete/list, transactional batches) plus the HA
//! leader-lock contract on top of it. There is exactly one construction path,
//! [`RaftBackend::new`]; tests substitute a fake consensus engine through the
//! same constructor.


use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::constants::NODE_ID_FILE;
use crate::init_sled_local_store;
use crate::AddressResolver;
use crate::AppliedState;
use crate::BackendConfig;
use crate::BackendError;
use crate::ClusterConfiguration;
use crate::CommandCodec;
use crate::ConsensusEngine;
use crate::Fsm;
use crate::LeaderState;
use crate::LocalStore;
use crate::LogCommand;
use crate::MembershipChangeKind;
use crate::Peer;
use crate::Result;
use crate::StorageEntry;
use crate::TxnOp;

/// Per-replica lifecycle. `Ready` subsumes both leader and follower; the
/// leader/follower split is driven by the engine's leadership watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Unbootstrapped,
    Bootstrapping,
    Ready,
}

pub struct RaftBackend<C: ConsensusEngine> {
    node_id: String,
    codec: CommandCodec,
    store: Arc<LocalStore>,
    fsm: Arc<Fsm>,
    consensus: Arc<C>,

    state: RwLock<BackendState>,
    /// Set by `setup_cluster`; absent means no leadership information yet
    leadership: Mutex<Option<watch::Receiver<LeaderState>>>,
    /// HA lock bookkeeping, valid only while leadership is held
    lock_held: AtomicBool,

    shutdown: CancellationToken,
}

impl<C: ConsensusEngine> std::fmt::Debug for RaftBackend<C> {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("RaftBackend")
            .field("node_id", &self.node_id)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl<C: ConsensusEngine> RaftBackend<C> {
    /// Open (or create) the local store under `config.path`, load the node
    /// identity, and bind the FSM to `consensus`.
    pub fn new(
        config: BackendConfig,
        consensus: Arc<C>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.path)?;

        let node_id = load_or_create_node_id(&config.path)?;
        let db = init_sled_local_store(&config.path)?;
        let store = Arc::new(LocalStore::open(Arc::new(db))?);
        let fsm = Arc::new(Fsm::new(store.clone(), config.store_latest_state)?);
        consensus.register_fsm(fsm.clone());

        // A replica that already carries a configuration has been
        // bootstrapped (or restored) before; it only needs setup_cluster.
        let state = if fsm.configuration().is_empty() {
            BackendState::Unbootstrapped
        } else {
            BackendState::Bootstrapping
        };
        info!(%node_id, ?state, "backend opened");

        Ok(Self {
            node_id,
            codec: CommandCodec::new(config.max_command_size_bytes),
            store,
            fsm,
            consensus,
            state: RwLock::new(state),
            leadership: Mutex::new(None),
            lock_held: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Stable identity, generated on first start and reused across restarts.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> BackendState {
        *self.state.read()
    }

    pub fn latest_state(&self) -> AppliedState {
        self.fsm.latest_state()
    }

    /// One-time seeding of the initial cluster configuration. Only valid
    /// against fresh, empty local state; the very first member needs no log
    /// round-trip.
    pub fn bootstrap(
        &self,
        peers: Vec<Peer>,
    ) -> Result<()> {
        let mut state = self.state.write();
        if *state != BackendState::Unbootstrapped || !self.fsm.is_fresh()? {
            return Err(BackendError::AlreadyBootstrapped.into());
        }

        info!(?peers, "bootstrapping cluster");
        self.fsm.seed_configuration(ClusterConfiguration::new(peers))?;
        *state = BackendState::Bootstrapping;
        Ok(())
    }

    /// Start the consensus engine against the stored configuration and
    /// attach to the cluster. Peer addresses come from `resolver`, never
    /// from a hardwired mapping. After this returns, writes are accepted
    /// (subject to leadership).
    pub async fn setup_cluster(
        &self,
        resolver: Arc<dyn AddressResolver>,
    ) -> Result<()> {
        if *self.state.read() == BackendState::Ready {
            debug!("setup_cluster called twice, ignoring");
            return Ok(());
        }

        let configuration = ClusterConfiguration::clone(&self.fsm.configuration());
        self.consensus.start(configuration, resolver).await?;
        *self.leadership.lock() = Some(self.consensus.leadership_watch());
        *self.state.write() = BackendState::Ready;
        info!(node_id = %self.node_id, "cluster setup complete");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Storage backend contract

    /// Point read, served directly from the local store. May be served by a
    /// non-leader and is eventually consistent with respect to in-flight
    /// writes elsewhere in the cluster.
    pub fn get(
        &self,
        key: &str,
    ) -> Result<Option<StorageEntry>> {
        Ok(self.fsm.get(key)?.map(|value| StorageEntry {
            key: key.to_string(),
            value,
        }))
    }

    /// Folder-style key listing under `prefix`, served locally like `get`.
    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        self.fsm.list(prefix)
    }

    /// Replicate a single write. Blocks until the local FSM has applied the
    /// committed entry, so an immediate `get` on this replica observes it.
    pub async fn put(
        &self,
        entry: StorageEntry,
    ) -> Result<()> {
        self.submit_command(LogCommand::Put {
            key: entry.key,
            value: entry.value,
        })
        .await
    }

    pub async fn delete(
        &self,
        key: &str,
    ) -> Result<()> {
        self.submit_command(LogCommand::Delete { key: key.to_string() }).await
    }

    /// Replicate an ordered batch as one atomic unit. No reader on any
    /// replica ever observes a strict subset of the batch's effects.
    pub async fn transaction(
        &self,
        ops: Vec<TxnOp>,
    ) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.submit_command(LogCommand::TransactionBatch(ops)).await
    }

    // -------------------------------------------------------------------------
    // Membership

    /// Admit `peer` into the cluster via a committed membership command.
    /// Leader only. Once committed, the engine starts replicating to the new
    /// member, falling back to a full snapshot transfer when it is far behind.
    pub async fn add_peer(
        &self,
        peer: Peer,
    ) -> Result<()> {
        self.submit_command(LogCommand::MembershipChange {
            peer,
            kind: MembershipChangeKind::Add,
        })
        .await
    }

    /// Remove a peer; symmetric to [`add_peer`](Self::add_peer).
    pub async fn remove_peer(
        &self,
        peer_id: &str,
    ) -> Result<()> {
        let current = self.fsm.configuration();
        let peer = current
            .peers
            .iter()
            .find(|p| p.id == peer_id)
            .cloned()
            .unwrap_or_else(|| Peer::new(peer_id, ""));
        self.submit_command(LogCommand::MembershipChange {
            peer,
            kind: MembershipChangeKind::Remove,
        })
        .await
    }

    // -------------------------------------------------------------------------
    // HA leader lock

    /// Leadership-change notification stream for upstream active-instance
    /// selection.
    pub fn leadership_watch(&self) -> Result<watch::Receiver<LeaderState>> {
        self.leadership.lock().clone().ok_or_else(|| BackendError::NotReady.into())
    }

    /// Block until this replica becomes consensus leader or `cancel` fires.
    /// On success the HA lock is held and the returned watch signals
    /// involuntary loss of leadership.
    pub async fn lock(
        &self,
        cancel: &CancellationToken,
    ) -> Result<watch::Receiver<LeaderState>> {
        let mut rx = self.leadership_watch()?;
        loop {
            if rx.borrow_and_update().is_leader() {
                self.lock_held.store(true, Ordering::Release);
                debug!(node_id = %self.node_id, "leader lock acquired");
                return Ok(rx);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BackendError::Cancelled.into()),
                _ = self.shutdown.cancelled() => return Err(BackendError::Cancelled.into()),
                changed = rx.changed() => {
                    changed.map_err(|_| BackendError::Cancelled)?;
                }
            }
        }
    }

    /// Release the HA lock. Leadership itself is owned by the consensus
    /// engine; this only clears the local claim.
    pub fn release(&self) {
        self.lock_held.store(false, Ordering::Release);
    }

    pub fn has_leader_lock(&self) -> bool {
        if !self.lock_held.load(Ordering::Acquire) {
            return false;
        }
        match self.leadership.lock().as_ref() {
            Some(rx) => rx.borrow().is_leader(),
            None => false,
        }
    }

    // -------------------------------------------------------------------------

    /// Stop consensus background work and flush the local store. In-flight
    /// writes resolve with a cancellation error instead of hanging.
    pub async fn shutdown(&self) -> Result<()> {
        info!(node_id = %self.node_id, "shutting down backend");
        self.shutdown.cancel();
        self.consensus.shutdown().await?;
        self.store.flush()?;
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if *self.state.read() != BackendState::Ready {
            return Err(BackendError::NotReady.into());
        }
        Ok(())
    }

    async fn submit_command(
        &self,
        command: LogCommand,
    ) -> Result<()> {
        self.ensure_ready()?;
        // Size ceiling is enforced here, before any consensus interaction;
        // an oversized command never becomes a log entry.
        let bytes = self.codec.encode(&command)?;

        let position = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return Err(BackendError::Cancelled.into()),
            result = self.consensus.submit(bytes) => result?,
        };

        self.wait_for_apply(position.index).await
    }

    /// Wait until the local FSM has applied `index`, guaranteeing
    /// read-your-writes on this replica.
    async fn wait_for_apply(
        &self,
        index: u64,
    ) -> Result<()> {
        let mut rx = self.fsm.applied_watch();
        loop {
            if *rx.borrow_and_update() >= index {
                return Ok(());
            }
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Err(BackendError::Cancelled.into()),
                changed = rx.changed() => {
                    changed.map_err(|_| BackendError::Cancelled)?;
                }
            }
        }
    }
}

/// Load the persisted node identity, or generate and persist one on first
/// start.
fn load_or_create_node_id(path: &Path) -> Result<String> {
    let id_path = path.join(NODE_ID_FILE);
    match std::fs::read_to_string(&id_path) {
        Ok(id) => {
            let id = id.trim().to_string();
            if id.is_empty() {
                warn!("empty node id file at {:?}, regenerating", id_path);
            } else {
                return Ok(id);
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let id = nanoid::nanoid!();
    std::fs::write(&id_path, &id)?;
    debug!(%id, "generated node id");
    Ok(id)
}
