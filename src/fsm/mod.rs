//! The deterministic state machine.
//!
//! Applies committed log commands to the local store, one atomic cross-tree
//! transaction per committed index. The consensus engine guarantees strictly
//! increasing, duplicate-free index delivery with no concurrent invocations
//! of `apply`, so the FSM keeps no idempotency bookkeeping of its own.


use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use sled::IVec;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;

use crate::command;
use crate::constants::META_KEY_APPLIED_INDEX;
use crate::constants::META_KEY_APPLIED_TERM;
use crate::constants::META_KEY_CLUSTER_CONFIG;
use crate::convert::safe_kv;
use crate::snapshot;
use crate::ClusterConfiguration;
use crate::Error;
use crate::LocalStore;
use crate::LogCommand;
use crate::MembershipChangeKind;
use crate::Result;
use crate::SnapshotMetadata;
use crate::SnapshotSink;
use crate::SnapshotSource;
use crate::StorageError;
use crate::TxnOp;

/// Latest applied position together with the active cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedState {
    pub index: u64,
    pub term: u64,
    pub configuration: ClusterConfiguration,
}

pub struct Fsm {
    store: Arc<LocalStore>,

    /// Whether applied index/term are persisted with each apply. The cluster
    /// configuration is persisted regardless, membership must survive restarts.
    store_latest_state: bool,

    /// Volatile state: index/term of the highest applied log entry
    /// (initialized from the metadata partition, increases monotonically)
    last_applied_index: AtomicU64,
    last_applied_term: AtomicU64,

    configuration: ArcSwap<ClusterConfiguration>,

    /// Publishes the applied index so writers can wait for their own entry
    applied_tx: watch::Sender<u64>,

    /// Restore replaces the whole store; apply and export share read access,
    /// restore is exclusive
    restore_lock: RwLock<()>,
}

impl std::fmt::Debug for Fsm {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Fsm")
            .field("last_applied_index", &self.last_applied_index.load(Ordering::SeqCst))
            .finish()
    }
}

impl Fsm {
    pub fn new(
        store: Arc<LocalStore>,
        store_latest_state: bool,
    ) -> Result<Self> {
        let (index, term) = store.load_applied()?;
        let configuration = match store.load_configuration_bytes()? {
            Some(bytes) => bincode::deserialize(&bytes)?,
            None => ClusterConfiguration::default(),
        };
        debug!(%index, %term, "fsm loaded applied state");

        let (applied_tx, _) = watch::channel(index);
        Ok(Self {
            store,
            store_latest_state,
            last_applied_index: AtomicU64::new(index),
            last_applied_term: AtomicU64::new(term),
            configuration: ArcSwap::from_pointee(configuration),
            applied_tx,
            restore_lock: RwLock::new(()),
        })
    }

    /// A consistent snapshot read of `(index, term, configuration)`.
    pub fn latest_state(&self) -> AppliedState {
        let _guard = self.restore_lock.read();
        AppliedState {
            index: self.last_applied_index.load(Ordering::SeqCst),
            term: self.last_applied_term.load(Ordering::SeqCst),
            configuration: ClusterConfiguration::clone(&self.configuration.load()),
        }
    }

    pub fn configuration(&self) -> Arc<ClusterConfiguration> {
        self.configuration.load_full()
    }

    /// Subscribe to the applied-index stream.
    pub fn applied_watch(&self) -> watch::Receiver<u64> {
        self.applied_tx.subscribe()
    }

    /// Whether this replica has never held any replicated state.
    pub fn is_fresh(&self) -> Result<bool> {
        Ok(self.last_applied_index.load(Ordering::SeqCst) == 0
            && self.configuration.load().is_empty()
            && self.store.data_len() == 0)
    }

    /// Apply one committed command at `(index, term)`.
    ///
    /// Any failure here means this replica can no longer keep up with the
    /// committed log and must halt rather than skip the entry.
    pub fn apply(
        &self,
        command_bytes: &[u8],
        index: u64,
        term: u64,
    ) -> Result<()> {
        let _guard = self.restore_lock.read();

        let last_applied = self.last_applied_index.load(Ordering::SeqCst);
        if index <= last_applied {
            return Err(Error::Fatal(format!(
                "out-of-order apply: index {index} after {last_applied}, replica has diverged"
            )));
        }

        let command = command::decode_command(command_bytes)?;

        // Membership math happens outside the storage transaction; the
        // closure may retry and must stay side-effect free.
        let new_configuration = match &command {
            LogCommand::MembershipChange { peer, kind } => {
                let current = self.configuration.load();
                let updated = match kind {
                    MembershipChangeKind::Add => current.with_peer_added(peer.clone()),
                    MembershipChangeKind::Remove => current.with_peer_removed(&peer.id),
                };
                Some((updated.clone(), bincode::serialize(&updated)?))
            }
            _ => None,
        };

        let index_bytes = safe_kv(index);
        let term_bytes = safe_kv(term);
        let store_latest_state = self.store_latest_state;

        self.store.transaction(|data, meta| {
            match &command {
                LogCommand::Put { key, value } => {
                    data.insert(key.as_bytes(), value.clone())?;
                }
                LogCommand::Delete { key } => {
                    data.remove(key.as_bytes())?;
                }
                LogCommand::TransactionBatch(ops) => {
                    for op in ops {
                        match op {
                            TxnOp::Put { key, value } => {
                                data.insert(key.as_bytes(), value.clone())?;
                            }
                            TxnOp::Delete { key } => {
                                data.remove(key.as_bytes())?;
                            }
                        }
                    }
                }
                LogCommand::MembershipChange { .. } => {
                    let (_, config_bytes) = new_configuration.as_ref().expect("computed above");
                    meta.insert(META_KEY_CLUSTER_CONFIG, config_bytes.clone())?;
                }
            }
            if store_latest_state {
                meta.insert(META_KEY_APPLIED_INDEX, &index_bytes)?;
                meta.insert(META_KEY_APPLIED_TERM, &term_bytes)?;
            }
            Ok(())
        })?;

        if let Some((configuration, _)) = new_configuration {
            info!(?configuration, %index, "cluster configuration updated");
            self.configuration.store(Arc::new(configuration));
        }

        self.last_applied_index.store(index, Ordering::SeqCst);
        self.last_applied_term.store(term, Ordering::SeqCst);
        let _ = self.applied_tx.send(index);
        Ok(())
    }

    /// Seed the initial cluster configuration, bypassing the log. Only valid
    /// for the very first member of a fresh cluster.
    pub(crate) fn seed_configuration(
        &self,
        configuration: ClusterConfiguration,
    ) -> Result<()> {
        let bytes = bincode::serialize(&configuration)?;
        self.store.transaction(|_data, meta| {
            meta.insert(META_KEY_CLUSTER_CONFIG, bytes.clone())?;
            Ok(())
        })?;
        self.configuration.store(Arc::new(configuration));
        Ok(())
    }

    /// Stream a consistent point-in-time dump of FSM state.
    ///
    /// The entry set and the applied state are captured together under the
    /// exclusive guard, so nothing applied afterwards can leak into the
    /// stream. The sinks are fed only after the guard is released; a slow
    /// transfer never stalls the apply loop.
    pub fn export_snapshot(
        &self,
        metadata_sink: &mut dyn SnapshotSink,
        data_sink: &mut dyn SnapshotSink,
    ) -> Result<()> {
        let (state, entries) = self.capture_view()?;
        debug!(
            index = state.index,
            term = state.term,
            entries = entries.len(),
            "exporting snapshot"
        );

        if let Err(e) = write_streams(&state, &entries, metadata_sink, data_sink) {
            metadata_sink.abort();
            data_sink.abort();
            return Err(e);
        }
        Ok(())
    }

    /// Stable view of the FSM: applied state plus the full entry set, read
    /// while apply is briefly excluded.
    fn capture_view(&self) -> Result<(AppliedState, Vec<(IVec, IVec)>)> {
        let _guard = self.restore_lock.write();

        let state = AppliedState {
            index: self.last_applied_index.load(Ordering::SeqCst),
            term: self.last_applied_term.load(Ordering::SeqCst),
            configuration: ClusterConfiguration::clone(&self.configuration.load()),
        };
        let mut entries = Vec::with_capacity(self.store.data_len());
        for item in self.store.iter_data() {
            let (key, value) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            entries.push((key, value));
        }
        Ok((state, entries))
    }

    /// Install a snapshot, atomically replacing the store contents and the
    /// applied state. Mutually exclusive with apply and export; readers see
    /// either the old state or the new one, never a mix.
    pub fn restore_snapshot(
        &self,
        metadata_source: &mut dyn SnapshotSource,
        data_source: &mut dyn SnapshotSource,
    ) -> Result<()> {
        let _guard = self.restore_lock.write();

        let metadata: SnapshotMetadata = bincode::deserialize(&metadata_source.read_to_end()?)
            .map_err(|e| Error::Fatal(format!("malformed snapshot metadata: {e}")))?;
        let entries = snapshot::decode_entries(&data_source.read_to_end()?)?;
        info!(
            index = metadata.index,
            term = metadata.term,
            entries = entries.len(),
            "restoring snapshot"
        );

        let existing_keys = self.store.data_keys()?;
        let config_bytes = bincode::serialize(&metadata.configuration)?;
        let index_bytes = safe_kv(metadata.index);
        let term_bytes = safe_kv(metadata.term);
        let store_latest_state = self.store_latest_state;

        self.store.transaction(|data, meta| {
            for key in &existing_keys {
                data.remove(key.as_ref())?;
            }
            for (key, value) in &entries {
                data.insert(key.as_slice(), value.clone())?;
            }
            meta.insert(META_KEY_CLUSTER_CONFIG, config_bytes.clone())?;
            if store_latest_state {
                meta.insert(META_KEY_APPLIED_INDEX, &index_bytes)?;
                meta.insert(META_KEY_APPLIED_TERM, &term_bytes)?;
            }
            Ok(())
        })?;

        if let Err(e) = self.store.flush() {
            error!("flush after snapshot restore failed: {:?}", e);
            return Err(e);
        }

        self.configuration.store(Arc::new(metadata.configuration));
        self.last_applied_index.store(metadata.index, Ordering::SeqCst);
        self.last_applied_term.store(metadata.term, Ordering::SeqCst);
        let _ = self.applied_tx.send(metadata.index);
        Ok(())
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        let _guard = self.restore_lock.read();
        self.store.get(key)
    }

    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let _guard = self.restore_lock.read();
        self.store.list(prefix)
    }
}

/// Feed a captured view into the two sinks. The data stream is finalized
/// first; metadata for a snapshot only becomes durable once the entry
/// sequence it describes has been written out completely.
fn write_streams(
    state: &AppliedState,
    entries: &[(IVec, IVec)],
    metadata_sink: &mut dyn SnapshotSink,
    data_sink: &mut dyn SnapshotSink,
) -> Result<()> {
    for (key, value) in entries {
        snapshot::write_entry(data_sink, key, value)?;
    }
    data_sink.complete()?;

    let metadata = SnapshotMetadata {
        index: state.index,
        term: state.term,
        configuration: state.configuration.clone(),
    };
    metadata_sink.write_all(&bincode::serialize(&metadata)?)?;
    metadata_sink.complete()
}
