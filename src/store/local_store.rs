//! Embedded ordered key-value engine backing the FSM.
//!
//! Two logical partitions live in one sled database: `_kv_data` holds user
//! entries, `_kv_meta` holds the applied index/term and the serialized cluster
//! configuration. Every data mutation commits in the same cross-tree
//! transaction as the applied-state record it belongs to, so the two are
//! never observably out of sync, even across a crash.
//!
//! The only write path into the data partition is `Fsm::apply`; everything
//! else gets read access.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use sled::transaction::ConflictableTransactionResult;
use sled::transaction::TransactionError;
use sled::transaction::Transactional;
use sled::transaction::TransactionalTree;
use sled::IVec;
use tracing::error;

use crate::constants::DATA_TREE;
use crate::constants::META_KEY_APPLIED_INDEX;
use crate::constants::META_KEY_APPLIED_TERM;
use crate::constants::META_KEY_CLUSTER_CONFIG;
use crate::constants::META_TREE;
use crate::convert::safe_vk;
use crate::Error;
use crate::Result;
use crate::StorageError;

/// A stored key/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageEntry {
    pub key: String,
    pub value: Vec<u8>,
}

impl StorageEntry {
    pub fn new(
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

pub struct LocalStore {
    db: Arc<sled::Db>,
    data: sled::Tree,
    meta: sled::Tree,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("LocalStore").field("data_len", &self.data.len()).finish()
    }
}

impl LocalStore {
    pub fn open(db: Arc<sled::Db>) -> Result<Self> {
        let data = db.open_tree(DATA_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        Ok(Self { db, data, meta })
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Result<Option<Vec<u8>>> {
        match self.data.get(key.as_bytes()) {
            Ok(Some(v)) => Ok(Some(v.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => {
                error!("local store get error: {}", e);
                Err(StorageError::DbError(e.to_string()).into())
            }
        }
    }

    /// Folder-style listing: keys under `prefix`, relative to it, truncated
    /// after the first `/` and deduplicated. `scan_prefix` returns keys in
    /// order, so adjacent-duplicate suppression is enough.
    pub fn list(
        &self,
        prefix: &str,
    ) -> Result<Vec<String>> {
        let mut keys: Vec<String> = Vec::new();
        for item in self.data.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            let key = std::str::from_utf8(&key).map_err(|_| StorageError::DataCorruption {
                location: format!("non-utf8 key under prefix {prefix:?}"),
            })?;

            let relative = &key[prefix.len()..];
            let entry = match relative.find('/') {
                Some(i) => &relative[..=i],
                None => relative,
            };
            if entry.is_empty() {
                continue;
            }
            if keys.last().map(String::as_str) != Some(entry) {
                keys.push(entry.to_string());
            }
        }
        Ok(keys)
    }

    /// Atomic read-write transaction spanning the data and metadata trees.
    pub(crate) fn transaction<R, F>(
        &self,
        f: F,
    ) -> Result<R>
    where
        F: Fn(&TransactionalTree, &TransactionalTree) -> ConflictableTransactionResult<R, Error>,
    {
        (&self.data, &self.meta)
            .transaction(|(data, meta)| f(data, meta))
            .map_err(|e| match e {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(e) => StorageError::DbError(e.to_string()).into(),
            })
    }

    /// (applied_index, applied_term) from the metadata partition.
    pub(crate) fn load_applied(&self) -> Result<(u64, u64)> {
        let index = self.meta.get(META_KEY_APPLIED_INDEX)?.map(safe_vk).unwrap_or(Ok(0))?;
        let term = self.meta.get(META_KEY_APPLIED_TERM)?.map(safe_vk).unwrap_or(Ok(0))?;
        Ok((index, term))
    }

    /// Serialized cluster configuration, if one has been seeded or replicated.
    pub(crate) fn load_configuration_bytes(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.meta.get(META_KEY_CLUSTER_CONFIG)?.map(|v| v.to_vec()))
    }

    pub(crate) fn iter_data(&self) -> sled::Iter {
        self.data.iter()
    }

    /// All keys currently in the data partition. Used by snapshot restore to
    /// compute the delete set before the replacement transaction.
    pub(crate) fn data_keys(&self) -> Result<Vec<IVec>> {
        let mut keys = Vec::new();
        for item in self.data.iter() {
            let (key, _) = item.map_err(|e| StorageError::DbError(e.to_string()))?;
            keys.push(key);
        }
        Ok(keys)
    }

    pub(crate) fn data_len(&self) -> usize {
        self.data.len()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(|e| StorageError::DbError(e.to_string()))?;
        Ok(())
    }
}
