//! Log command codec.
//!
//! Every write intent is encoded into a log-command payload before it is
//! handed to the consensus engine, and decoded back on the apply path. The
//! codec enforces a per-instance size ceiling up front, so an oversized write
//! is rejected before it ever becomes a log entry.


use serde::Deserialize;
use serde::Serialize;

use crate::BackendError;
use crate::Error;
use crate::Peer;
use crate::Result;

/// A single operation inside a transactional batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChangeKind {
    Add,
    Remove,
}

/// A committed write operation as it appears in the replicated log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogCommand {
    Put {
        key: String,
        value: Vec<u8>,
    },
    Delete {
        key: String,
    },
    /// Ordered operations applied as one atomic unit
    TransactionBatch(Vec<TxnOp>),
    MembershipChange {
        peer: Peer,
        kind: MembershipChangeKind,
    },
}

/// Encodes write intents with a per-instance size ceiling.
///
/// The limit is construction-time state, never a process-wide global, so two
/// backend instances in one process can carry different ceilings.
#[derive(Debug, Clone)]
pub struct CommandCodec {
    max_command_size_bytes: usize,
}

impl CommandCodec {
    pub fn new(max_command_size_bytes: usize) -> Self {
        Self { max_command_size_bytes }
    }

    pub fn max_command_size_bytes(&self) -> usize {
        self.max_command_size_bytes
    }

    /// Serialize `command`, rejecting payloads at or above the ceiling before
    /// any consensus interaction.
    pub fn encode(
        &self,
        command: &LogCommand,
    ) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(command)?;
        if bytes.len() >= self.max_command_size_bytes {
            return Err(BackendError::CommandTooLarge {
                size: bytes.len(),
                limit: self.max_command_size_bytes,
            }
            .into());
        }
        Ok(bytes)
    }
}

/// Decode a committed command on the apply path.
///
/// Malformed bytes here mean a committed entry this replica cannot interpret.
/// That is a protocol-level bug with divergence risk, so it surfaces as a
/// fatal error rather than a retryable one.
pub fn decode_command(bytes: &[u8]) -> Result<LogCommand> {
    bincode::deserialize(bytes).map_err(|e| Error::Fatal(format!("malformed committed command: {e}")))
}
