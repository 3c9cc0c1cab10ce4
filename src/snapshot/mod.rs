//! Snapshot transfer capabilities.
//!
//! A snapshot is streamed as two independent byte streams: a metadata stream
//! (applied index, term, serialized cluster configuration) and a data stream
//! (the ordered entry sequence). Each output capability offers "write bytes"
//! plus explicit completion/failure signaling, so a large data payload can be
//! streamed without buffering the whole snapshot in memory.


use std::fs;
use std::io::BufWriter;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::ClusterConfiguration;
use crate::Result;
use crate::StorageError;

/// Point-in-time identity of an exported snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub configuration: ClusterConfiguration,
}

/// Byte-stream output capability for snapshot export.
pub trait SnapshotSink: Send {
    fn write_all(
        &mut self,
        buf: &[u8],
    ) -> Result<()>;

    /// Signal that the stream is complete and must be made durable.
    fn complete(&mut self) -> Result<()>;

    /// Signal failure; partial output must not be observable afterwards.
    fn abort(&mut self);
}

/// Byte-stream input capability for snapshot restore, symmetric to
/// [`SnapshotSink`].
pub trait SnapshotSource: Send {
    fn read_to_end(&mut self) -> Result<Vec<u8>>;
}

// -----------------------------------------------------------------------------
// Entry framing: u32-LE key length, key bytes, u32-LE value length, value bytes.

pub(crate) fn write_entry(
    sink: &mut dyn SnapshotSink,
    key: &[u8],
    value: &[u8],
) -> Result<()> {
    sink.write_all(&(key.len() as u32).to_le_bytes())?;
    sink.write_all(key)?;
    sink.write_all(&(value.len() as u32).to_le_bytes())?;
    sink.write_all(value)?;
    Ok(())
}

pub(crate) fn decode_entries(bytes: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    let corrupted = || StorageError::DataCorruption {
        location: "snapshot data stream".to_string(),
    };

    while offset < bytes.len() {
        let key = read_frame(bytes, &mut offset).ok_or_else(corrupted)?;
        let value = read_frame(bytes, &mut offset).ok_or_else(corrupted)?;
        entries.push((key, value));
    }
    Ok(entries)
}

fn read_frame(
    bytes: &[u8],
    offset: &mut usize,
) -> Option<Vec<u8>> {
    let len_end = offset.checked_add(4)?;
    let len = u32::from_le_bytes(bytes.get(*offset..len_end)?.try_into().ok()?) as usize;
    let end = len_end.checked_add(len)?;
    let frame = bytes.get(len_end..end)?.to_vec();
    *offset = end;
    Some(frame)
}

// -----------------------------------------------------------------------------
// Sink/source implementations

/// In-memory sink, used as transfer staging between replicas in one process.
#[derive(Debug, Default)]
pub struct VecSink {
    buffer: Vec<u8>,
    completed: bool,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// The collected stream; only valid after `complete()`.
    pub fn into_inner(self) -> Vec<u8> {
        debug_assert!(self.completed, "reading an incomplete snapshot stream");
        self.buffer
    }
}

impl SnapshotSink for VecSink {
    fn write_all(
        &mut self,
        buf: &[u8],
    ) -> Result<()> {
        self.buffer.extend_from_slice(buf);
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        self.completed = true;
        Ok(())
    }

    fn abort(&mut self) {
        self.buffer.clear();
    }
}

#[derive(Debug)]
pub struct VecSource {
    buffer: Vec<u8>,
}

impl VecSource {
    pub fn new(buffer: Vec<u8>) -> Self {
        Self { buffer }
    }
}

impl SnapshotSource for VecSource {
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.buffer))
    }
}

/// Discards everything. Useful to measure export throughput without sink cost.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl SnapshotSink for DiscardSink {
    fn write_all(
        &mut self,
        _buf: &[u8],
    ) -> Result<()> {
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {}
}

/// File-backed sink writing through a temporary file, renamed into place on
/// `complete()` so a crashed export never leaves a half-written snapshot
/// behind under the final name.
pub struct FileSnapshotSink {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: Option<BufWriter<fs::File>>,
}

impl FileSnapshotSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");
        let file = fs::File::create(&tmp_path)?;
        Ok(Self {
            final_path,
            tmp_path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn writer(&mut self) -> Result<&mut BufWriter<fs::File>> {
        self.writer.as_mut().ok_or_else(|| {
            StorageError::Snapshot(format!("snapshot sink {:?} already finalized", self.final_path)).into()
        })
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn write_all(
        &mut self,
        buf: &[u8],
    ) -> Result<()> {
        self.writer()?.write_all(buf).map_err(StorageError::IoError)?;
        Ok(())
    }

    fn complete(&mut self) -> Result<()> {
        let mut writer = self.writer.take().ok_or_else(|| {
            StorageError::Snapshot(format!("snapshot sink {:?} already finalized", self.final_path))
        })?;
        writer.flush().map_err(StorageError::IoError)?;
        writer.get_ref().sync_all().map_err(StorageError::IoError)?;
        drop(writer);
        fs::rename(&self.tmp_path, &self.final_path).map_err(StorageError::IoError)?;
        Ok(())
    }

    fn abort(&mut self) {
        self.writer = None;
        if let Err(e) = fs::remove_file(&self.tmp_path) {
            warn!("failed to remove aborted snapshot file {:?}: {}", self.tmp_path, e);
        }
    }
}

pub struct FileSnapshotSource {
    path: PathBuf,
}

impl FileSnapshotSource {
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SnapshotSource for FileSnapshotSource {
    fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        fs::File::open(&self.path)?.read_to_end(&mut buffer).map_err(StorageError::IoError)?;
        Ok(buffer)
    }
}
