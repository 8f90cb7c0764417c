//! Catalog journal
//!
//! Every catalog mutation is appended to a single journal file before it is
//! applied in memory, and the journal is replayed when the catalog opens.
//!
//! Entry format:
//! - 4 bytes: entry length (payload + checksum)
//! - N bytes: bincode-encoded batch of changes
//! - 4 bytes: CRC32 of the payload

use super::{DataNode, SyncPolicy};
use crate::chunk::Chunk;
use crate::hypertable::HypertableRecord;
use crate::{HyperError, HypertableId, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// A single catalog mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogChange {
    PutHypertable(HypertableRecord),
    DeleteHypertable(HypertableId),
    PutChunk(Chunk),
    PutDataNode(DataNode),
}

/// Append-only catalog journal
pub struct Journal {
    path: PathBuf,
    sync_policy: SyncPolicy,
    inner: Mutex<JournalInner>,
}

struct JournalInner {
    /// `None` once a failed append could not be rolled back
    file: Option<BufWriter<File>>,
    bytes_written: u64,
    writes_since_sync: usize,
}

impl Journal {
    pub const FILE_NAME: &'static str = "catalog.journal";

    /// Open the journal in `dir`, returning it with the batches to replay.
    ///
    /// A torn entry at the end of the file is cut off; damage anywhere else
    /// is reported as corruption.
    pub fn open(dir: &Path, sync_policy: SyncPolicy) -> Result<(Self, Vec<Vec<CatalogChange>>)> {
        fs::create_dir_all(dir)?;
        let path = dir.join(Self::FILE_NAME);

        let (batches, valid_len) = if path.exists() {
            Self::replay(&fs::read(&path)?)?
        } else {
            (Vec::new(), 0)
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        file.set_len(valid_len)?;
        file.seek(SeekFrom::End(0))?;

        if !batches.is_empty() {
            info!("Recovered {} catalog journal entries from {:?}", batches.len(), path);
        }

        let journal = Self {
            path,
            sync_policy,
            inner: Mutex::new(JournalInner {
                file: Some(BufWriter::new(file)),
                bytes_written: valid_len,
                writes_since_sync: 0,
            }),
        };
        Ok((journal, batches))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of valid journal content
    pub fn size(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    /// Append one atomic batch of changes.
    ///
    /// Each entry is handed to the OS before returning. If the write, flush
    /// or sync fails the file is cut back to the previous entry, so a change
    /// reported as failed is never replayed.
    pub fn append(&self, batch: &[CatalogChange]) -> Result<()> {
        let encoded = Self::encode(batch)?;
        let mut inner = self.inner.lock();
        let sync = self.should_sync(inner.writes_since_sync + 1);

        if let Err(e) = Self::write_entry(&mut inner, &encoded, sync) {
            Self::rollback(&mut inner);
            return Err(e);
        }

        inner.bytes_written += encoded.len() as u64;
        inner.writes_since_sync = if sync { 0 } else { inner.writes_since_sync + 1 };
        Ok(())
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let writer = Self::writer(&mut inner)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    fn should_sync(&self, pending: usize) -> bool {
        match self.sync_policy {
            SyncPolicy::Immediate => true,
            SyncPolicy::EveryN(n) => pending >= n,
            SyncPolicy::None => false,
        }
    }

    fn writer(inner: &mut JournalInner) -> Result<&mut BufWriter<File>> {
        inner.file.as_mut().ok_or_else(|| {
            HyperError::Internal("catalog journal is closed after a failed rollback".into())
        })
    }

    fn write_entry(inner: &mut JournalInner, encoded: &[u8], sync: bool) -> Result<()> {
        let writer = Self::writer(inner)?;
        writer.write_all(encoded)?;
        writer.flush()?;
        if sync {
            writer.get_ref().sync_all()?;
        }
        Ok(())
    }

    /// Truncate to the last complete entry, dropping buffered bytes
    fn rollback(inner: &mut JournalInner) {
        let Some(writer) = inner.file.take() else {
            return;
        };
        let (mut file, _unwritten) = writer.into_parts();
        let restored = file
            .set_len(inner.bytes_written)
            .and_then(|_| file.seek(SeekFrom::End(0)));
        match restored {
            Ok(_) => {
                warn!("Rolled catalog journal back to {} bytes", inner.bytes_written);
                inner.file = Some(BufWriter::new(file));
            }
            Err(e) => error!("Failed to roll back catalog journal, closing it: {}", e),
        }
    }

    /// Serialize a batch with length prefix and CRC checksum
    pub fn encode(batch: &[CatalogChange]) -> Result<Bytes> {
        let payload =
            bincode::serialize(batch).map_err(|e| HyperError::InvalidFormat(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(payload.len() + 8);
        buf.put_u32_le((payload.len() + 4) as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));
        Ok(buf.freeze())
    }

    /// Deserialize one entry, validating its checksum.
    ///
    /// Returns `Ok(None)` when `data` ends before the entry does.
    pub fn decode(data: &[u8]) -> Result<Option<(Vec<CatalogChange>, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let mut cursor = data;
        let len = cursor.get_u32_le() as usize;
        if len < 4 {
            return Err(HyperError::InvalidFormat(format!("journal entry length {} too short", len)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let entry = &data[4..4 + len];
        let (payload, mut checksum) = entry.split_at(len - 4);
        let expected = checksum.get_u32_le();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(HyperError::ChecksumMismatch { expected, actual });
        }

        let batch = bincode::deserialize(payload)
            .map_err(|e| HyperError::Corruption(format!("undecodable journal entry: {}", e)))?;
        Ok(Some((batch, 4 + len)))
    }

    fn replay(data: &[u8]) -> Result<(Vec<Vec<CatalogChange>>, u64)> {
        let mut batches = Vec::new();
        let mut offset = 0usize;

        while offset < data.len() {
            match Self::decode(&data[offset..]) {
                Ok(Some((batch, len))) => {
                    batches.push(batch);
                    offset += len;
                }
                Ok(None) => {
                    warn!(
                        "Discarding torn catalog journal tail ({} bytes at offset {})",
                        data.len() - offset,
                        offset
                    );
                    break;
                }
                Err(HyperError::ChecksumMismatch { expected, actual }) => {
                    let declared = (&data[offset..offset + 4]).get_u32_le() as usize;
                    if offset + 4 + declared == data.len() {
                        warn!("Discarding catalog journal tail with bad checksum at offset {}", offset);
                        break;
                    }
                    return Err(HyperError::ChecksumMismatch { expected, actual });
                }
                Err(e) => return Err(e),
            }
        }

        Ok((batches, offset as u64))
    }
}
